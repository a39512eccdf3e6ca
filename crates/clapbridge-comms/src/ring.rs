//! Fixed-capacity FIFO of stereo frames.
//!
//! The buffer is backed by an `rtrb` ring, so it can either be used whole on
//! one thread or split into a [`FrameWriter`] and a [`FrameReader`] that each
//! own their side's cursor. No locking happens in either case.

use clapbridge_core::{Frame, Frames};
use rtrb::{Consumer, Producer, RingBuffer};

/// Something frames can be pushed into.
pub trait FrameSink {
    /// Total number of frames the sink can hold
    fn capacity(&self) -> Frames;

    /// Number of frames that can be pushed before the sink is full
    fn free_len(&self) -> Frames;

    /// Push one frame. A full sink hands the frame back.
    fn push_back(&mut self, frame: Frame) -> Result<(), Frame>;
}

/// Something frames can be popped from, oldest first.
pub trait FrameSource {
    /// Number of frames ready to pop
    fn len(&self) -> Frames;

    /// Pop the oldest frame
    fn pop_front(&mut self) -> Option<Frame>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop exactly `left.len()` frames into the two channel slices.
    ///
    /// Nothing is popped unless the whole block is available. Returns whether
    /// the block was filled.
    fn pop_block(&mut self, left: &mut [f32], right: &mut [f32]) -> bool {
        let frames = left.len().min(right.len());
        if self.len() < frames {
            return false;
        }
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let Some(frame) = self.pop_front() else {
                return false;
            };
            *l = frame.left;
            *r = frame.right;
        }
        true
    }
}

/// Producer half of a split [`FrameRingBuffer`].
pub struct FrameWriter {
    producer: Producer<Frame>,
}

/// Consumer half of a split [`FrameRingBuffer`].
pub struct FrameReader {
    consumer: Consumer<Frame>,
}

/// Circular store of stereo frames with a capacity fixed at construction.
///
/// Invariant: `0 <= len() <= capacity()`. Pushing into a full buffer is
/// rejected rather than overwriting, and popping an empty buffer is a caller
/// bug (debug-asserted).
pub struct FrameRingBuffer {
    writer: FrameWriter,
    reader: FrameReader,
}

impl FrameRingBuffer {
    /// Allocate a buffer of `capacity` frames.
    ///
    /// A zero-capacity buffer is valid: it is both full and empty.
    #[must_use]
    pub fn new(capacity: Frames) -> Self {
        let (producer, consumer) = RingBuffer::new(capacity);
        Self {
            writer: FrameWriter { producer },
            reader: FrameReader { consumer },
        }
    }

    /// Capacity needed to absorb one full cycle of jitter in either direction.
    #[must_use]
    pub fn capacity_for(device_buffer_frames: Frames, host_max_block_frames: Frames) -> Frames {
        device_buffer_frames.max(host_max_block_frames) * 2
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.writer.free_len() == 0
    }

    /// Hand the buffer to two threads: one sole writer, one sole reader.
    #[must_use]
    pub fn split(self) -> (FrameWriter, FrameReader) {
        (self.writer, self.reader)
    }
}

impl FrameSink for FrameRingBuffer {
    fn capacity(&self) -> Frames {
        self.writer.capacity()
    }

    fn free_len(&self) -> Frames {
        self.writer.free_len()
    }

    fn push_back(&mut self, frame: Frame) -> Result<(), Frame> {
        self.writer.push_back(frame)
    }
}

impl FrameSource for FrameRingBuffer {
    fn len(&self) -> Frames {
        self.reader.len()
    }

    fn pop_front(&mut self) -> Option<Frame> {
        self.reader.pop_front()
    }

    fn pop_block(&mut self, left: &mut [f32], right: &mut [f32]) -> bool {
        self.reader.pop_block(left, right)
    }
}

impl FrameSink for FrameWriter {
    fn capacity(&self) -> Frames {
        self.producer.buffer().capacity()
    }

    fn free_len(&self) -> Frames {
        self.producer.slots()
    }

    fn push_back(&mut self, frame: Frame) -> Result<(), Frame> {
        self.producer.push(frame).map_err(|_| frame)
    }
}

impl FrameReader {
    #[must_use]
    pub fn capacity(&self) -> Frames {
        self.consumer.buffer().capacity()
    }
}

impl FrameSource for FrameReader {
    fn len(&self) -> Frames {
        self.consumer.slots()
    }

    fn pop_front(&mut self) -> Option<Frame> {
        debug_assert!(self.consumer.slots() > 0, "pop_front on an empty frame buffer");
        self.consumer.pop().ok()
    }

    fn pop_block(&mut self, left: &mut [f32], right: &mut [f32]) -> bool {
        let frames = left.len().min(right.len());
        let Ok(chunk) = self.consumer.read_chunk(frames) else {
            return false;
        };
        for ((frame, l), r) in chunk.into_iter().zip(left.iter_mut()).zip(right.iter_mut()) {
            *l = frame.left;
            *r = frame.right;
        }
        true
    }
}
