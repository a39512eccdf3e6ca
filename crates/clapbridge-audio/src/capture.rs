//! Capture pump: device packets into a frame ring buffer.

use crate::stats::PumpCounters;
use crate::{PumpMode, PumpTuning};
use clapbridge_comms::{
    FrameReader, FrameRingBuffer, FrameSink, FrameSource, FrameWriter, WakeEvent,
};
use clapbridge_core::{Frame, Frames, NUM_CHANNELS};
use clapbridge_device::{CaptureService, Endpoint};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Kind of capture endpoint, which decides when a thread is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// An input device such as a microphone
    Input,
    /// System or process loopback
    Loopback,
}

impl CaptureKind {
    /// `None` for render endpoints
    #[must_use]
    pub const fn of(endpoint: &Endpoint) -> Option<Self> {
        match endpoint {
            Endpoint::Input(_) => Some(Self::Input),
            Endpoint::Loopback(_) => Some(Self::Loopback),
            Endpoint::Output(_) => None,
        }
    }

    /// Pick the pump mode for a measured device buffer.
    ///
    /// Loopback endpoints only hold a few packets, so they go threaded as soon
    /// as that many buffers no longer cover one host block. Input devices go
    /// threaded when one buffer is shorter than a host block.
    #[must_use]
    pub fn mode_for(
        self,
        device_buffer_frames: Frames,
        host_max_block_frames: Frames,
        tuning: &PumpTuning,
    ) -> PumpMode {
        let covered = match self {
            Self::Input => device_buffer_frames,
            Self::Loopback => device_buffer_frames * tuning.loopback_packet_multiple,
        };
        if covered < host_max_block_frames {
            PumpMode::Threaded
        } else {
            PumpMode::InlinePoll
        }
    }
}

/// Move one device packet into `sink`.
///
/// Returns the packet size, 0 when the device had nothing or failed. Frames
/// that don't fit are dropped and counted.
///
/// REAL-TIME SAFE: no allocation, no logging.
pub(crate) fn drain_packet(
    capture: &mut dyn CaptureService,
    sink: &mut impl FrameSink,
    counters: &PumpCounters,
) -> Frames {
    match capture.next_packet_size() {
        Ok(0) => return 0,
        Ok(_) => {}
        Err(_) => {
            counters.device_error();
            return 0;
        }
    }

    let (frames, pushed) = {
        let packet = match capture.get_buffer() {
            Ok(packet) => packet,
            Err(_) => {
                counters.device_error();
                return 0;
            }
        };
        let frames = packet.frames();
        let room = sink.free_len().min(frames);
        for chunk in packet.data.chunks_exact(NUM_CHANNELS).take(room) {
            // Room was checked above, a rejected frame can't happen
            let _ = sink.push_back(Frame::from_interleaved(chunk));
        }
        (frames, room)
    };

    if capture.release_buffer(frames).is_err() {
        counters.device_error();
    }
    counters.captured(pushed, frames - pushed, sink.capacity() - sink.free_len());
    frames
}

/// Background thread that drains one packet per wake.
struct CaptureWorker {
    wake: WakeEvent,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    fn spawn(
        mut capture: Box<dyn CaptureService>,
        mut writer: FrameWriter,
        wake: WakeEvent,
        counters: Arc<PumpCounters>,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_wake = wake.clone();
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("clapbridge-capture-pump".to_string())
            .spawn(move || {
                tracing::debug!("Capture thread started");
                loop {
                    thread_wake.wait();
                    // Shutdown is checked before the device is touched
                    if thread_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    drain_packet(capture.as_mut(), &mut writer, &counters);
                }
                drop(capture);
                tracing::debug!("Capture thread exiting");
            })?;

        Ok(Self {
            wake,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Set the flag, wake the thread and join it. Idempotent.
    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        self.wake.signal();
        if handle.join().is_err() {
            tracing::error!("Capture thread panicked");
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum CaptureDriver {
    InlinePoll {
        capture: Box<dyn CaptureService>,
        buffer: FrameRingBuffer,
    },
    Threaded {
        reader: FrameReader,
        worker: CaptureWorker,
    },
}

/// Fills a frame ring buffer from a capture service.
pub struct CapturePump {
    driver: CaptureDriver,
    capacity: Frames,
    counters: Arc<PumpCounters>,
}

impl CapturePump {
    /// Pump drained from the host callback itself.
    pub(crate) fn inline(
        capture: Box<dyn CaptureService>,
        capacity: Frames,
        counters: Arc<PumpCounters>,
    ) -> Self {
        Self {
            driver: CaptureDriver::InlinePoll {
                capture,
                buffer: FrameRingBuffer::new(capacity),
            },
            capacity,
            counters,
        }
    }

    /// Pump drained by a thread woken through `wake`.
    ///
    /// The capture service moves to the thread and is dropped there on
    /// shutdown.
    pub(crate) fn threaded(
        capture: Box<dyn CaptureService>,
        capacity: Frames,
        wake: WakeEvent,
        counters: Arc<PumpCounters>,
    ) -> std::io::Result<Self> {
        let (writer, reader) = FrameRingBuffer::new(capacity).split();
        let worker = CaptureWorker::spawn(capture, writer, wake, Arc::clone(&counters))?;
        Ok(Self {
            driver: CaptureDriver::Threaded { reader, worker },
            capacity,
            counters,
        })
    }

    #[must_use]
    pub const fn mode(&self) -> PumpMode {
        match self.driver {
            CaptureDriver::InlinePoll { .. } => PumpMode::InlinePoll,
            CaptureDriver::Threaded { .. } => PumpMode::Threaded,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> Frames {
        self.capacity
    }

    /// Frames ready for the host
    #[must_use]
    pub fn buffered(&self) -> Frames {
        match &self.driver {
            CaptureDriver::InlinePoll { buffer, .. } => buffer.len(),
            CaptureDriver::Threaded { reader, .. } => reader.len(),
        }
    }

    /// Fill one host block, draining the device first in inline mode.
    ///
    /// Returns `false` and leaves the buffer untouched when fewer than
    /// `left.len()` frames are available.
    ///
    /// REAL-TIME SAFE: no allocation, no logging, no blocking.
    pub fn produce(&mut self, left: &mut [f32], right: &mut [f32]) -> bool {
        let frames = left.len().min(right.len());
        let delivered = match &mut self.driver {
            CaptureDriver::InlinePoll { capture, buffer } => {
                // Bounded by the device running out of packets
                while buffer.len() < frames {
                    if drain_packet(capture.as_mut(), buffer, &self.counters) == 0 {
                        break;
                    }
                }
                buffer.pop_block(left, right)
            }
            CaptureDriver::Threaded { reader, .. } => reader.pop_block(left, right),
        };
        self.counters.delivered(delivered);
        delivered
    }

    /// Stop the capture thread, if any. The pump delivers nothing new after.
    pub fn shutdown(&mut self) {
        if let CaptureDriver::Threaded { worker, .. } = &mut self.driver {
            worker.shutdown();
        }
    }
}
