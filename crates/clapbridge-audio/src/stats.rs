//! Lock-free pump counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of what the pumps have done since activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Frames pushed into the ring buffer
    pub frames_captured: u64,
    /// Captured frames dropped because the ring buffer was full
    pub frames_dropped: u64,
    /// Largest ring buffer fill seen by the writer
    pub peak_buffered: u64,
    /// Host blocks filled from the ring buffer
    pub blocks_delivered: u64,
    /// Host blocks that found too few frames
    pub blocks_pending: u64,
    /// Frames handed to the render device
    pub frames_rendered: u64,
    /// Host frames discarded because the render buffer had no room
    pub frames_render_dropped: u64,
    /// Device calls that failed while pumping
    pub device_errors: u64,
}

/// Shared between the host thread and the capture thread
#[derive(Debug, Default)]
pub(crate) struct PumpCounters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    peak_buffered: AtomicU64,
    blocks_delivered: AtomicU64,
    blocks_pending: AtomicU64,
    frames_rendered: AtomicU64,
    frames_render_dropped: AtomicU64,
    device_errors: AtomicU64,
}

fn bump(counter: &AtomicU64, amount: usize) {
    if amount > 0 {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }
}

impl PumpCounters {
    pub(crate) fn captured(&self, pushed: usize, dropped: usize, buffered: usize) {
        bump(&self.frames_captured, pushed);
        bump(&self.frames_dropped, dropped);
        self.peak_buffered
            .fetch_max(buffered as u64, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self, delivered: bool) {
        if delivered {
            bump(&self.blocks_delivered, 1);
        } else {
            bump(&self.blocks_pending, 1);
        }
    }

    pub(crate) fn rendered(&self, sent: usize, dropped: usize) {
        bump(&self.frames_rendered, sent);
        bump(&self.frames_render_dropped, dropped);
    }

    pub(crate) fn device_error(&self) {
        bump(&self.device_errors, 1);
    }

    pub(crate) fn snapshot(&self) -> PumpStats {
        PumpStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            peak_buffered: self.peak_buffered.load(Ordering::Relaxed),
            blocks_delivered: self.blocks_delivered.load(Ordering::Relaxed),
            blocks_pending: self.blocks_pending.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_render_dropped: self.frames_render_dropped.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
        }
    }
}
