//! Auto-reset wake event.
//!
//! The device side signals it whenever a packet is ready; a background pump
//! thread blocks on it. Signals coalesce: any number of `signal()` calls
//! before a `wait()` wake the waiter once.

use crossbeam_channel::{Receiver, Sender, TrySendError};
#[cfg(test)]
use std::time::Duration;

/// Cloneable handle to one auto-reset event.
#[derive(Debug, Clone)]
pub struct WakeEvent {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WakeEvent {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self { tx, rx }
    }

    /// Set the event. Never blocks, so it is safe from a device callback.
    ///
    /// Returns `false` if the event was already set.
    pub fn signal(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(()) | TrySendError::Disconnected(())) => false,
        }
    }

    /// Block until the event is set, then reset it.
    pub fn wait(&self) {
        // Both ends live in `self`, so the channel can't disconnect
        let _ = self.rx.recv();
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns whether the event was set.
    #[cfg(test)]
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Whether the event is currently set (does not reset it)
    #[cfg(test)]
    pub(crate) fn is_set(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Default for WakeEvent {
    fn default() -> Self {
        Self::new()
    }
}
