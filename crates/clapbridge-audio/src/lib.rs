//! Pumps that move audio between an OS device and a fixed-block host.
//!
//! A [`StreamSession`] owns one device stream and one pump:
//! - capture sessions run a [`CapturePump`] that fills a frame ring buffer,
//!   either inline from the host callback or from a dedicated thread
//! - render sessions run a [`RenderPump`] that writes host blocks into the
//!   device, gated by padding and a one-time playback start
//!
//! Nothing reachable from [`StreamSession::produce`] or
//! [`StreamSession::consume`] allocates, blocks or logs.

pub mod capture;
pub mod config;
pub mod render;
pub mod session;
mod stats;

pub use capture::{CaptureKind, CapturePump};
pub use config::{BridgeConfig, ConfigError, PumpTuning};
pub use render::{RenderFlowState, RenderPump, RenderReport};
pub use session::{ProduceStatus, SessionError, SessionState, StreamSession};
pub use stats::PumpStats;

use std::fmt;

/// How captured packets reach the ring buffer.
///
/// Chosen once per activation and fixed until deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpMode {
    /// Drained synchronously from the host callback
    InlinePoll,
    /// Drained by a background thread woken by the device
    Threaded,
}

impl fmt::Display for PumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InlinePoll => f.write_str("inline-poll"),
            Self::Threaded => f.write_str("threaded"),
        }
    }
}
