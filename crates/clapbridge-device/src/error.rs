//! Device-level errors.

use clapbridge_core::Frames;

/// Errors reported by a [`DeviceBackend`](crate::DeviceBackend) or one of its clients
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("Stream is not initialized")]
    NotInitialized,

    #[error("Stream is already initialized")]
    AlreadyInitialized,

    #[error("Stream was not initialized for event-driven buffering")]
    NotEventDriven,

    #[error("Stream is running")]
    NotStopped,

    #[error("Requested {requested} frames but only {available} are free")]
    BufferTooLarge { requested: Frames, available: Frames },

    #[error("Buffer calls out of order: {0}")]
    OutOfOrder(&'static str),

    #[error("Device backend error: {0}")]
    Backend(String),
}
