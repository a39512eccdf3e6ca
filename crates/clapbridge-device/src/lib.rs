//! Device model the pumps are written against.
//!
//! The model follows a shared-mode OS audio client: a client is opened for an
//! [`Endpoint`], initialized once with a format, flags and a requested buffer
//! duration, and then hands out a capture or render service that moves
//! packets of interleaved stereo float frames. Requested durations are a hint
//! only; callers must read back [`AudioClient::buffer_size`].
//!
//! Two backends implement the model:
//! - [`sim`]: a deterministic in-process device, used by tests and demos
//! - [`cpal_backend`]: real devices through cpal

pub mod cpal_backend;
pub mod endpoint;
pub mod error;
pub mod sim;

pub use cpal_backend::CpalBackend;
pub use endpoint::{DeviceId, DeviceInfo, Direction, Endpoint, LoopbackMode, LoopbackTarget};
pub use error::DeviceError;

use clapbridge_comms::WakeEvent;
use clapbridge_core::{Frames, Sample, StreamFormat};
use std::time::Duration;

/// Flags passed to [`AudioClient::initialize`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// Capture what the endpoint is playing instead of what it records
    pub loopback: bool,
    /// Signal an event handle whenever a packet is ready
    pub event_driven: bool,
}

/// Per-packet status bits reported by a capture service.
///
/// The pumps carry these through but do not act on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    pub silent: bool,
    pub discontinuity: bool,
    pub timestamp_error: bool,
}

/// One captured packet, borrowed from the device until released.
#[derive(Debug)]
pub struct CapturePacket<'a> {
    /// Interleaved stereo samples
    pub data: &'a [Sample],
    pub flags: PacketFlags,
}

impl CapturePacket<'_> {
    #[must_use]
    pub fn frames(&self) -> Frames {
        self.data.len() / clapbridge_core::NUM_CHANNELS
    }
}

/// A stream on one endpoint.
pub trait AudioClient: Send {
    /// Open the stream. May only be called once per client.
    fn initialize(
        &mut self,
        format: StreamFormat,
        flags: StreamFlags,
        buffer_duration: Duration,
    ) -> Result<(), DeviceError>;

    /// Actual buffer size in frames, which may differ from what was requested
    fn buffer_size(&self) -> Result<Frames, DeviceError>;

    /// Frames queued in the endpoint buffer and not yet consumed
    fn current_padding(&self) -> Result<Frames, DeviceError>;

    /// Install the event signalled on each packet. Requires `event_driven`.
    fn set_event_handle(&mut self, event: WakeEvent) -> Result<(), DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Discard everything queued. The stream must be stopped.
    fn reset(&mut self) -> Result<(), DeviceError>;

    fn capture_service(&mut self) -> Result<Box<dyn CaptureService>, DeviceError>;

    fn render_service(&mut self) -> Result<Box<dyn RenderService>, DeviceError>;
}

/// Reads packets from a capture stream.
///
/// None of these calls block: an empty device reports a zero packet size.
pub trait CaptureService: Send {
    /// Frames in the next packet, or 0 when nothing is ready
    fn next_packet_size(&mut self) -> Result<Frames, DeviceError>;

    /// Borrow the next packet. Must be followed by [`release_buffer`](Self::release_buffer).
    fn get_buffer(&mut self) -> Result<CapturePacket<'_>, DeviceError>;

    fn release_buffer(&mut self, frames: Frames) -> Result<(), DeviceError>;
}

/// Writes packets into a render stream.
pub trait RenderService: Send {
    /// Borrow room for exactly `frames` interleaved frames.
    ///
    /// Fails if more than the free space (buffer size minus padding) is requested.
    fn get_buffer(&mut self, frames: Frames) -> Result<&mut [Sample], DeviceError>;

    /// Commit `frames` frames written into the last buffer.
    fn release_buffer(&mut self, frames: Frames) -> Result<(), DeviceError>;
}

/// Opens clients on endpoints.
pub trait DeviceBackend: Send + Sync {
    /// Human-readable backend name for logs
    fn name(&self) -> &str;

    /// Open a fresh, uninitialized client. Each call yields a new client.
    fn open_client(&self, endpoint: &Endpoint) -> Result<Box<dyn AudioClient>, DeviceError>;
}
