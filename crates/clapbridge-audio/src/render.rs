//! Render pump: host blocks into a device, gated by padding.

use crate::PumpTuning;
use crate::stats::PumpCounters;
use clapbridge_core::{Frame, Frames, HostBlockConfig, NUM_CHANNELS};
use clapbridge_device::{
    AudioClient, DeviceBackend, DeviceError, Endpoint, RenderService, StreamFlags,
};
use std::sync::Arc;
use std::time::Duration;

/// Flow state observed by the last [`RenderPump::consume`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderFlowState {
    /// Device padding before the last write
    pub padding: Frames,
    /// Whether playback has been started this activation
    pub started: bool,
}

/// What one [`RenderPump::consume`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderReport {
    /// Frames written to the device
    pub sent: Frames,
    /// Host frames discarded for lack of room
    pub dropped: Frames,
    /// Whether this call started playback
    pub started_playback: bool,
}

/// Writes host blocks into a render stream.
///
/// Playback is held back until the device has at least its minimum buffer
/// queued, then started exactly once. Host frames that don't fit are
/// dropped; the host is never made to wait.
pub struct RenderPump {
    // Field order matters: the service is released before its client
    render: Box<dyn RenderService>,
    client: Box<dyn AudioClient>,
    min_frames: Frames,
    buffer_frames: Frames,
    flow: RenderFlowState,
    counters: Arc<PumpCounters>,
}

impl RenderPump {
    /// Size and open a render stream.
    ///
    /// A first client initialized with a zero duration reports the device
    /// minimum. A second, fresh client is then initialized with the tuned
    /// duration and kept.
    pub(crate) fn open(
        backend: &dyn DeviceBackend,
        endpoint: &Endpoint,
        host: &HostBlockConfig,
        tuning: &PumpTuning,
        counters: Arc<PumpCounters>,
    ) -> Result<Self, DeviceError> {
        let format = host.format();

        let min_frames = {
            let mut probe = backend.open_client(endpoint)?;
            probe.initialize(format, StreamFlags::default(), Duration::ZERO)?;
            probe.buffer_size()?
        };

        let request = tuning.render_request(min_frames, host);
        let mut client = backend.open_client(endpoint)?;
        client.initialize(format, StreamFlags::default(), request)?;
        let buffer_frames = client.buffer_size()?;
        let render = client.render_service()?;

        tracing::debug!(
            "Render buffer for {}: min {} frames, capacity {} frames (requested {:?})",
            endpoint,
            min_frames,
            buffer_frames,
            request
        );

        Ok(Self {
            render,
            client,
            min_frames,
            buffer_frames,
            flow: RenderFlowState::default(),
            counters,
        })
    }

    /// Device buffer capacity
    #[must_use]
    pub const fn buffer_frames(&self) -> Frames {
        self.buffer_frames
    }

    #[must_use]
    pub const fn flow(&self) -> RenderFlowState {
        self.flow
    }

    /// Write as much of one host block as fits.
    ///
    /// REAL-TIME SAFE: no allocation, no logging.
    pub fn consume(&mut self, left: &[f32], right: &[f32]) -> Result<RenderReport, DeviceError> {
        let result = self.try_consume(left, right);
        if result.is_err() {
            self.counters.device_error();
        }
        result
    }

    fn try_consume(&mut self, left: &[f32], right: &[f32]) -> Result<RenderReport, DeviceError> {
        let frames = left.len().min(right.len());
        let padding = self.client.current_padding()?;
        self.flow.padding = padding;

        let sent = frames.min(self.buffer_frames.saturating_sub(padding));
        if sent > 0 {
            let buffer = self.render.get_buffer(sent)?;
            for ((chunk, &l), &r) in buffer
                .chunks_exact_mut(NUM_CHANNELS)
                .zip(left)
                .zip(right)
            {
                Frame::new(l, r).write_interleaved(chunk);
            }
            self.render.release_buffer(sent)?;
        }

        let mut started_playback = false;
        if !self.flow.started && padding + sent >= self.min_frames {
            self.client.start()?;
            self.flow.started = true;
            started_playback = true;
        }

        let dropped = frames - sent;
        self.counters.rendered(sent, dropped);
        Ok(RenderReport {
            sent,
            dropped,
            started_playback,
        })
    }

    /// Stop playback, discard everything queued and re-arm the start latch.
    ///
    /// The latch is re-armed as soon as the device is stopped, so a failed
    /// discard still lets the next [`consume`](Self::consume) restart it.
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        self.client.stop()?;
        self.flow = RenderFlowState::default();
        self.client.reset()
    }

    pub(crate) fn stop(&mut self) -> Result<(), DeviceError> {
        self.client.stop()
    }
}
