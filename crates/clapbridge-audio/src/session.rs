//! One device stream and its pump, from activation to teardown.

use crate::capture::{CaptureKind, CapturePump};
use crate::render::{RenderFlowState, RenderPump, RenderReport};
use crate::stats::{PumpCounters, PumpStats};
use crate::{PumpMode, PumpTuning};
use clapbridge_comms::{FrameRingBuffer, WakeEvent};
use clapbridge_core::{Frames, HostBlockConfig};
use clapbridge_device::{AudioClient, DeviceBackend, DeviceError, Endpoint, StreamFlags};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a [`StreamSession`].
///
/// `Idle -> Activating -> Active -> Stopping -> Idle`, with
/// `Activating -> Idle` on any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Activating,
    Active,
    Stopping,
}

/// Outcome of [`StreamSession::produce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceStatus {
    /// The whole block was filled
    Delivered,
    /// Too few frames buffered; the block was left untouched
    Pending,
    /// No capture stream is active
    Inactive,
}

/// Errors from activating or driving a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is already active")]
    AlreadyActive,

    #[error("Session is not active")]
    Inactive,

    #[error("No device selected")]
    NoSelection,

    #[error("Host block config is invalid: {0}")]
    InvalidHostConfig(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Failed to start capture thread: {0}")]
    Thread(#[from] std::io::Error),
}

enum ActivePump {
    Capture {
        // Dropped before the client
        pump: CapturePump,
        client: Box<dyn AudioClient>,
        device_buffer_frames: Frames,
    },
    Render(RenderPump),
}

/// Owns one device stream plus the pump between it and the host callback.
///
/// Capture sessions hand host blocks out through [`produce`](Self::produce);
/// render sessions take them in through [`consume`](Self::consume).
pub struct StreamSession {
    backend: Arc<dyn DeviceBackend>,
    state: SessionState,
    pump: Option<ActivePump>,
    counters: Arc<PumpCounters>,
}

impl StreamSession {
    #[must_use]
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            state: SessionState::Idle,
            pump: None,
            counters: Arc::new(PumpCounters::default()),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Mode of the active pump. Render sessions always run inline.
    #[must_use]
    pub fn pump_mode(&self) -> Option<PumpMode> {
        match self.pump.as_ref()? {
            ActivePump::Capture { pump, .. } => Some(pump.mode()),
            ActivePump::Render(_) => Some(PumpMode::InlinePoll),
        }
    }

    /// Device buffer size measured at activation
    #[must_use]
    pub fn device_buffer_frames(&self) -> Option<Frames> {
        match self.pump.as_ref()? {
            ActivePump::Capture {
                device_buffer_frames,
                ..
            } => Some(*device_buffer_frames),
            ActivePump::Render(pump) => Some(pump.buffer_frames()),
        }
    }

    /// Frames waiting in the capture ring buffer
    #[must_use]
    pub fn buffered_frames(&self) -> Frames {
        match &self.pump {
            Some(ActivePump::Capture { pump, .. }) => pump.buffered(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn render_flow(&self) -> Option<RenderFlowState> {
        match &self.pump {
            Some(ActivePump::Render(pump)) => Some(pump.flow()),
            _ => None,
        }
    }

    /// Counters since the last activation
    #[must_use]
    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    /// Open and start a stream on `endpoint` for the given host contract.
    ///
    /// On failure nothing is retained and the session is back to `Idle`.
    pub fn activate(
        &mut self,
        endpoint: &Endpoint,
        host: HostBlockConfig,
        tuning: &PumpTuning,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyActive);
        }
        self.state = SessionState::Activating;
        self.counters = Arc::new(PumpCounters::default());

        match self.open(endpoint, &host, tuning) {
            Ok(pump) => {
                self.pump = Some(pump);
                self.state = SessionState::Active;
                tracing::info!(
                    "Activated {} on {} ({} mode, {} Hz, max block {})",
                    endpoint,
                    self.backend.name(),
                    self.pump_mode().unwrap_or(PumpMode::InlinePoll),
                    host.sample_rate,
                    host.max_block_frames
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to activate {}: {}", endpoint, e);
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    fn open(
        &self,
        endpoint: &Endpoint,
        host: &HostBlockConfig,
        tuning: &PumpTuning,
    ) -> Result<ActivePump, SessionError> {
        if host.sample_rate == 0 || host.max_block_frames == 0 {
            return Err(SessionError::InvalidHostConfig(format!("{host:?}")));
        }
        if let Endpoint::Input(id) | Endpoint::Output(id) = endpoint
            && id.is_empty()
        {
            return Err(SessionError::NoSelection);
        }

        match CaptureKind::of(endpoint) {
            Some(kind) => self.open_capture(endpoint, kind, host, tuning),
            None => {
                let pump = RenderPump::open(
                    self.backend.as_ref(),
                    endpoint,
                    host,
                    tuning,
                    Arc::clone(&self.counters),
                )?;
                Ok(ActivePump::Render(pump))
            }
        }
    }

    fn open_capture(
        &self,
        endpoint: &Endpoint,
        kind: CaptureKind,
        host: &HostBlockConfig,
        tuning: &PumpTuning,
    ) -> Result<ActivePump, SessionError> {
        let format = host.format();
        let flags = StreamFlags {
            loopback: kind == CaptureKind::Loopback,
            event_driven: false,
        };
        // Loopback asks for a host block worth of buffering; input devices
        // take their default period
        let duration = match kind {
            CaptureKind::Loopback => host.max_block_duration(),
            CaptureKind::Input => Duration::ZERO,
        };

        let mut client = self.backend.open_client(endpoint)?;
        client.initialize(format, flags, duration)?;
        let mut device_buffer_frames = client.buffer_size()?;
        let mode = kind.mode_for(device_buffer_frames, host.max_block_frames, tuning);
        tracing::debug!(
            "Capture buffer for {}: {} frames, host max block {} -> {}",
            endpoint,
            device_buffer_frames,
            host.max_block_frames,
            mode
        );

        let pump = match mode {
            PumpMode::InlinePoll => {
                let capture = client.capture_service()?;
                let capacity =
                    FrameRingBuffer::capacity_for(device_buffer_frames, host.max_block_frames);
                CapturePump::inline(capture, capacity, Arc::clone(&self.counters))
            }
            PumpMode::Threaded => {
                // An initialized client can't switch to event-driven buffering,
                // so open a fresh one
                drop(client);
                client = self.backend.open_client(endpoint)?;
                client.initialize(
                    format,
                    StreamFlags {
                        event_driven: true,
                        ..flags
                    },
                    duration,
                )?;
                device_buffer_frames = client.buffer_size()?;

                let wake = WakeEvent::new();
                client.set_event_handle(wake.clone())?;
                let capture = client.capture_service()?;
                let capacity =
                    FrameRingBuffer::capacity_for(device_buffer_frames, host.max_block_frames);
                CapturePump::threaded(capture, capacity, wake, Arc::clone(&self.counters))?
            }
        };

        // A failed start drops the pump first, which joins its thread
        client.start()?;

        Ok(ActivePump::Capture {
            pump,
            client,
            device_buffer_frames,
        })
    }

    /// Fill one host block from the capture ring buffer.
    ///
    /// Outputs are left untouched unless `Delivered` is returned.
    ///
    /// REAL-TIME SAFE: no allocation, no logging, no blocking.
    pub fn produce(&mut self, left: &mut [f32], right: &mut [f32]) -> ProduceStatus {
        match &mut self.pump {
            Some(ActivePump::Capture { pump, .. }) => {
                if pump.produce(left, right) {
                    ProduceStatus::Delivered
                } else {
                    ProduceStatus::Pending
                }
            }
            Some(ActivePump::Render(_)) => {
                debug_assert!(false, "produce called on a render session");
                ProduceStatus::Inactive
            }
            None => ProduceStatus::Inactive,
        }
    }

    /// Hand one host block to the render device.
    ///
    /// Whatever doesn't fit is dropped and reported, never an error.
    ///
    /// REAL-TIME SAFE: no allocation, no logging, no blocking.
    pub fn consume(&mut self, left: &[f32], right: &[f32]) -> Result<RenderReport, SessionError> {
        match &mut self.pump {
            Some(ActivePump::Render(pump)) => Ok(pump.consume(left, right)?),
            Some(ActivePump::Capture { .. }) => {
                debug_assert!(false, "consume called on a capture session");
                Err(SessionError::Inactive)
            }
            None => Err(SessionError::Inactive),
        }
    }

    /// Host transport reset. Render sessions stop, flush and re-arm the
    /// start latch; capture sessions keep running.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        match &mut self.pump {
            Some(ActivePump::Render(pump)) => Ok(pump.reset()?),
            Some(ActivePump::Capture { .. }) => Ok(()),
            None => Err(SessionError::Inactive),
        }
    }

    /// Stop the device, stop the capture thread, then release the device.
    ///
    /// Does nothing on an idle session.
    pub fn deactivate(&mut self) {
        let Some(pump) = self.pump.take() else {
            return;
        };
        self.state = SessionState::Stopping;

        match pump {
            ActivePump::Capture {
                mut pump,
                mut client,
                ..
            } => {
                if let Err(e) = client.stop() {
                    tracing::warn!("Failed to stop capture stream: {}", e);
                }
                pump.shutdown();
                drop(pump);
                drop(client);
            }
            ActivePump::Render(mut pump) => {
                if let Err(e) = pump.stop() {
                    tracing::warn!("Failed to stop render stream: {}", e);
                }
                drop(pump);
            }
        }

        self.state = SessionState::Idle;
        tracing::info!("Session deactivated");
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clapbridge_device::sim::{SimBackend, SimDevice, SimDeviceConfig};
    use clapbridge_device::LoopbackTarget;

    fn host(max_block: Frames) -> HostBlockConfig {
        HostBlockConfig::new(48000, 1, max_block)
    }

    #[test]
    fn test_mode_selection_input() {
        let tuning = PumpTuning::default();
        assert_eq!(
            CaptureKind::Input.mode_for(480, 512, &tuning),
            PumpMode::Threaded
        );
        assert_eq!(
            CaptureKind::Input.mode_for(512, 512, &tuning),
            PumpMode::InlinePoll
        );
    }

    #[test]
    fn test_mode_selection_loopback() {
        let tuning = PumpTuning::default();
        // Three 160-frame packets cover 480 frames
        assert_eq!(
            CaptureKind::Loopback.mode_for(160, 512, &tuning),
            PumpMode::Threaded
        );
        assert_eq!(
            CaptureKind::Loopback.mode_for(160, 480, &tuning),
            PumpMode::InlinePoll
        );
    }

    #[test]
    fn test_inline_activation() {
        let mic = SimDevice::capture(SimDeviceConfig::capture(1024));
        let backend = SimBackend::new().with_device("mic", mic.clone());
        let mut session = StreamSession::new(Arc::new(backend));

        session
            .activate(&Endpoint::Input("mic".into()), host(256), &PumpTuning::default())
            .unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.pump_mode(), Some(PumpMode::InlinePoll));
        assert_eq!(session.device_buffer_frames(), Some(1024));
        assert!(mic.is_running());
        assert!(!mic.has_event());
        assert_eq!(mic.open_count(), 1);
    }

    #[test]
    fn test_threaded_activation_reopens_event_driven() {
        let loopback = SimDevice::capture(SimDeviceConfig::capture(128));
        let backend = SimBackend::new().with_loopback(loopback.clone());
        let mut session = StreamSession::new(Arc::new(backend));

        session
            .activate(
                &Endpoint::Loopback(LoopbackTarget::System),
                host(512),
                &PumpTuning::default(),
            )
            .unwrap();

        assert_eq!(session.pump_mode(), Some(PumpMode::Threaded));
        assert_eq!(loopback.open_count(), 2);
        assert!(loopback.has_event());

        session.deactivate();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!loopback.is_running());
    }

    #[test]
    fn test_failed_activation_returns_to_idle() {
        let mic = SimDevice::capture(SimDeviceConfig::capture(128));
        mic.fail_event_handle(true);
        let backend = SimBackend::new().with_device("mic", mic.clone());
        let mut session = StreamSession::new(Arc::new(backend));

        let result = session.activate(
            &Endpoint::Input("mic".into()),
            host(512),
            &PumpTuning::default(),
        );

        assert!(matches!(result, Err(SessionError::Device(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.pump_mode(), None);
        assert!(!mic.is_running());
    }

    #[test]
    fn test_missing_device_fails_cleanly() {
        let mut session = StreamSession::new(Arc::new(SimBackend::new()));

        let result = session.activate(
            &Endpoint::Output("nowhere".into()),
            host(512),
            &PumpTuning::default(),
        );
        assert!(matches!(
            result,
            Err(SessionError::Device(DeviceError::NotFound(_)))
        ));

        let result = session.activate(
            &Endpoint::Input("".into()),
            host(512),
            &PumpTuning::default(),
        );
        assert!(matches!(result, Err(SessionError::NoSelection)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_double_activation_rejected() {
        let mic = SimDevice::capture(SimDeviceConfig::capture(1024));
        let backend = SimBackend::new().with_device("mic", mic);
        let mut session = StreamSession::new(Arc::new(backend));
        let endpoint = Endpoint::Input("mic".into());

        session
            .activate(&endpoint, host(256), &PumpTuning::default())
            .unwrap();
        assert!(matches!(
            session.activate(&endpoint, host(256), &PumpTuning::default()),
            Err(SessionError::AlreadyActive)
        ));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_produce_when_idle_is_inactive() {
        let mut session = StreamSession::new(Arc::new(SimBackend::new()));
        let mut left = [1.0; 16];
        let mut right = [1.0; 16];

        assert_eq!(
            session.produce(&mut left, &mut right),
            ProduceStatus::Inactive
        );
        assert!(left.iter().all(|&s| s == 1.0));
        assert!(matches!(
            session.consume(&left, &right),
            Err(SessionError::Inactive)
        ));
    }
}
