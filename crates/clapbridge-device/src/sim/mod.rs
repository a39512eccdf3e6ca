//! Simulated device backend.
//!
//! A [`SimDevice`] is an in-process endpoint whose clock is driven by the
//! caller: capture packets arrive when [`SimDevice::deliver`] is called and
//! rendered audio drains when [`SimDevice::play`] is called. This makes pump
//! behavior fully deterministic, which is what the session tests rely on.
//!
//! Buffer sizing mimics a shared-mode OS client: a zero duration yields the
//! device period, and capture endpoints ignore the requested duration.

mod client;

use crate::{DeviceBackend, DeviceError, Direction, Endpoint, PacketFlags};
use clapbridge_comms::WakeEvent;
use clapbridge_core::{Frame, Frames};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use client::SimClient;

/// Sizing behavior of a simulated endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimDeviceConfig {
    /// Buffer size granted for a zero or short requested duration
    pub period_frames: Frames,
    /// Largest buffer the device will grant
    pub max_buffer_frames: Frames,
    /// Whether the requested duration is honored at all
    pub honor_duration: bool,
}

impl SimDeviceConfig {
    /// Capture endpoint that grants `period_frames` whatever is requested
    #[must_use]
    pub const fn capture(period_frames: Frames) -> Self {
        Self {
            period_frames,
            max_buffer_frames: period_frames,
            honor_duration: false,
        }
    }

    /// Render endpoint that honors durations up to `max_buffer_frames`
    #[must_use]
    pub const fn render(period_frames: Frames, max_buffer_frames: Frames) -> Self {
        Self {
            period_frames,
            max_buffer_frames,
            honor_duration: true,
        }
    }

    pub(crate) fn granted_frames(&self, requested: Frames) -> Frames {
        if self.honor_duration {
            requested.clamp(
                self.period_frames,
                self.max_buffer_frames.max(self.period_frames),
            )
        } else {
            self.period_frames
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    open: bool,
    initialize: bool,
    event_handle: bool,
    reset: bool,
    packets: bool,
}

#[derive(Debug)]
struct SimState {
    direction: Direction,
    config: SimDeviceConfig,
    buffer_frames: Frames,
    running: bool,
    event: Option<WakeEvent>,
    packets: VecDeque<(Vec<f32>, PacketFlags)>,
    queued: VecDeque<Frame>,
    played: Vec<Frame>,
    faults: Faults,
    opens: usize,
    starts: usize,
    service_calls: usize,
}

/// Handle to one simulated endpoint. Clones share the same device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    fn new(direction: Direction, config: SimDeviceConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                direction,
                config,
                buffer_frames: 0,
                running: false,
                event: None,
                packets: VecDeque::new(),
                queued: VecDeque::new(),
                played: Vec::new(),
                faults: Faults::default(),
                opens: 0,
                starts: 0,
                service_calls: 0,
            })),
        }
    }

    #[must_use]
    pub fn capture(config: SimDeviceConfig) -> Self {
        Self::new(Direction::Capture, config)
    }

    #[must_use]
    pub fn render(config: SimDeviceConfig) -> Self {
        Self::new(Direction::Render, config)
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.state.lock().direction
    }

    /// Queue one capture packet and signal the event, if any.
    ///
    /// A stopped device drops the packet and returns `false`.
    pub fn deliver(&self, frames: &[Frame]) -> bool {
        self.deliver_with_flags(frames, PacketFlags::default())
    }

    pub fn deliver_with_flags(&self, frames: &[Frame], flags: PacketFlags) -> bool {
        let event = {
            let mut state = self.state.lock();
            if !state.running {
                return false;
            }
            let mut data = vec![0.0; frames.len() * 2];
            for (frame, chunk) in frames.iter().zip(data.chunks_exact_mut(2)) {
                frame.write_interleaved(chunk);
            }
            state.packets.push_back((data, flags));
            state.event.clone()
        };
        if let Some(event) = event {
            event.signal();
        }
        true
    }

    /// Signal the installed event without delivering anything.
    ///
    /// Returns whether an event was installed.
    pub fn signal_event(&self) -> bool {
        let event = self.state.lock().event.clone();
        event.is_some_and(|event| {
            event.signal();
            true
        })
    }

    /// Capture packets not yet read
    #[must_use]
    pub fn pending_packets(&self) -> usize {
        self.state.lock().packets.len()
    }

    /// Consume up to `frames` queued render frames, as the hardware would.
    ///
    /// A stopped device plays nothing.
    pub fn play(&self, frames: Frames) -> Vec<Frame> {
        let mut state = self.state.lock();
        if !state.running {
            return Vec::new();
        }
        let count = frames.min(state.queued.len());
        let played: Vec<Frame> = state.queued.drain(..count).collect();
        state.played.extend_from_slice(&played);
        played
    }

    /// Render frames queued and not yet played (the padding)
    #[must_use]
    pub fn queued_frames(&self) -> Frames {
        self.state.lock().queued.len()
    }

    /// Everything played so far
    #[must_use]
    pub fn played(&self) -> Vec<Frame> {
        self.state.lock().played.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Buffer size granted to the most recently initialized client
    #[must_use]
    pub fn buffer_frames(&self) -> Frames {
        self.state.lock().buffer_frames
    }

    /// Whether an event handle is installed
    #[must_use]
    pub fn has_event(&self) -> bool {
        self.state.lock().event.is_some()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    #[must_use]
    pub fn start_count(&self) -> usize {
        self.state.lock().starts
    }

    /// Calls made through capture/render services so far
    #[must_use]
    pub fn service_calls(&self) -> usize {
        self.state.lock().service_calls
    }

    /// Fail the next open of this device
    pub fn fail_next_open(&self) {
        self.state.lock().faults.open = true;
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.state.lock().faults.initialize = fail;
    }

    pub fn fail_event_handle(&self, fail: bool) {
        self.state.lock().faults.event_handle = fail;
    }

    pub fn fail_reset(&self, fail: bool) {
        self.state.lock().faults.reset = fail;
    }

    /// Make packet queries fail, as a device that vanished mid-stream would
    pub fn fail_packets(&self, fail: bool) {
        self.state.lock().faults.packets = fail;
    }
}

/// Backend serving [`SimDevice`]s by id.
#[derive(Debug, Default, Clone)]
pub struct SimBackend {
    devices: HashMap<String, SimDevice>,
    loopback: Option<SimDevice>,
}

impl SimBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an input or output device under `id`
    #[must_use]
    pub fn with_device(mut self, id: impl Into<String>, device: SimDevice) -> Self {
        self.devices.insert(id.into(), device);
        self
    }

    /// Register the device serving every loopback target
    #[must_use]
    pub fn with_loopback(mut self, device: SimDevice) -> Self {
        self.loopback = Some(device);
        self
    }

    fn resolve(&self, endpoint: &Endpoint) -> Result<&SimDevice, DeviceError> {
        let device = match endpoint {
            Endpoint::Input(id) | Endpoint::Output(id) => self.devices.get(id.as_str()),
            Endpoint::Loopback(_) => self.loopback.as_ref(),
        }
        .ok_or_else(|| DeviceError::NotFound(endpoint.to_string()))?;

        if device.direction() == endpoint.direction() {
            Ok(device)
        } else {
            Err(DeviceError::NotFound(endpoint.to_string()))
        }
    }
}

impl DeviceBackend for SimBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open_client(&self, endpoint: &Endpoint) -> Result<Box<dyn crate::AudioClient>, DeviceError> {
        let device = self.resolve(endpoint)?;
        {
            let mut state = device.state.lock();
            if std::mem::take(&mut state.faults.open) {
                return Err(DeviceError::Backend("simulated open failure".to_string()));
            }
            state.opens += 1;
        }
        Ok(Box::new(SimClient::new(device.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioClient, LoopbackTarget, StreamFlags};
    use clapbridge_core::StreamFormat;
    use std::time::Duration;

    fn frames(range: std::ops::Range<usize>) -> Vec<Frame> {
        range.map(|i| Frame::new(i as f32, 0.5)).collect()
    }

    fn started_client(device: &SimDevice, duration: Duration) -> Box<dyn AudioClient> {
        let backend = SimBackend::new().with_device("dev", device.clone());
        let endpoint = match device.direction() {
            Direction::Capture => Endpoint::Input("dev".into()),
            Direction::Render => Endpoint::Output("dev".into()),
        };
        let mut client = backend.open_client(&endpoint).unwrap();
        client
            .initialize(StreamFormat::stereo_f32(48000), StreamFlags::default(), duration)
            .unwrap();
        client.start().unwrap();
        client
    }

    #[test]
    fn test_capture_packets_round_trip() {
        let device = SimDevice::capture(SimDeviceConfig::capture(480));
        let mut client = started_client(&device, Duration::ZERO);
        let mut capture = client.capture_service().unwrap();

        assert!(device.deliver(&frames(0..3)));
        assert_eq!(capture.next_packet_size().unwrap(), 3);

        let packet = capture.get_buffer().unwrap();
        assert_eq!(packet.frames(), 3);
        assert_eq!(packet.data, &[0.0, 0.5, 1.0, 0.5, 2.0, 0.5]);
        capture.release_buffer(3).unwrap();

        assert_eq!(capture.next_packet_size().unwrap(), 0);
    }

    #[test]
    fn test_stopped_capture_drops_packets() {
        let device = SimDevice::capture(SimDeviceConfig::capture(480));
        assert!(!device.deliver(&frames(0..3)));
        assert_eq!(device.pending_packets(), 0);
    }

    #[test]
    fn test_render_duration_is_clamped() {
        let config = SimDeviceConfig::render(480, 4800);
        assert_eq!(config.granted_frames(0), 480);
        assert_eq!(config.granted_frames(1000), 1000);
        assert_eq!(config.granted_frames(240_000), 4800);
        assert_eq!(SimDeviceConfig::capture(441).granted_frames(2048), 441);
    }

    #[test]
    fn test_render_rejects_more_than_free() {
        let device = SimDevice::render(SimDeviceConfig::render(100, 100));
        let mut client = started_client(&device, Duration::from_secs(1));
        let mut render = client.render_service().unwrap();

        render.get_buffer(60).unwrap().fill(0.25);
        render.release_buffer(60).unwrap();
        assert_eq!(client.current_padding().unwrap(), 60);

        assert_eq!(
            render.get_buffer(41).unwrap_err(),
            DeviceError::BufferTooLarge {
                requested: 41,
                available: 40
            }
        );

        assert_eq!(device.play(10).len(), 10);
        assert_eq!(client.current_padding().unwrap(), 50);
    }

    #[test]
    fn test_backend_resolves_by_direction() {
        let mic = SimDevice::capture(SimDeviceConfig::capture(480));
        let backend = SimBackend::new()
            .with_device("mic", mic.clone())
            .with_loopback(SimDevice::capture(SimDeviceConfig::capture(480)));

        assert!(backend.open_client(&Endpoint::Input("mic".into())).is_ok());
        assert!(matches!(
            backend.open_client(&Endpoint::Output("mic".into())),
            Err(DeviceError::NotFound(_))
        ));
        assert!(
            backend
                .open_client(&Endpoint::Loopback(LoopbackTarget::System))
                .is_ok()
        );

        mic.fail_next_open();
        assert!(backend.open_client(&Endpoint::Input("mic".into())).is_err());
        assert!(backend.open_client(&Endpoint::Input("mic".into())).is_ok());
        assert_eq!(mic.open_count(), 2);
    }
}
