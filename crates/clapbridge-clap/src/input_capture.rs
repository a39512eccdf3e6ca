//! Plugin whose output is an input device.

use crate::VENDOR;
use crate::bridge::Bridge;
use clapbridge_audio::{PumpTuning, StreamSession};
use clapbridge_core::{Frames, SampleRate};
use clapbridge_device::{DeviceBackend, DeviceId, Endpoint};
use clapbridge_plugin::{
    AudioBuffer, AudioPortInfo, FEATURE_STEREO, HostHandle, Plugin, PluginDescriptor,
    PluginError, ProcessStatus,
};
use std::io::{Read, Write};
use std::sync::Arc;

pub static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    id: "clapbridge.in2clap",
    name: "In2Clap",
    vendor: VENDOR,
    version: env!("CARGO_PKG_VERSION"),
    description: "Records an input device into the host",
    features: &[FEATURE_STEREO],
};

/// Capture from an input device. The device id is saved with the host
/// project.
pub struct InputCapture {
    bridge: Bridge,
    device: Option<DeviceId>,
}

impl InputCapture {
    pub fn new(host: Arc<dyn HostHandle>, backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            bridge: Bridge::new(host, backend),
            device: None,
        }
    }

    #[must_use]
    pub fn with_tuning(mut self, tuning: PumpTuning) -> Self {
        self.bridge.set_tuning(tuning);
        self
    }

    #[must_use]
    pub const fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// Record from `device` from the next activation on.
    pub fn select_device(&mut self, device: DeviceId) {
        tracing::info!("Selected input device '{}'", device);
        self.device = Some(device);
        self.bridge.request_restart();
    }

    #[must_use]
    pub const fn session(&self) -> &StreamSession {
        self.bridge.session()
    }
}

pub(crate) fn create(host: Arc<dyn HostHandle>, backend: Arc<dyn DeviceBackend>) -> Box<dyn Plugin> {
    Box::new(InputCapture::new(host, backend))
}

impl Plugin for InputCapture {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &DESCRIPTOR
    }

    fn audio_port_count(&self, is_input: bool) -> u32 {
        u32::from(!is_input)
    }

    fn audio_port_info(&self, index: u32, is_input: bool) -> Option<AudioPortInfo> {
        (!is_input && index == 0).then_some(AudioPortInfo::MAIN_STEREO)
    }

    fn activate(
        &mut self,
        sample_rate: SampleRate,
        min_frames: Frames,
        max_frames: Frames,
    ) -> Result<(), PluginError> {
        let endpoint = self.device.clone().map(Endpoint::Input);
        self.bridge
            .activate(endpoint, sample_rate, min_frames, max_frames)
    }

    fn deactivate(&mut self) {
        self.bridge.deactivate();
    }

    fn process(&mut self, audio: &mut AudioBuffer) -> ProcessStatus {
        self.bridge.process_capture(audio)
    }

    fn implements_state(&self) -> bool {
        true
    }

    fn save_state(&self, out: &mut dyn Write) -> Result<(), PluginError> {
        Bridge::save_device(out, self.device.as_ref())
    }

    fn load_state(&mut self, input: &mut dyn Read) -> Result<(), PluginError> {
        self.bridge.load_device(input, &mut self.device)
    }
}
