//! Plugin that plays its input on an output device.

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
    id: "clapbridge.clap2app",
    name: "Clap2App",
    vendor: VENDOR,
    version: env!("CARGO_PKG_VERSION"),
    description: "Sends the host's audio to an output device",
    features: &[FEATURE_STEREO],
};

/// Render to an output device. The device id is saved with the host
/// project.
pub struct DeviceRender {
    bridge: Bridge,
    device: Option<DeviceId>,
}

impl DeviceRender {
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

    /// Play to `device` from the next activation on.
    pub fn select_device(&mut self, device: DeviceId) {
        tracing::info!("Selected output device '{}'", device);
        self.device = Some(device);
        self.bridge.request_restart();
    }

    #[must_use]
    pub const fn session(&self) -> &StreamSession {
        self.bridge.session()
    }
}

pub(crate) fn create(host: Arc<dyn HostHandle>, backend: Arc<dyn DeviceBackend>) -> Box<dyn Plugin> {
    Box::new(DeviceRender::new(host, backend))
}

impl Plugin for DeviceRender {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &DESCRIPTOR
    }

    fn audio_port_count(&self, is_input: bool) -> u32 {
        u32::from(is_input)
    }

    fn audio_port_info(&self, index: u32, is_input: bool) -> Option<AudioPortInfo> {
        (is_input && index == 0).then_some(AudioPortInfo::MAIN_STEREO)
    }

    fn activate(
        &mut self,
        sample_rate: SampleRate,
        min_frames: Frames,
        max_frames: Frames,
    ) -> Result<(), PluginError> {
        let endpoint = self.device.clone().map(Endpoint::Output);
        self.bridge
            .activate(endpoint, sample_rate, min_frames, max_frames)
    }

    fn deactivate(&mut self) {
        self.bridge.deactivate();
    }

    /// Stop playback and drop everything queued on the device
    fn reset(&mut self) {
        self.bridge.reset();
    }

    fn process(&mut self, audio: &mut AudioBuffer) -> ProcessStatus {
        self.bridge.process_render(audio)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingHost;
    use clapbridge_device::sim::{SimBackend, SimDevice, SimDeviceConfig};

    fn active_plugin(speaker: &SimDevice, max_block: Frames) -> DeviceRender {
        let backend = SimBackend::new().with_device("spk", speaker.clone());
        let mut plugin = DeviceRender::new(CountingHost::new(), Arc::new(backend));
        plugin.select_device("spk".into());
        plugin.activate(48000, 1, max_block).unwrap();
        plugin
    }

    fn send(plugin: &mut DeviceRender, left: &[f32], right: &[f32]) -> ProcessStatus {
        let inputs = [left, right];
        let mut audio = AudioBuffer {
            inputs: &inputs,
            outputs: &mut [],
            frames: left.len(),
        };
        plugin.process(&mut audio)
    }

    #[test]
    fn test_ports() {
        let backend = SimBackend::new();
        let plugin = DeviceRender::new(CountingHost::new(), Arc::new(backend));
        assert_eq!(plugin.audio_port_count(true), 1);
        assert_eq!(plugin.audio_port_count(false), 0);
        assert!(plugin.audio_port_info(0, true).is_some());
        assert!(plugin.audio_port_info(0, false).is_none());
    }

    #[test]
    fn test_process_plays_input() {
        let speaker = SimDevice::render(SimDeviceConfig::render(256, 4800));
        let mut plugin = active_plugin(&speaker, 256);

        let left: Vec<f32> = (0..256).map(|i| i as f32).collect();
        let right = vec![0.5; 256];
        assert_eq!(send(&mut plugin, &left, &right), ProcessStatus::Continue);
        assert!(speaker.is_running());

        let played = speaker.play(256);
        assert_eq!(played.len(), 256);
        assert_eq!(played[10].left, 10.0);
        assert_eq!(played[10].right, 0.5);
    }

    #[test]
    fn test_reset_stops_and_clears() {
        let speaker = SimDevice::render(SimDeviceConfig::render(256, 4800));
        let mut plugin = active_plugin(&speaker, 256);

        let block = [0.2; 256];
        send(&mut plugin, &block, &block);
        assert_eq!(speaker.queued_frames(), 256);

        plugin.reset();
        assert!(!speaker.is_running());
        assert_eq!(speaker.queued_frames(), 0);
        assert!(plugin.session().is_active());
    }

    #[test]
    fn test_playback_resumes_after_failed_reset() {
        let speaker = SimDevice::render(SimDeviceConfig::render(256, 4800));
        let mut plugin = active_plugin(&speaker, 256);

        let block = [0.2; 256];
        send(&mut plugin, &block, &block);
        speaker.fail_reset(true);
        plugin.reset();
        assert!(!speaker.is_running());

        speaker.fail_reset(false);
        assert_eq!(send(&mut plugin, &block, &block), ProcessStatus::Continue);
        assert!(speaker.is_running());
        assert_eq!(speaker.start_count(), 2);
    }

    #[test]
    fn test_inactive_sleeps() {
        let backend = SimBackend::new();
        let mut plugin = DeviceRender::new(CountingHost::new(), Arc::new(backend));
        let block = [0.0; 16];
        assert_eq!(send(&mut plugin, &block, &block), ProcessStatus::Sleep);
    }

    #[test]
    fn test_deactivated_sleeps() {
        let speaker = SimDevice::render(SimDeviceConfig::render(256, 4800));
        let mut plugin = active_plugin(&speaker, 256);
        plugin.deactivate();
        assert!(!plugin.session().is_active());

        let block = [0.0; 16];
        assert_eq!(send(&mut plugin, &block, &block), ProcessStatus::Sleep);
    }
}
