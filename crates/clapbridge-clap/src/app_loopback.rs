//! Plugin whose output is what an application is playing.

use crate::VENDOR;
use crate::bridge::Bridge;
use clapbridge_audio::PumpTuning;
use clapbridge_core::{Frames, SampleRate};
use clapbridge_device::{DeviceBackend, Endpoint, LoopbackTarget};
use clapbridge_plugin::{
    AudioBuffer, AudioPortInfo, FEATURE_STEREO, HostHandle, Plugin, PluginDescriptor,
    PluginError, ProcessStatus,
};
use std::sync::Arc;

pub static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    id: "clapbridge.app2clap",
    name: "App2Clap",
    vendor: VENDOR,
    version: env!("CARGO_PKG_VERSION"),
    description: "Captures audio played by an application or the whole system",
    features: &[FEATURE_STEREO],
};

/// Loopback capture of a process tree, or of everything but it, or of the
/// whole system.
///
/// The selection is not saved with the host project: process ids don't
/// survive a restart.
pub struct AppLoopback {
    bridge: Bridge,
    target: Option<LoopbackTarget>,
}

impl AppLoopback {
    pub fn new(host: Arc<dyn HostHandle>, backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            bridge: Bridge::new(host, backend),
            target: None,
        }
    }

    #[must_use]
    pub fn with_tuning(mut self, tuning: PumpTuning) -> Self {
        self.bridge.set_tuning(tuning);
        self
    }

    #[must_use]
    pub const fn target(&self) -> Option<LoopbackTarget> {
        self.target
    }

    /// Capture from `target` from the next activation on.
    pub fn select_target(&mut self, target: LoopbackTarget) {
        tracing::info!("Selected loopback of {}", target);
        self.target = Some(target);
        self.bridge.request_restart();
    }

    #[must_use]
    pub const fn session(&self) -> &clapbridge_audio::StreamSession {
        self.bridge.session()
    }
}

pub(crate) fn create(host: Arc<dyn HostHandle>, backend: Arc<dyn DeviceBackend>) -> Box<dyn Plugin> {
    Box::new(AppLoopback::new(host, backend))
}

impl Plugin for AppLoopback {
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
        let endpoint = self.target.map(Endpoint::Loopback);
        self.bridge
            .activate(endpoint, sample_rate, min_frames, max_frames)
    }

    fn deactivate(&mut self) {
        self.bridge.deactivate();
    }

    fn process(&mut self, audio: &mut AudioBuffer) -> ProcessStatus {
        self.bridge.process_capture(audio)
    }
}
