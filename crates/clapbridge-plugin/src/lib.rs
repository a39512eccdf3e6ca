//! Plugin abstraction layer.
//!
//! This crate defines the `Plugin` trait the bridge plugins implement and the
//! pieces a host hands them: audio buffers, port descriptions and a handle
//! for asking the host to restart the plugin.

pub mod state;

pub use state::{STATE_VERSION, StateError, read_device_state, write_device_state};

use clapbridge_core::{Frames, NUM_CHANNELS, Sample, SampleRate};
use std::io::{Read, Write};

/// Audio buffer for processing.
///
/// Channels of all ports are laid out one after another: a single stereo
/// port uses `[0]` for left and `[1]` for right.
pub struct AudioBuffer<'a> {
    pub inputs: &'a [&'a [Sample]],
    pub outputs: &'a mut [&'a mut [Sample]],
    pub frames: Frames,
}

/// What the host should do with the plugin after a process call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Keep calling process
    Continue,
    /// Nothing to do until something changes; outputs are silent
    Sleep,
}

/// Feature tag for plugins with stereo ports
pub const FEATURE_STEREO: &str = "stereo";

/// Static plugin metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub vendor: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub features: &'static [&'static str],
}

/// Description of one audio port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPortInfo {
    pub id: u32,
    pub name: &'static str,
    pub channel_count: u32,
    pub is_main: bool,
}

impl AudioPortInfo {
    /// The single main stereo port every bridge plugin exposes
    pub const MAIN_STEREO: Self = Self {
        id: 0,
        name: "Main",
        channel_count: NUM_CHANNELS as u32,
        is_main: true,
    };
}

/// Callbacks from a plugin into its host.
pub trait HostHandle: Send + Sync {
    /// Ask the host to deactivate and reactivate the plugin.
    ///
    /// One-way notification; the host decides when.
    fn request_restart(&self);
}

/// Main plugin trait that all bridge plugins implement
pub trait Plugin: Send {
    fn descriptor(&self) -> &'static PluginDescriptor;

    /// Number of input or output audio ports
    fn audio_port_count(&self, is_input: bool) -> u32;

    fn audio_port_info(&self, index: u32, is_input: bool) -> Option<AudioPortInfo>;

    /// Open the device for the host's sample rate and block size range
    fn activate(
        &mut self,
        sample_rate: SampleRate,
        min_frames: Frames,
        max_frames: Frames,
    ) -> Result<(), PluginError>;

    /// Release the device. Safe to call when not active.
    fn deactivate(&mut self);

    /// Host transport reset
    fn reset(&mut self) {}

    /// Process one block. Never blocks or allocates.
    fn process(&mut self, audio: &mut AudioBuffer) -> ProcessStatus;

    /// Whether `save_state`/`load_state` are implemented
    fn implements_state(&self) -> bool {
        false
    }

    fn save_state(&self, _out: &mut dyn Write) -> Result<(), PluginError> {
        Err(PluginError::StateUnsupported)
    }

    fn load_state(&mut self, _input: &mut dyn Read) -> Result<(), PluginError> {
        Err(PluginError::StateUnsupported)
    }
}

/// Plugin-related errors
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("No device selected")]
    NoDevice,

    #[error("Plugin activation failed: {0}")]
    ActivationFailed(String),

    #[error("Plugin does not save state")]
    StateUnsupported,

    #[error("Plugin state error: {0}")]
    State(#[from] StateError),

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),
}

/// Zero every output channel
pub fn silence(audio: &mut AudioBuffer) {
    for channel in audio.outputs.iter_mut() {
        channel.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_clears_outputs() {
        let mut left = [1.0; 8];
        let mut right = [-1.0; 8];
        let mut outputs: [&mut [Sample]; 2] = [&mut left, &mut right];
        let mut audio = AudioBuffer {
            inputs: &[],
            outputs: &mut outputs,
            frames: 8,
        };

        silence(&mut audio);
        assert!(audio.outputs.iter().all(|ch| ch.iter().all(|&s| s == 0.0)));
    }

    #[test]
    fn test_main_stereo_port() {
        let port = AudioPortInfo::MAIN_STEREO;
        assert_eq!(port.channel_count, 2);
        assert!(port.is_main);
    }
}
