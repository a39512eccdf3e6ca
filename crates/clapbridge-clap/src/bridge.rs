//! Session handling shared by the three plugins.

use clapbridge_audio::{ProduceStatus, PumpTuning, StreamSession};
use clapbridge_core::{Frames, HostBlockConfig, SampleRate};
use clapbridge_device::{DeviceBackend, DeviceId, Endpoint};
use clapbridge_plugin::{
    AudioBuffer, HostHandle, PluginError, ProcessStatus, read_device_state, silence,
    write_device_state,
};
use std::io::{Read, Write};
use std::sync::Arc;

pub(crate) struct Bridge {
    session: StreamSession,
    tuning: PumpTuning,
    host: Arc<dyn HostHandle>,
}

impl Bridge {
    pub(crate) fn new(host: Arc<dyn HostHandle>, backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            session: StreamSession::new(backend),
            tuning: PumpTuning::default(),
            host,
        }
    }

    pub(crate) fn set_tuning(&mut self, tuning: PumpTuning) {
        self.tuning = tuning;
    }

    pub(crate) const fn session(&self) -> &StreamSession {
        &self.session
    }

    pub(crate) fn request_restart(&self) {
        self.host.request_restart();
    }

    pub(crate) fn activate(
        &mut self,
        endpoint: Option<Endpoint>,
        sample_rate: SampleRate,
        min_frames: Frames,
        max_frames: Frames,
    ) -> Result<(), PluginError> {
        let endpoint = endpoint.ok_or(PluginError::NoDevice)?;
        let host = HostBlockConfig::new(sample_rate, min_frames, max_frames);
        self.session
            .activate(&endpoint, host, &self.tuning)
            .map_err(|e| PluginError::ActivationFailed(e.to_string()))
    }

    pub(crate) fn deactivate(&mut self) {
        self.session.deactivate();
    }

    pub(crate) fn reset(&mut self) {
        if let Err(e) = self.session.reset() {
            tracing::warn!("Reset failed: {}", e);
        }
    }

    /// Fill the main stereo output from the capture session.
    ///
    /// A shortfall outputs silence and keeps the plugin running.
    pub(crate) fn process_capture(&mut self, audio: &mut AudioBuffer) -> ProcessStatus {
        if !self.session.is_active() {
            silence(audio);
            return ProcessStatus::Sleep;
        }
        let frames = audio.frames;
        let Some((left, rest)) = audio.outputs.split_first_mut() else {
            return ProcessStatus::Sleep;
        };
        let Some(right) = rest.first_mut() else {
            return ProcessStatus::Sleep;
        };
        let frames = frames.min(left.len()).min(right.len());
        let (left, right) = (&mut left[..frames], &mut right[..frames]);

        match self.session.produce(left, right) {
            ProduceStatus::Delivered => ProcessStatus::Continue,
            ProduceStatus::Pending => {
                left.fill(0.0);
                right.fill(0.0);
                ProcessStatus::Continue
            }
            ProduceStatus::Inactive => {
                left.fill(0.0);
                right.fill(0.0);
                ProcessStatus::Sleep
            }
        }
    }

    /// Send the main stereo input to the render session.
    pub(crate) fn process_render(&mut self, audio: &AudioBuffer) -> ProcessStatus {
        if !self.session.is_active() {
            return ProcessStatus::Sleep;
        }
        let (Some(left), Some(right)) = (audio.inputs.first(), audio.inputs.get(1)) else {
            return ProcessStatus::Sleep;
        };
        let frames = audio.frames.min(left.len()).min(right.len());

        match self.session.consume(&left[..frames], &right[..frames]) {
            Ok(_) => ProcessStatus::Continue,
            Err(_) => ProcessStatus::Sleep,
        }
    }

    pub(crate) fn save_device(
        out: &mut dyn Write,
        device: Option<&DeviceId>,
    ) -> Result<(), PluginError> {
        write_device_state(out, device.map_or("", DeviceId::as_str))
            .map_err(|e| PluginError::State(e.into()))
    }

    /// Read a saved device. A non-empty id replaces `device` and requests a
    /// restart; an empty one leaves it alone.
    pub(crate) fn load_device(
        &self,
        input: &mut dyn Read,
        device: &mut Option<DeviceId>,
    ) -> Result<(), PluginError> {
        if let Some(id) = read_device_state(input)? {
            tracing::info!("Loaded device selection '{}'", id);
            *device = Some(DeviceId::new(id));
            self.request_restart();
        }
        Ok(())
    }
}
