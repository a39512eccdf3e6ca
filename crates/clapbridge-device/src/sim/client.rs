//! Client and services handed out by [`SimBackend`](super::SimBackend).

use super::SimDevice;
use crate::{
    AudioClient, CapturePacket, CaptureService, DeviceError, Direction, RenderService,
    StreamFlags,
};
use clapbridge_comms::WakeEvent;
use clapbridge_core::{Frame, Frames, Sample, StreamFormat};
use std::time::Duration;

pub(super) struct SimClient {
    device: SimDevice,
    flags: Option<StreamFlags>,
}

impl SimClient {
    pub(super) fn new(device: SimDevice) -> Self {
        Self {
            device,
            flags: None,
        }
    }

    fn flags(&self) -> Result<StreamFlags, DeviceError> {
        self.flags.ok_or(DeviceError::NotInitialized)
    }
}

impl AudioClient for SimClient {
    fn initialize(
        &mut self,
        format: StreamFormat,
        flags: StreamFlags,
        buffer_duration: Duration,
    ) -> Result<(), DeviceError> {
        if self.flags.is_some() {
            return Err(DeviceError::AlreadyInitialized);
        }
        let mut state = self.device.state.lock();
        if state.faults.initialize {
            return Err(DeviceError::Backend(
                "simulated initialize failure".to_string(),
            ));
        }
        if flags.loopback && state.direction != Direction::Capture {
            return Err(DeviceError::Unsupported(
                "loopback on a render stream".to_string(),
            ));
        }
        let requested = format.frames_for(buffer_duration);
        state.buffer_frames = state.config.granted_frames(requested);
        state.event = None;
        self.flags = Some(flags);
        Ok(())
    }

    fn buffer_size(&self) -> Result<Frames, DeviceError> {
        self.flags()?;
        Ok(self.device.state.lock().buffer_frames)
    }

    fn current_padding(&self) -> Result<Frames, DeviceError> {
        self.flags()?;
        let state = self.device.state.lock();
        Ok(match state.direction {
            Direction::Render => state.queued.len(),
            Direction::Capture => state.packets.iter().map(|(data, _)| data.len() / 2).sum(),
        })
    }

    fn set_event_handle(&mut self, event: WakeEvent) -> Result<(), DeviceError> {
        if !self.flags()?.event_driven {
            return Err(DeviceError::NotEventDriven);
        }
        let mut state = self.device.state.lock();
        if state.faults.event_handle {
            return Err(DeviceError::Backend(
                "simulated event handle failure".to_string(),
            ));
        }
        state.event = Some(event);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.flags()?;
        let mut state = self.device.state.lock();
        if state.running {
            return Err(DeviceError::NotStopped);
        }
        state.running = true;
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.flags()?;
        self.device.state.lock().running = false;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.flags()?;
        let mut state = self.device.state.lock();
        if state.running {
            return Err(DeviceError::NotStopped);
        }
        if state.faults.reset {
            return Err(DeviceError::Backend("simulated reset failure".to_string()));
        }
        state.packets.clear();
        state.queued.clear();
        Ok(())
    }

    fn capture_service(&mut self) -> Result<Box<dyn CaptureService>, DeviceError> {
        self.flags()?;
        if self.device.direction() != Direction::Capture {
            return Err(DeviceError::Unsupported(
                "capture service on a render stream".to_string(),
            ));
        }
        Ok(Box::new(SimCapture {
            device: self.device.clone(),
            scratch: Vec::new(),
            held: None,
        }))
    }

    fn render_service(&mut self) -> Result<Box<dyn RenderService>, DeviceError> {
        self.flags()?;
        if self.device.direction() != Direction::Render {
            return Err(DeviceError::Unsupported(
                "render service on a capture stream".to_string(),
            ));
        }
        Ok(Box::new(SimRender {
            device: self.device.clone(),
            scratch: Vec::new(),
            held: None,
        }))
    }
}

struct SimCapture {
    device: SimDevice,
    scratch: Vec<Sample>,
    held: Option<Frames>,
}

impl CaptureService for SimCapture {
    fn next_packet_size(&mut self) -> Result<Frames, DeviceError> {
        let mut state = self.device.state.lock();
        state.service_calls += 1;
        if state.faults.packets {
            return Err(DeviceError::Backend("simulated device loss".to_string()));
        }
        Ok(state.packets.front().map_or(0, |(data, _)| data.len() / 2))
    }

    fn get_buffer(&mut self) -> Result<CapturePacket<'_>, DeviceError> {
        if self.held.is_some() {
            return Err(DeviceError::OutOfOrder("previous packet not released"));
        }
        let flags = {
            let mut state = self.device.state.lock();
            state.service_calls += 1;
            if state.faults.packets {
                return Err(DeviceError::Backend("simulated device loss".to_string()));
            }
            self.scratch.clear();
            let Some((data, flags)) = state.packets.front() else {
                return Ok(CapturePacket {
                    data: &[],
                    flags: crate::PacketFlags::default(),
                });
            };
            self.scratch.extend_from_slice(data);
            *flags
        };
        self.held = Some(self.scratch.len() / 2);
        Ok(CapturePacket {
            data: &self.scratch,
            flags,
        })
    }

    fn release_buffer(&mut self, frames: Frames) -> Result<(), DeviceError> {
        let mut state = self.device.state.lock();
        state.service_calls += 1;
        match self.held.take() {
            Some(held) if held == frames => {
                state.packets.pop_front();
                Ok(())
            }
            Some(_) => Err(DeviceError::OutOfOrder("released a partial packet")),
            None => Err(DeviceError::OutOfOrder("no packet held")),
        }
    }
}

struct SimRender {
    device: SimDevice,
    scratch: Vec<Sample>,
    held: Option<Frames>,
}

impl RenderService for SimRender {
    fn get_buffer(&mut self, frames: Frames) -> Result<&mut [Sample], DeviceError> {
        if self.held.is_some() {
            return Err(DeviceError::OutOfOrder("previous buffer not released"));
        }
        {
            let mut state = self.device.state.lock();
            state.service_calls += 1;
            let available = state.buffer_frames.saturating_sub(state.queued.len());
            if frames > available {
                return Err(DeviceError::BufferTooLarge {
                    requested: frames,
                    available,
                });
            }
        }
        self.scratch.clear();
        self.scratch.resize(frames * 2, 0.0);
        self.held = Some(frames);
        Ok(&mut self.scratch)
    }

    fn release_buffer(&mut self, frames: Frames) -> Result<(), DeviceError> {
        let mut state = self.device.state.lock();
        state.service_calls += 1;
        match self.held.take() {
            Some(held) if frames <= held => {
                let written = self.scratch.chunks_exact(2).take(frames);
                state.queued.extend(written.map(Frame::from_interleaved));
                Ok(())
            }
            Some(_) => Err(DeviceError::OutOfOrder("released more than was acquired")),
            None => Err(DeviceError::OutOfOrder("no buffer held")),
        }
    }
}
