//! Minimal block-timed plugin host.
//!
//! Drives bridge plugins the way a DAW would: activate with the block
//! configuration, then call `process` once per block on one thread. With
//! [`Pacing::RealTime`] each block waits for its wall-clock deadline so
//! device pumps see a host that consumes and produces at the device rate.

use anyhow::{Context, Result};
use clapbridge_core::{Frames, HostBlockConfig, Sample};
use clapbridge_plugin::{AudioBuffer, HostHandle, Plugin, ProcessStatus};
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Restart requests coming back from plugins
#[derive(Debug, Default)]
pub struct RestartFlag {
    requested: AtomicBool,
}

impl RestartFlag {
    /// Clear the flag, returning whether a restart was requested
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }
}

impl HostHandle for RestartFlag {
    fn request_restart(&self) {
        self.requested.store(true, Ordering::Release);
    }
}

/// How blocks are spaced in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// One block per block duration of wall-clock time
    RealTime,
    /// As fast as the plugins return
    #[cfg(test)]
    Free,
}

/// Wall-clock schedule of block deadlines.
///
/// Deadlines are computed from the start time so oversleeping one block
/// doesn't push every later block back.
#[derive(Debug)]
pub struct BlockClock {
    started: Instant,
    block: Duration,
    ticks: u32,
}

impl BlockClock {
    pub fn new(block: Duration) -> Self {
        Self {
            started: Instant::now(),
            block,
            ticks: 0,
        }
    }

    /// When block `tick` is due
    pub fn deadline(&self, tick: u32) -> Instant {
        self.started + self.block * tick
    }

    /// Sleep until the next block is due
    pub fn wait(&mut self) {
        self.ticks += 1;
        let deadline = self.deadline(self.ticks);
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub blocks: usize,
    pub frames: Frames,
    /// Blocks where a plugin returned [`ProcessStatus::Sleep`]
    pub sleeping_blocks: usize,
    pub restarts: usize,
}

/// Host state shared by every run
pub struct Host {
    config: HostBlockConfig,
    pacing: Pacing,
    restart: Arc<RestartFlag>,
    left: Vec<Sample>,
    right: Vec<Sample>,
}

impl Host {
    pub fn new(config: HostBlockConfig, pacing: Pacing) -> Self {
        Self {
            config,
            pacing,
            restart: Arc::new(RestartFlag::default()),
            left: vec![0.0; config.max_block_frames],
            right: vec![0.0; config.max_block_frames],
        }
    }

    /// Handle to give plugins at construction
    pub fn handle(&self) -> Arc<dyn HostHandle> {
        self.restart.clone()
    }

    /// Activate `plugin` with the host block configuration.
    ///
    /// Restart requests made before activation are already satisfied by it.
    pub fn activate(&self, plugin: &mut dyn Plugin) -> Result<()> {
        let name = plugin.descriptor().name;
        plugin
            .activate(
                self.config.sample_rate,
                self.config.min_block_frames,
                self.config.max_block_frames,
            )
            .with_context(|| format!("Failed to activate {name}"))?;
        self.restart.take();
        tracing::info!(
            "Activated {} at {} Hz, blocks of {}..={} frames",
            name,
            self.config.sample_rate,
            self.config.min_block_frames,
            self.config.max_block_frames
        );
        Ok(())
    }

    fn restart_if_requested(&self, plugins: &mut [&mut dyn Plugin]) -> Result<bool> {
        if !self.restart.take() {
            return Ok(false);
        }
        tracing::info!("Restart requested, reactivating plugins");
        for plugin in plugins.iter_mut() {
            plugin.deactivate();
        }
        for plugin in plugins.iter_mut() {
            self.activate(&mut **plugin)?;
        }
        Ok(true)
    }

    /// Run `source` for `total` frames, handing each block of its stereo
    /// output to `sink`.
    pub fn run_source(
        &mut self,
        source: &mut dyn Plugin,
        total: Frames,
        mut sink: impl FnMut(&[Sample], &[Sample]) -> Result<()>,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut clock = BlockClock::new(self.config.max_block_duration());

        while report.frames < total {
            if self.restart_if_requested(&mut [&mut *source])? {
                report.restarts += 1;
            }
            let frames = (total - report.frames).min(self.config.max_block_frames);
            let status = pull(source, &mut self.left[..frames], &mut self.right[..frames]);
            if status == ProcessStatus::Sleep {
                report.sleeping_blocks += 1;
            }
            sink(&self.left[..frames], &self.right[..frames])?;

            report.blocks += 1;
            report.frames += frames;
            if self.pacing == Pacing::RealTime {
                clock.wait();
            }
        }

        Ok(report)
    }

    /// Run `source` into `sink` for `total` frames: the output of one
    /// plugin is the input of the other within the same block.
    pub fn run_route(
        &mut self,
        source: &mut dyn Plugin,
        sink: &mut dyn Plugin,
        total: Frames,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut clock = BlockClock::new(self.config.max_block_duration());

        while report.frames < total {
            if self.restart_if_requested(&mut [&mut *source, &mut *sink])? {
                report.restarts += 1;
            }
            let frames = (total - report.frames).min(self.config.max_block_frames);
            let pulled = pull(source, &mut self.left[..frames], &mut self.right[..frames]);
            let pushed = push(sink, &self.left[..frames], &self.right[..frames]);
            if pulled == ProcessStatus::Sleep || pushed == ProcessStatus::Sleep {
                report.sleeping_blocks += 1;
            }

            report.blocks += 1;
            report.frames += frames;
            if self.pacing == Pacing::RealTime {
                clock.wait();
            }
        }

        Ok(report)
    }
}

fn pull(plugin: &mut dyn Plugin, left: &mut [Sample], right: &mut [Sample]) -> ProcessStatus {
    let frames = left.len();
    let mut outputs: [&mut [Sample]; 2] = [left, right];
    let mut audio = AudioBuffer {
        inputs: &[],
        outputs: &mut outputs,
        frames,
    };
    plugin.process(&mut audio)
}

fn push(plugin: &mut dyn Plugin, left: &[Sample], right: &[Sample]) -> ProcessStatus {
    let inputs: SmallVec<[&[Sample]; 2]> = smallvec![left, right];
    let mut audio = AudioBuffer {
        inputs: &inputs,
        outputs: &mut [],
        frames: left.len(),
    };
    plugin.process(&mut audio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clapbridge_clap::{DeviceRender, InputCapture};
    use clapbridge_core::Frame;
    use clapbridge_device::sim::{SimBackend, SimDevice, SimDeviceConfig};

    fn ramp(start: usize, count: usize) -> Vec<Frame> {
        (start..start + count)
            .map(|i| Frame::new(i as f32, -(i as f32)))
            .collect()
    }

    fn host(block: Frames) -> Host {
        Host::new(HostBlockConfig::new(48000, 1, block), Pacing::Free)
    }

    #[test]
    fn test_restart_flag() {
        let flag = RestartFlag::default();
        assert!(!flag.take());
        flag.request_restart();
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn test_clock_deadlines() {
        let clock = BlockClock::new(Duration::from_millis(10));
        assert_eq!(
            clock.deadline(3) - clock.deadline(0),
            Duration::from_millis(30)
        );
    }

    #[test]
    fn test_run_source_collects_capture() {
        let mic = SimDevice::capture(SimDeviceConfig::capture(480));
        let backend = Arc::new(SimBackend::new().with_device("mic", mic.clone()));
        let mut host = host(256);
        let mut plugin = InputCapture::new(host.handle(), backend);
        plugin.select_device("mic".into());
        host.activate(&mut plugin).unwrap();

        assert!(mic.deliver(&ramp(0, 480)));
        assert!(mic.deliver(&ramp(480, 480)));

        let mut left = Vec::new();
        let mut right = Vec::new();
        let report = host
            .run_source(&mut plugin, 600, |l, r| {
                left.extend_from_slice(l);
                right.extend_from_slice(r);
                Ok(())
            })
            .unwrap();

        assert_eq!(report.blocks, 3);
        assert_eq!(report.frames, 600);
        assert_eq!(report.sleeping_blocks, 0);
        assert_eq!(report.restarts, 0);
        assert_eq!(left.len(), 600);
        assert!(left.iter().enumerate().all(|(i, &s)| s == i as f32));
        assert!(right.iter().enumerate().all(|(i, &s)| s == -(i as f32)));
    }

    #[test]
    fn test_inactive_source_sleeps() {
        let backend = Arc::new(SimBackend::new());
        let mut host = host(128);
        let mut plugin = InputCapture::new(host.handle(), backend);

        let report = host.run_source(&mut plugin, 256, |_, _| Ok(())).unwrap();
        assert_eq!(report.sleeping_blocks, 2);
    }

    #[test]
    fn test_restart_reactivates() {
        let mic = SimDevice::capture(SimDeviceConfig::capture(480));
        let backend = Arc::new(SimBackend::new().with_device("mic", mic.clone()));
        let mut host = host(256);
        let mut plugin = InputCapture::new(host.handle(), backend);
        plugin.select_device("mic".into());
        host.activate(&mut plugin).unwrap();
        assert_eq!(mic.open_count(), 1);

        host.handle().request_restart();
        let report = host.run_source(&mut plugin, 256, |_, _| Ok(())).unwrap();
        assert_eq!(report.restarts, 1);
        assert_eq!(mic.open_count(), 2);
        assert!(plugin.session().is_active());
    }

    #[test]
    fn test_sink_error_stops_run() {
        let backend = Arc::new(SimBackend::new());
        let mut host = host(64);
        let mut plugin = InputCapture::new(host.handle(), backend);

        let result = host.run_source(&mut plugin, 1024, |_, _| anyhow::bail!("disk full"));
        assert!(result.is_err());
    }

    #[test]
    fn test_route_device_to_device() {
        let mic = SimDevice::capture(SimDeviceConfig::capture(480));
        let speaker = SimDevice::render(SimDeviceConfig::render(256, 4800));
        let backend = Arc::new(
            SimBackend::new()
                .with_device("mic", mic.clone())
                .with_device("spk", speaker.clone()),
        );
        let mut host = host(256);

        let mut source = InputCapture::new(host.handle(), backend.clone());
        source.select_device("mic".into());
        host.activate(&mut source).unwrap();
        let mut sink = DeviceRender::new(host.handle(), backend);
        sink.select_device("spk".into());
        host.activate(&mut sink).unwrap();

        assert!(mic.deliver(&ramp(0, 480)));
        assert!(mic.deliver(&ramp(480, 480)));

        let report = host.run_route(&mut source, &mut sink, 512).unwrap();
        assert_eq!(report.blocks, 2);
        assert_eq!(report.sleeping_blocks, 0);
        assert!(speaker.is_running());
        assert_eq!(speaker.play(512), ramp(0, 512));
    }
}
