//! Core types and constants shared across the clapbridge crates.
//!
//! Everything that crosses the boundary between the host callback and the
//! OS audio device is described here: the stereo [`Frame`], the fixed
//! interleaved float [`StreamFormat`], and the [`HostBlockConfig`] the host
//! hands over at activation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample rate in Hz
pub type SampleRate = u32;

/// Number of audio frames (samples per channel)
pub type Frames = usize;

/// Audio sample type (32-bit float is the only format the bridge speaks)
pub type Sample = f32;

/// Number of interleaved channels on every stream
pub const NUM_CHANNELS: usize = 2;

/// Size of one interleaved stereo frame in bytes
pub const BYTES_PER_FRAME: usize = std::mem::size_of::<Sample>() * NUM_CHANNELS;

/// Bits per sample on the device side
pub const BITS_PER_SAMPLE: u16 = (std::mem::size_of::<Sample>() * 8) as u16;

/// One stereo sample pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Frame {
    pub left: Sample,
    pub right: Sample,
}

impl Frame {
    /// Silent frame
    pub const SILENCE: Self = Self {
        left: 0.0,
        right: 0.0,
    };

    #[must_use]
    pub const fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Build a frame from the first two samples of an interleaved chunk.
    ///
    /// Missing samples read as silence.
    #[must_use]
    pub fn from_interleaved(chunk: &[Sample]) -> Self {
        Self {
            left: chunk.first().copied().unwrap_or(0.0),
            right: chunk.get(1).copied().unwrap_or(0.0),
        }
    }

    /// Write this frame into an interleaved chunk of at least two samples.
    pub fn write_interleaved(self, chunk: &mut [Sample]) {
        if let [left, right, ..] = chunk {
            *left = self.left;
            *right = self.right;
        }
    }
}

impl From<(Sample, Sample)> for Frame {
    fn from((left, right): (Sample, Sample)) -> Self {
        Self { left, right }
    }
}

/// Stream format negotiated with the device.
///
/// Always stereo, 32-bit IEEE float, interleaved. Only the rate varies, and
/// it always comes from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: SampleRate,
}

impl StreamFormat {
    #[must_use]
    pub const fn stereo_f32(sample_rate: SampleRate) -> Self {
        Self { sample_rate }
    }

    /// Convert a duration into the nearest whole number of frames at this rate.
    ///
    /// Rounds rather than truncates, so `frames_for(duration_of(n)) == n`.
    #[must_use]
    pub fn frames_for(&self, duration: Duration) -> Frames {
        (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as Frames
    }

    /// Convert a frame count into a duration at this rate.
    #[must_use]
    pub fn duration_of(&self, frames: Frames) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }
}

/// Block contract supplied by the host at activation.
///
/// Every later process call carries at most `max_block_frames` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBlockConfig {
    pub sample_rate: SampleRate,
    pub min_block_frames: Frames,
    pub max_block_frames: Frames,
}

impl HostBlockConfig {
    #[must_use]
    pub const fn new(
        sample_rate: SampleRate,
        min_block_frames: Frames,
        max_block_frames: Frames,
    ) -> Self {
        Self {
            sample_rate,
            min_block_frames,
            max_block_frames,
        }
    }

    /// Format every device stream is opened with
    #[must_use]
    pub const fn format(&self) -> StreamFormat {
        StreamFormat::stereo_f32(self.sample_rate)
    }

    /// Duration of one maximum-size host block
    #[must_use]
    pub fn max_block_duration(&self) -> Duration {
        self.format().duration_of(self.max_block_frames)
    }
}

impl Default for HostBlockConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            min_block_frames: 1,
            max_block_frames: 512,
        }
    }
}
