//! WAV output for recorded blocks.

use anyhow::{Context, Result};
use clapbridge_core::{BITS_PER_SAMPLE, NUM_CHANNELS, Sample, SampleRate};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Stereo 32-bit float WAV file written block by block
pub struct WavSink {
    path: PathBuf,
    writer: WavWriter<BufWriter<File>>,
}

impl WavSink {
    pub fn create(path: &Path, sample_rate: SampleRate) -> Result<Self> {
        let spec = WavSpec {
            channels: NUM_CHANNELS as u16,
            sample_rate,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(path, spec)
            .with_context(|| format!("Failed to create output file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Interleave one block and append it
    pub fn write_block(&mut self, left: &[Sample], right: &[Sample]) -> Result<()> {
        for (&l, &r) in left.iter().zip(right) {
            self.writer
                .write_sample(l)
                .context("Failed to write float sample")?;
            self.writer
                .write_sample(r)
                .context("Failed to write float sample")?;
        }
        Ok(())
    }

    pub fn finalize(self) -> Result<()> {
        self.writer
            .finalize()
            .with_context(|| format!("Failed to finalize WAV file: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    #[test]
    fn test_blocks_are_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut sink = WavSink::create(&path, 44100).unwrap();
        sink.write_block(&[0.1, 0.2], &[-0.1, -0.2]).unwrap();
        sink.write_block(&[0.3], &[-0.3]).unwrap();
        sink.finalize().unwrap();

        let mut reader = WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 44100);
        assert_eq!(spec.sample_format, SampleFormat::Float);

        let samples: Vec<f32> = reader.samples::<f32>().map(Result::unwrap).collect();
        assert_eq!(samples, [0.1, -0.1, 0.2, -0.2, 0.3, -0.3]);
    }
}
