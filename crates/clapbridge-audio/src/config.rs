//! Bridge configuration file format.
//!
//! Uses RON (Rust Object Notation) so a config can be edited by hand and
//! checked into version control next to a host setup.

use clapbridge_core::{Frames, HostBlockConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Knobs of the capture and render pumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpTuning {
    /// Buffer duration requested from render devices once the minimum is known
    pub render_buffer_duration: Duration,

    /// Packets a loopback endpoint buffers before it starts dropping.
    ///
    /// A loopback capture gets its own thread when this many device buffers
    /// are still shorter than one host block.
    pub loopback_packet_multiple: usize,

    /// Callback period for devices that don't report a buffer size range
    pub device_period: Duration,
}

impl Default for PumpTuning {
    fn default() -> Self {
        Self {
            render_buffer_duration: Duration::from_secs(5),
            loopback_packet_multiple: 3,
            device_period: Duration::from_millis(10),
        }
    }
}

impl PumpTuning {
    /// Render buffer request: the configured duration, but never less than
    /// the device minimum plus one host block.
    #[must_use]
    pub fn render_request(&self, render_min_frames: Frames, host: &HostBlockConfig) -> Duration {
        let floor = host
            .format()
            .duration_of(render_min_frames + host.max_block_frames);
        self.render_buffer_duration.max(floor)
    }
}

/// Everything a standalone host needs to run the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Format version for future compatibility
    pub version: u32,

    /// Sample rate and block sizes the host will drive
    pub host: HostBlockConfig,

    #[serde(default)]
    pub tuning: PumpTuning,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            host: HostBlockConfig::default(),
            tuning: PumpTuning::default(),
        }
    }
}

impl BridgeConfig {
    /// Save config to a RON file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be written or serialization fails
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::SerializationFailed(e.to_string()))?;

        std::fs::write(path.as_ref(), ron_string)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Load config from a RON file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, deserialization fails or the
    /// version is not one this build understands
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let ron_string = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Self = ron::from_str(&ron_string)
            .map_err(|e| ConfigError::DeserializationFailed(e.to_string()))?;

        if config.version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(config.version));
        }
        if config.host.max_block_frames == 0 || config.host.sample_rate == 0 {
            return Err(ConfigError::InvalidData(
                "sample rate and max block size must be non-zero".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Errors that can occur while loading or saving a config
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid config data: {0}")]
    InvalidData(String),
}
