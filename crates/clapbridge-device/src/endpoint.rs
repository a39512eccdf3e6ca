//! What a client can be opened on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of an input or output device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Whether a loopback capture takes the chosen process tree or everything else
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopbackMode {
    #[default]
    IncludeTree,
    ExcludeTree,
}

/// Source of a loopback capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopbackTarget {
    /// Everything the system is playing
    System,
    /// Audio played by one process and its children (or by everything else)
    Process { pid: u32, mode: LoopbackMode },
}

impl fmt::Display for LoopbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Process {
                pid,
                mode: LoopbackMode::IncludeTree,
            } => write!(f, "process tree {pid}"),
            Self::Process {
                pid,
                mode: LoopbackMode::ExcludeTree,
            } => write!(f, "all but process tree {pid}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Render,
}

/// An endpoint a client can be opened on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// Record from an input device
    Input(DeviceId),
    /// Record what is being played
    Loopback(LoopbackTarget),
    /// Play to an output device
    Output(DeviceId),
}

impl Endpoint {
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Input(_) | Self::Loopback(_) => Direction::Capture,
            Self::Output(_) => Direction::Render,
        }
    }

    #[must_use]
    pub const fn is_loopback(&self) -> bool {
        matches!(self, Self::Loopback(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(id) => write!(f, "input '{id}'"),
            Self::Loopback(target) => write!(f, "loopback of {target}"),
            Self::Output(id) => write!(f, "output '{id}'"),
        }
    }
}

/// An enumerated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub is_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(Endpoint::Input("mic".into()).direction(), Direction::Capture);
        assert_eq!(
            Endpoint::Loopback(LoopbackTarget::System).direction(),
            Direction::Capture
        );
        assert_eq!(Endpoint::Output("spk".into()).direction(), Direction::Render);
    }

    #[test]
    fn test_endpoint_display() {
        let target = LoopbackTarget::Process {
            pid: 42,
            mode: LoopbackMode::ExcludeTree,
        };
        assert_eq!(
            Endpoint::Loopback(target).to_string(),
            "loopback of all but process tree 42"
        );
        assert_eq!(Endpoint::Output("spk".into()).to_string(), "output 'spk'");
    }
}
