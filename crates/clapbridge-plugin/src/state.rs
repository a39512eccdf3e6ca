//! Saved plugin state: the selected device id.
//!
//! Layout, all little-endian:
//!
//! | bytes | field                       |
//! |-------|-----------------------------|
//! | 4     | `u32` version, currently 1  |
//! | 8     | `u64` id length in bytes    |
//! | n     | UTF-8 device id             |
//!
//! A zero length means "no device saved".

use std::io::{self, Read, Write};

/// Current state layout version
pub const STATE_VERSION: u32 = 1;

/// Ids longer than this are treated as corrupt rather than allocated
const MAX_ID_BYTES: u64 = 64 * 1024;

/// Errors from reading saved state
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Unsupported state version: {0}")]
    UnsupportedVersion(u32),

    #[error("State ended early")]
    Truncated,

    #[error("Saved device id is {0} bytes, too long")]
    TooLong(u64),

    #[error("Saved device id is not valid UTF-8")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for StateError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(e)
        }
    }
}

/// Write `device_id` in the current layout.
pub fn write_device_state(out: &mut dyn Write, device_id: &str) -> io::Result<()> {
    out.write_all(&STATE_VERSION.to_le_bytes())?;
    out.write_all(&(device_id.len() as u64).to_le_bytes())?;
    out.write_all(device_id.as_bytes())?;
    Ok(())
}

/// Read a saved device id. `None` when the state holds no device.
pub fn read_device_state(input: &mut dyn Read) -> Result<Option<String>, StateError> {
    let mut version = [0; 4];
    input.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != STATE_VERSION {
        return Err(StateError::UnsupportedVersion(version));
    }

    let mut len = [0; 8];
    input.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_ID_BYTES {
        return Err(StateError::TooLong(len));
    }

    let mut bytes = vec![0; len as usize];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| StateError::InvalidUtf8)
}
