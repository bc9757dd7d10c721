//! Crate-wide error and result types.

use crate::ssp::ResponseStatus;

/// Errors surfaced by the transport, protocol and bus layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serial device not found: {0}")]
    DeviceNotFound(String),

    #[error("not a character device: {0}")]
    NotACharacterDevice(String),

    #[error("could not open serial device {path}: {source}")]
    OpenFailed {
        path: String,
        source: serialport::Error,
    },

    #[error("read timed out")]
    ReadTimeout,

    #[error("invalid STX byte: 0x{0:02x}")]
    InvalidStx(u8),

    #[error("frame CRC mismatch")]
    Crc,

    #[error("malformed frame: {0}")]
    Frame(&'static str),

    #[error("encryption: {0}")]
    Encryption(&'static str),

    #[error("device responded {0}")]
    Status(ResponseStatus),

    #[error("truncated response: {0}")]
    Truncated(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("bus error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
