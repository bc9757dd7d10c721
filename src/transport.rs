//! Serial line access for the SSP bus.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::time::Duration;

use serialport::{SerialPort, TTYPort};

use crate::error::{Error, Result};

/// Serial connection BAUD rate mandated by the SSP implementation guide.
pub const BAUD_RATE: u32 = 9_600;

/// Default timeout for waiting on a device response (milliseconds).
pub const READ_TIMEOUT_MS: u64 = 1_000;

/// Byte stream carrying SSP frames, with a configurable read deadline.
///
/// Reads past the deadline fail with [io::ErrorKind::TimedOut].
pub trait Transport: Read + Write {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;
}

/// The serial device both peripherals hang off of (9600 8N1).
pub struct SerialTransport {
    port: TTYPort,
    path: String,
}

impl SerialTransport {
    /// Opens the serial device at `path`.
    ///
    /// The path must name a character device; regular files and directories
    /// are rejected before the line discipline is touched.
    pub fn open(path: &str) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|_| Error::DeviceNotFound(path.into()))?;
        if !meta.file_type().is_char_device() {
            return Err(Error::NotACharacterDevice(path.into()));
        }

        let port = serialport::new(path, BAUD_RATE)
            .flow_control(serialport::FlowControl::None)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open_native()
            .map_err(|source| Error::OpenFailed {
                path: path.into(),
                source,
            })?;

        Ok(Self {
            port,
            path: path.into(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }
}
