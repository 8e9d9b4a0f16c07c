//! serialport-based transport implementation.
//!
//! Covers USB-serial adapters and bound RFCOMM devices (`/dev/rfcomm0`),
//! both of which appear as ordinary serial ports.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, instrument, trace};

use super::traits::{Transport, TransportError};

/// Serial port transport.
///
/// The port is cloned once so reads and writes go through independent
/// handles; a blocked read never delays an outbound command.
pub struct SerialTransport {
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
    name: String,
}

impl SerialTransport {
    /// Open `port` at `baud_rate`.
    #[instrument(level = "info")]
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let writer = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError::OpenFailed {
                port: port.to_string(),
                message: e.to_string(),
            })?;
        let reader = writer.try_clone().map_err(|e| TransportError::OpenFailed {
            port: port.to_string(),
            message: e.to_string(),
        })?;

        info!(port = %port, baud = baud_rate, "Serial port opened");

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            name: port.to_string(),
        })
    }

    /// Port name as given to `open`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for SerialTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut port = self.writer.lock().unwrap();
        port.write_all(data).map_err(map_write)?;
        port.flush().map_err(map_write)?;
        trace!(len = data.len(), "Serial write");
        Ok(data.len())
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut port = self.reader.lock().unwrap();
        port.set_timeout(timeout.max(Duration::from_millis(1)))
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut buf = vec![0u8; max_len];
        match port.read(&mut buf) {
            Ok(0) => {
                debug!(port = %self.name, "Serial port returned EOF");
                Err(TransportError::Disconnected)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(Vec::new())
            }
            Err(e) => Err(map_io(e)),
        }
    }
}

fn map_io(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => TransportError::Disconnected,
        _ => TransportError::Io(e),
    }
}

/// Write errors that are not a disconnect are reported as `WriteFailed`.
fn map_write(e: std::io::Error) -> TransportError {
    match map_io(e) {
        TransportError::Io(e) => TransportError::WriteFailed(e.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_mapping() {
        assert!(matches!(
            map_io(io::Error::from(ErrorKind::BrokenPipe)),
            TransportError::Disconnected
        ));
        assert!(matches!(
            map_io(io::Error::from(ErrorKind::PermissionDenied)),
            TransportError::Io(_)
        ));
    }

    #[test]
    fn test_write_error_mapping() {
        assert!(matches!(
            map_write(io::Error::from(ErrorKind::ConnectionReset)),
            TransportError::Disconnected
        ));
        assert!(matches!(
            map_write(io::Error::new(ErrorKind::Other, "buffer overrun")),
            TransportError::WriteFailed(ref msg) if msg == "buffer overrun"
        ));
    }
}
