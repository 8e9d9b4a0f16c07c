//! Byte transport abstraction.
//!
//! Defines the `Transport` trait the TNC link runs over, allowing
//! different implementations (serial port, Bluetooth socket, mock, etc.).

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract byte transport.
///
/// Reads and writes take `&self` so the receive loop and the outbound
/// command path can share one handle from different threads.
pub trait Transport: Send + Sync {
    /// Write all of `data`.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes, waiting at most `timeout`.
    ///
    /// A timeout is not an error: it yields an empty buffer.
    /// `TransportError::Disconnected` signals the far end went away.
    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Gather up to `len` bytes before `timeout` elapses.
    ///
    /// Returns a short buffer if the deadline passes first.
    fn read_exact_timeout(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = self.read(len - out.len(), remaining)?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Discard whatever arrives within `timeout`, up to `max_len` bytes.
    fn drain(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.read_exact_timeout(max_len, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_len, timeout)
    }

    fn read_exact_timeout(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read_exact_timeout(len, timeout)
    }

    fn drain(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).drain(max_len, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_len, timeout)
    }

    fn read_exact_timeout(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read_exact_timeout(len, timeout)
    }

    fn drain(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).drain(max_len, timeout)
    }
}
