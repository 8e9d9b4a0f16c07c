//! AVR109 (butterfly) bootloader client.
//!
//! Only the subset XBoot implements for the ATmega328P is covered. Every
//! call is a synchronous request/response exchange: a command letter with
//! optional binary arguments, answered either by a fixed-length reply or by
//! a single carriage-return confirmation.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::payload::MemoryType;
use crate::protocol::constants::*;
use crate::retry::RetryPolicy;
use crate::transport::{Transport, TransportError};

/// Largest even block length expressible in the one-byte length field.
pub const MAX_BLOCK_LEN: usize = 254;

/// Upper bound on device codes accepted from a device list reply.
const MAX_DEVICE_CODES: usize = 32;

#[derive(Error, Debug)]
pub enum BootloaderError {
    #[error("No response to {0}")]
    NoResponse(String),

    #[error("Short reply to {operation}: expected {expected} bytes, got {actual}")]
    ShortRead {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown bootloader: {0:?}")]
    UnknownBootloader(String),

    #[error("Address 0x{0:04X} is not word aligned")]
    UnalignedAddress(u32),

    #[error("Address 0x{0:X} is beyond the word address range")]
    AddressOutOfRange(u32),

    #[error("Invalid block length {0}: must be even and at most 254")]
    InvalidBlockLength(usize),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Timeouts and retry budgets for the bootloader exchange.
///
/// Retried operations wait for their reply with the policy's own
/// per-attempt timeout rather than `confirm_timeout` / `read_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Avr109Config {
    /// Wait for a confirmation byte.
    pub confirm_timeout: Duration,
    /// Wait for a fixed-length reply.
    pub read_timeout: Duration,
    /// Block writes; `timeout_ms` bounds each confirmation wait.
    pub block_retry: RetryPolicy,
    /// Identifier polling; `timeout_ms` bounds each identifier read.
    pub signature_retry: RetryPolicy,
}

impl Default for Avr109Config {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(1),
            block_retry: RetryPolicy::new(5, 10_000, 50),
            signature_retry: RetryPolicy::new(10, 1_000, 100),
        }
    }
}

/// AVR109 client over any byte transport.
pub struct Avr109<T: Transport> {
    transport: T,
    config: Avr109Config,
}

impl<T: Transport> Avr109<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, Avr109Config::default())
    }

    pub fn with_config(transport: T, config: Avr109Config) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Wake the bootloader and clear whatever it printed.
    pub fn start(&self) -> Result<(), BootloaderError> {
        self.transport.write(&[AVR_ESCAPE])?;
        let noise = self.transport.drain(10, self.config.read_timeout)?;
        if !noise.is_empty() {
            trace!(bytes = ?noise, "Discarded handshake bytes");
        }
        Ok(())
    }

    /// Set the write/read pointer. `byte_address` must be even.
    pub fn send_address(&self, byte_address: u32) -> Result<(), BootloaderError> {
        if byte_address % 2 != 0 {
            return Err(BootloaderError::UnalignedAddress(byte_address));
        }
        let word = u16::try_from(byte_address / 2)
            .map_err(|_| BootloaderError::AddressOutOfRange(byte_address))?;
        let [hi, lo] = word.to_be_bytes();

        trace!(address = %format!("0x{:04X}", byte_address), "Set address");
        self.transport.write(&[AVR_SET_ADDRESS, hi, lo])?;
        self.expect_confirmation("SetAddress", self.config.confirm_timeout)
    }

    /// Write one block at the current address, retrying on failure.
    pub fn send_block(&self, memory: MemoryType, data: &[u8]) -> Result<(), BootloaderError> {
        if data.len() % 2 != 0 || data.len() > MAX_BLOCK_LEN {
            return Err(BootloaderError::InvalidBlockLength(data.len()));
        }

        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&[AVR_WRITE_BLOCK, 0, data.len() as u8, memory.tag()]);
        frame.extend_from_slice(data);

        let policy = self.config.block_retry;
        policy.run("BlockLoad", |attempt| {
            if attempt > 0 {
                warn!(attempt = attempt + 1, len = data.len(), "Resending block");
            }
            self.transport.write(&frame)?;
            self.expect_confirmation("BlockLoad", policy.timeout())
        })
    }

    /// Read `size` bytes back from the current address.
    pub fn read_block(&self, memory: MemoryType, size: u8) -> Result<Vec<u8>, BootloaderError> {
        self.transport
            .write(&[AVR_READ_BLOCK, 0, size, memory.tag()])?;
        self.read_reply("BlockRead", size as usize)
    }

    pub fn chip_erase(&self) -> Result<(), BootloaderError> {
        self.simple_command(AVR_CHIP_ERASE, "ChipErase")
    }

    pub fn enter_program_mode(&self) -> Result<(), BootloaderError> {
        self.simple_command(AVR_ENTER_PROGRAM_MODE, "EnterProgramMode")
    }

    pub fn leave_program_mode(&self) -> Result<(), BootloaderError> {
        self.simple_command(AVR_LEAVE_PROGRAM_MODE, "LeaveProgramMode")
    }

    pub fn exit_bootloader(&self) -> Result<(), BootloaderError> {
        self.simple_command(AVR_EXIT_BOOTLOADER, "ExitBootloader")
    }

    pub fn supports_auto_increment(&self) -> Result<bool, BootloaderError> {
        self.transport.write(&[AVR_AUTO_INCREMENT])?;
        let reply = self.read_up_to(1)?;
        Ok(reply.first() == Some(&AVR_YES))
    }

    /// Block size in bytes, or 0 when block mode is unsupported.
    pub fn get_block_size(&self) -> Result<u16, BootloaderError> {
        self.transport.write(&[AVR_BLOCK_SIZE])?;
        if self.read_up_to(1)?.first() != Some(&AVR_YES) {
            return Ok(0);
        }
        let size = self.read_reply("BlockSize", 2)?;
        Ok(u16::from_be_bytes([size[0], size[1]]))
    }

    /// Poll for the XBoot identifier, waking the bootloader before each try.
    #[instrument(level = "debug", skip(self))]
    pub fn get_bootloader_signature(&self) -> Result<String, BootloaderError> {
        let policy = self.config.signature_retry;
        policy.run("BootloaderSignature", |_| {
            self.start()?;
            self.transport.write(&[AVR_BOOTLOADER_ID])?;
            let reply = self
                .transport
                .read_exact_timeout(XBOOT_ID.len(), policy.timeout())?;
            if reply.as_slice() == XBOOT_ID {
                Ok(String::from_utf8_lossy(&reply).into_owned())
            } else {
                Err(BootloaderError::UnknownBootloader(
                    String::from_utf8_lossy(&reply).into_owned(),
                ))
            }
        })
    }

    /// `"MAJOR.MINOR"` from two ASCII-offset bytes.
    pub fn get_software_version(&self) -> Result<String, BootloaderError> {
        self.transport.write(&[AVR_SOFTWARE_VERSION])?;
        let v = self.read_reply("SoftwareVersion", 2)?;
        Ok(format!("{}.{}", v[0] as i16 - 48, v[1] as i16 - 48))
    }

    pub fn get_programmer_type(&self) -> Result<Option<u8>, BootloaderError> {
        self.transport.write(&[AVR_PROGRAMMER_TYPE])?;
        Ok(self.read_up_to(1)?.first().copied())
    }

    /// Zero-terminated list of supported device codes.
    pub fn get_device_list(&self) -> Result<Vec<u8>, BootloaderError> {
        self.transport.write(&[AVR_DEVICE_LIST])?;
        let mut devices = Vec::new();
        loop {
            let code = self.read_reply("DeviceList", 1)?[0];
            if code == 0 {
                break;
            }
            devices.push(code);
            if devices.len() >= MAX_DEVICE_CODES {
                warn!("Device list not terminated, truncating");
                break;
            }
        }
        Ok(devices)
    }

    pub fn get_device_signature(&self) -> Result<[u8; 3], BootloaderError> {
        self.transport.write(&[AVR_DEVICE_SIGNATURE])?;
        let sig = self.read_reply("DeviceSignature", 3)?;
        Ok([sig[0], sig[1], sig[2]])
    }

    fn simple_command(&self, command: u8, name: &str) -> Result<(), BootloaderError> {
        debug!(command = name, "Bootloader command");
        self.transport.write(&[command])?;
        self.expect_confirmation(name, self.config.confirm_timeout)
    }

    /// One byte, carriage return, within `timeout`.
    fn expect_confirmation(&self, operation: &str, timeout: Duration) -> Result<(), BootloaderError> {
        let reply = self.transport.read_exact_timeout(1, timeout)?;
        if reply.first() == Some(&AVR_CONFIRM) {
            Ok(())
        } else {
            Err(BootloaderError::NoResponse(operation.to_string()))
        }
    }

    fn read_up_to(&self, len: usize) -> Result<Vec<u8>, BootloaderError> {
        Ok(self
            .transport
            .read_exact_timeout(len, self.config.read_timeout)?)
    }

    fn read_reply(&self, operation: &'static str, len: usize) -> Result<Vec<u8>, BootloaderError> {
        let reply = self.read_up_to(len)?;
        if reply.len() < len {
            return Err(BootloaderError::ShortRead {
                operation,
                expected: len,
                actual: reply.len(),
            });
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::transport::{BootloaderFaults, MockTransport, SimulatedBootloader};

    fn fast() -> Avr109Config {
        Avr109Config {
            block_retry: RetryPolicy::new(5, 10, 0),
            signature_retry: RetryPolicy::new(10, 10, 0),
            ..Avr109Config::default()
        }
    }

    /// Forwards to a simulated device and records every reply timeout.
    struct TimeoutLog<'a> {
        device: &'a SimulatedBootloader,
        timeouts: Mutex<Vec<Duration>>,
    }

    impl<'a> TimeoutLog<'a> {
        fn new(device: &'a SimulatedBootloader) -> Self {
            Self {
                device,
                timeouts: Mutex::new(Vec::new()),
            }
        }

        fn timeouts(&self) -> Vec<Duration> {
            self.timeouts.lock().unwrap().clone()
        }
    }

    impl Transport for TimeoutLog<'_> {
        fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
            self.device.write(data)
        }

        fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            self.device.read(max_len, timeout)
        }

        fn read_exact_timeout(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            self.timeouts.lock().unwrap().push(timeout);
            self.device.read_exact_timeout(len, timeout)
        }
    }

    #[test]
    fn test_send_address_confirmed() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"\r");
        let avr = Avr109::with_config(&mock, fast());

        avr.send_address(0x0100).unwrap();
        assert_eq!(mock.get_writes(), vec![vec![b'A', 0x00, 0x80]]);
    }

    #[test]
    fn test_send_address_wrong_reply() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"?");
        let avr = Avr109::with_config(&mock, fast());

        let err = avr.send_address(0).unwrap_err();
        assert!(matches!(err, BootloaderError::NoResponse(ref op) if op == "SetAddress"));
        assert_eq!(err.to_string(), "No response to SetAddress");
    }

    #[test]
    fn test_send_address_timeout() {
        let mock = MockTransport::new();
        let avr = Avr109::with_config(&mock, fast());
        assert!(matches!(
            avr.send_address(0),
            Err(BootloaderError::NoResponse(_))
        ));
    }

    #[test]
    fn test_send_address_validation() {
        let mock = MockTransport::new();
        let avr = Avr109::with_config(&mock, fast());
        assert!(matches!(
            avr.send_address(0x11),
            Err(BootloaderError::UnalignedAddress(0x11))
        ));
        assert!(matches!(
            avr.send_address(0x2_0000),
            Err(BootloaderError::AddressOutOfRange(_))
        ));
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_send_block_wire_format() {
        let mock = MockTransport::new();
        mock.queue_bytes(b"\r");
        let avr = Avr109::with_config(&mock, fast());

        avr.send_block(MemoryType::Flash, &[0xDE, 0xAD]).unwrap();
        assert_eq!(mock.get_writes(), vec![vec![b'B', 0, 2, b'F', 0xDE, 0xAD]]);
    }

    #[test]
    fn test_send_block_rejects_odd_length() {
        let mock = MockTransport::new();
        let avr = Avr109::with_config(&mock, fast());
        assert!(matches!(
            avr.send_block(MemoryType::Flash, &[1, 2, 3]),
            Err(BootloaderError::InvalidBlockLength(3))
        ));
    }

    #[test]
    fn test_send_block_retries_then_succeeds() {
        let sim = SimulatedBootloader::with_faults(BootloaderFaults {
            unconfirmed_writes: vec![0, 1],
            ..Default::default()
        });
        let avr = Avr109::with_config(&sim, fast());

        avr.send_block(MemoryType::Flash, &[1, 2, 3, 4]).unwrap();
        assert_eq!(sim.log().block_writes.len(), 3);
        assert_eq!(sim.flash(0, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_send_block_surfaces_last_error() {
        let sim = SimulatedBootloader::with_faults(BootloaderFaults {
            unconfirmed_writes: (0..5).collect(),
            ..Default::default()
        });
        let avr = Avr109::with_config(&sim, fast());

        let err = avr.send_block(MemoryType::Flash, &[1, 2]).unwrap_err();
        assert!(matches!(err, BootloaderError::NoResponse(ref op) if op == "BlockLoad"));
        assert_eq!(sim.log().block_writes.len(), 5);
    }

    #[test]
    fn test_send_block_waits_with_retry_timeout() {
        let sim = SimulatedBootloader::with_faults(BootloaderFaults {
            unconfirmed_writes: vec![0],
            ..Default::default()
        });
        let log = TimeoutLog::new(&sim);
        let config = Avr109Config {
            confirm_timeout: Duration::from_millis(7777),
            block_retry: RetryPolicy::new(2, 20, 0),
            ..fast()
        };
        let avr = Avr109::with_config(&log, config);

        avr.send_block(MemoryType::Flash, &[1, 2]).unwrap();
        assert_eq!(log.timeouts(), vec![Duration::from_millis(20); 2]);
    }

    #[test]
    fn test_signature_read_uses_retry_timeout() {
        let sim = SimulatedBootloader::new();
        let log = TimeoutLog::new(&sim);
        let config = Avr109Config {
            read_timeout: Duration::from_millis(900),
            signature_retry: RetryPolicy::new(3, 30, 0),
            ..fast()
        };
        let avr = Avr109::with_config(&log, config);

        avr.get_bootloader_signature().unwrap();
        // Wake-up drain, then the identifier read.
        assert_eq!(
            log.timeouts(),
            vec![Duration::from_millis(900), Duration::from_millis(30)]
        );
    }

    #[test]
    fn test_set_address_uses_confirm_timeout() {
        let sim = SimulatedBootloader::new();
        let log = TimeoutLog::new(&sim);
        let config = Avr109Config {
            confirm_timeout: Duration::from_millis(250),
            ..fast()
        };
        let avr = Avr109::with_config(&log, config);

        avr.send_address(0).unwrap();
        assert_eq!(log.timeouts(), vec![Duration::from_millis(250)]);
    }

    #[test]
    fn test_read_block_short() {
        let mock = MockTransport::new();
        mock.queue_bytes(&[1, 2, 3]);
        let avr = Avr109::with_config(&mock, fast());

        assert!(matches!(
            avr.read_block(MemoryType::Flash, 4),
            Err(BootloaderError::ShortRead { expected: 4, actual: 3, .. })
        ));
        assert_eq!(mock.get_writes(), vec![vec![b'g', 0, 4, b'F']]);
    }

    #[test]
    fn test_simple_commands() {
        let sim = SimulatedBootloader::new();
        let avr = Avr109::with_config(&sim, fast());

        avr.enter_program_mode().unwrap();
        assert!(sim.in_program_mode());
        avr.chip_erase().unwrap();
        avr.leave_program_mode().unwrap();
        assert!(!sim.in_program_mode());
        avr.exit_bootloader().unwrap();

        let log = sim.log();
        assert_eq!(log.commands, b"PeLE".to_vec());
        assert_eq!(log.erase_count, 1);
        assert_eq!(log.exit_count, 1);
    }

    #[test]
    fn test_queries() {
        let sim = SimulatedBootloader::new();
        let avr = Avr109::with_config(&sim, fast());

        assert_eq!(avr.get_bootloader_signature().unwrap(), "XBoot++");
        assert_eq!(avr.get_programmer_type().unwrap(), Some(b'S'));
        assert_eq!(avr.get_software_version().unwrap(), "1.7");
        assert!(avr.supports_auto_increment().unwrap());
        assert_eq!(avr.get_block_size().unwrap(), 128);
        assert_eq!(avr.get_device_list().unwrap(), vec![0x44]);
        assert_eq!(avr.get_device_signature().unwrap(), SIGNATURE_ATMEGA328P);
    }

    #[test]
    fn test_block_mode_unsupported() {
        let sim = SimulatedBootloader::new();
        sim.set_block_size(0);
        sim.set_auto_increment(false);
        let avr = Avr109::with_config(&sim, fast());

        assert_eq!(avr.get_block_size().unwrap(), 0);
        assert!(!avr.supports_auto_increment().unwrap());
    }

    #[test]
    fn test_signature_polling_retries() {
        let sim = SimulatedBootloader::with_faults(BootloaderFaults {
            bad_identifier_replies: 3,
            ..Default::default()
        });
        let avr = Avr109::with_config(&sim, fast());

        assert_eq!(avr.get_bootloader_signature().unwrap(), "XBoot++");
        assert_eq!(sim.log().count(AVR_BOOTLOADER_ID), 4);
        assert_eq!(sim.log().count(AVR_ESCAPE), 4);
    }

    #[test]
    fn test_signature_polling_gives_up() {
        let sim = SimulatedBootloader::with_faults(BootloaderFaults {
            bad_identifier_replies: 100,
            ..Default::default()
        });
        let avr = Avr109::with_config(&sim, fast());

        assert!(matches!(
            avr.get_bootloader_signature(),
            Err(BootloaderError::UnknownBootloader(_))
        ));
        assert_eq!(sim.log().count(AVR_BOOTLOADER_ID), 10);
    }
}
