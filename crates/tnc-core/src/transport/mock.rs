//! Mock transports for testing.
//!
//! - [`MockTransport`]: scripted inbound byte stream with captured writes.
//! - [`SimulatedBootloader`]: a stateful AVR109 (XBoot) device with fault
//!   injection, for driving the firmware loader end to end.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::traits::{Transport, TransportError};
use crate::protocol::constants::*;

/// Upper bound on how long an idle mock read blocks, so receive loops
/// polling a mock do not spin.
const IDLE_READ: Duration = Duration::from_millis(5);

/// Mock transport for unit testing the framing and client logic.
pub struct MockTransport {
    /// Bytes waiting to be read.
    inbound: Arc<Mutex<VecDeque<u8>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Replies queued when a matching write is seen.
    replies: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inbound: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue raw bytes to be returned by subsequent reads.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Queue `reply` every time exactly `request` is written.
    pub fn reply_to(&self, request: &[u8], reply: &[u8]) {
        self.replies
            .lock()
            .unwrap()
            .push((request.to_vec(), reply.to_vec()));
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn take_available(&self, max_len: usize) -> Vec<u8> {
        let mut inbound = self.inbound.lock().unwrap();
        let n = max_len.min(inbound.len());
        inbound.drain(..n).collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        let replies = self.replies.lock().unwrap();
        for (request, reply) in replies.iter() {
            if request.as_slice() == data {
                self.queue_bytes(reply);
            }
        }
        Ok(data.len())
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let bytes = self.take_available(max_len);
        if !bytes.is_empty() {
            return Ok(bytes);
        }
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        thread::sleep(timeout.min(IDLE_READ));
        Ok(Vec::new())
    }

    /// Everything the mock will ever produce is already queued, so an
    /// empty queue means the deadline would pass with nothing more.
    fn read_exact_timeout(&self, len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let bytes = self.take_available(len);
        if bytes.is_empty() && !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(bytes)
    }
}

/// Fault injection for [`SimulatedBootloader`].
#[derive(Debug, Clone, Default)]
pub struct BootloaderFaults {
    /// Zero-based index of the block read whose first byte is flipped.
    pub corrupt_read: Option<usize>,
    /// Zero-based indices of block writes that are not confirmed.
    pub unconfirmed_writes: Vec<usize>,
    /// Number of identifier queries answered with garbage first.
    pub bad_identifier_replies: usize,
    /// Drop the confirmation for set-address.
    pub unconfirmed_address: bool,
}

/// What the simulated device has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct BootloaderLog {
    /// Command letters in the order received.
    pub commands: Vec<u8>,
    /// Byte address and data of every block write.
    pub block_writes: Vec<(u32, Vec<u8>)>,
    /// Byte address and length of every block read.
    pub block_reads: Vec<(u32, usize)>,
    pub erase_count: usize,
    pub exit_count: usize,
}

impl BootloaderLog {
    pub fn count(&self, command: u8) -> usize {
        self.commands.iter().filter(|&&c| c == command).count()
    }
}

struct SimState {
    flash: Vec<u8>,
    /// Word address.
    address: u32,
    program_mode: bool,
    input: Vec<u8>,
    output: VecDeque<u8>,
    log: BootloaderLog,
    faults: BootloaderFaults,
    identifier_queries: usize,
    signature: [u8; 3],
    block_size: u16,
    auto_increment: bool,
}

/// Simulated AVR109 device speaking the XBoot dialect.
pub struct SimulatedBootloader {
    state: Mutex<SimState>,
}

impl SimulatedBootloader {
    pub const FLASH_SIZE: usize = 32 * 1024;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                flash: vec![0xFF; Self::FLASH_SIZE],
                address: 0,
                program_mode: false,
                input: Vec::new(),
                output: VecDeque::new(),
                log: BootloaderLog::default(),
                faults: BootloaderFaults::default(),
                identifier_queries: 0,
                signature: SIGNATURE_ATMEGA328P,
                block_size: BLOCK_SIZE,
                auto_increment: true,
            }),
        }
    }

    pub fn with_faults(faults: BootloaderFaults) -> Self {
        let sim = Self::new();
        sim.set_faults(faults);
        sim
    }

    /// Replace the active faults, e.g. after a clean write phase.
    pub fn set_faults(&self, faults: BootloaderFaults) {
        self.state.lock().unwrap().faults = faults;
    }

    pub fn set_signature(&self, signature: [u8; 3]) {
        self.state.lock().unwrap().signature = signature;
    }

    pub fn set_block_size(&self, block_size: u16) {
        self.state.lock().unwrap().block_size = block_size;
    }

    pub fn set_auto_increment(&self, supported: bool) {
        self.state.lock().unwrap().auto_increment = supported;
    }

    pub fn log(&self) -> BootloaderLog {
        self.state.lock().unwrap().log.clone()
    }

    pub fn in_program_mode(&self) -> bool {
        self.state.lock().unwrap().program_mode
    }

    /// Copy of flash memory starting at `byte_address`.
    pub fn flash(&self, byte_address: usize, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.flash[byte_address..byte_address + len].to_vec()
    }
}

impl Default for SimulatedBootloader {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    /// Execute every complete command sitting in the input buffer.
    fn process(&mut self) {
        loop {
            let Some(&cmd) = self.input.first() else {
                return;
            };
            let needed = match cmd {
                AVR_SET_ADDRESS => 3,
                AVR_READ_BLOCK => 4,
                AVR_WRITE_BLOCK => {
                    if self.input.len() < 4 {
                        return;
                    }
                    4 + self.input[2] as usize
                }
                _ => 1,
            };
            if self.input.len() < needed {
                return;
            }
            let frame: Vec<u8> = self.input.drain(..needed).collect();
            self.execute(&frame);
        }
    }

    fn execute(&mut self, frame: &[u8]) {
        let cmd = frame[0];
        self.log.commands.push(cmd);
        match cmd {
            AVR_ESCAPE => {}
            AVR_SET_ADDRESS => {
                self.address = ((frame[1] as u32) << 8) | frame[2] as u32;
                if !self.faults.unconfirmed_address {
                    self.output.push_back(AVR_CONFIRM);
                }
            }
            AVR_WRITE_BLOCK => {
                let index = self.log.block_writes.len();
                let data = &frame[4..];
                let start = (self.address * 2) as usize;
                self.log.block_writes.push((start as u32, data.to_vec()));
                if self.faults.unconfirmed_writes.contains(&index) {
                    return;
                }
                self.flash[start..start + data.len()].copy_from_slice(data);
                self.address += (data.len() / 2) as u32;
                self.output.push_back(AVR_CONFIRM);
            }
            AVR_READ_BLOCK => {
                let index = self.log.block_reads.len();
                let len = frame[2] as usize;
                let start = (self.address * 2) as usize;
                self.log.block_reads.push((start as u32, len));
                let mut data = self.flash[start..start + len].to_vec();
                if self.faults.corrupt_read == Some(index) {
                    if let Some(first) = data.first_mut() {
                        *first ^= 0xFF;
                    }
                }
                self.output.extend(data);
                self.address += (len / 2) as u32;
            }
            AVR_CHIP_ERASE => {
                self.flash.fill(0xFF);
                self.log.erase_count += 1;
                self.output.push_back(AVR_CONFIRM);
            }
            AVR_ENTER_PROGRAM_MODE => {
                self.program_mode = true;
                self.output.push_back(AVR_CONFIRM);
            }
            AVR_LEAVE_PROGRAM_MODE => {
                self.program_mode = false;
                self.output.push_back(AVR_CONFIRM);
            }
            AVR_EXIT_BOOTLOADER => {
                self.log.exit_count += 1;
                self.output.push_back(AVR_CONFIRM);
            }
            AVR_AUTO_INCREMENT => {
                let answer = if self.auto_increment { AVR_YES } else { b'N' };
                self.output.push_back(answer);
            }
            AVR_BLOCK_SIZE => {
                if self.block_size == 0 {
                    self.output.push_back(b'N');
                } else {
                    self.output.push_back(AVR_YES);
                    self.output.extend(self.block_size.to_be_bytes());
                }
            }
            AVR_BOOTLOADER_ID => {
                self.identifier_queries += 1;
                if self.identifier_queries <= self.faults.bad_identifier_replies {
                    self.output.extend(b"???????");
                } else {
                    self.output.extend(XBOOT_ID.iter().copied());
                }
            }
            AVR_SOFTWARE_VERSION => self.output.extend(b"17"),
            AVR_PROGRAMMER_TYPE => self.output.push_back(b'S'),
            AVR_DEVICE_LIST => self.output.extend([0x44, 0x00]),
            AVR_DEVICE_SIGNATURE => self.output.extend(self.signature),
            _ => self.output.push_back(b'?'),
        }
    }
}

impl Transport for SimulatedBootloader {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.input.extend_from_slice(data);
        state.process();
        Ok(data.len())
    }

    fn read(&self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        let n = max_len.min(state.output.len());
        Ok(state.output.drain(..n).collect())
    }

    fn read_exact_timeout(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.read(len, timeout)
    }
}
