//! Firmware loader: drives an upload through the AVR109 bootloader.
//!
//! Failure policy by phase:
//! - initialization failures exit the bootloader and touch nothing else;
//! - write failures erase the chip, then leave program mode;
//! - verify failures erase the chip and are reported as `false`.
//!
//! The exit command is sent at most once per loader.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::bootloader::{Avr109, BootloaderError, MAX_BLOCK_LEN};
use crate::config::UploadConfig;
use crate::events::{LogLevel, TncEvent, TncObserver, TracingObserver};
use crate::payload::FirmwareImage;
use crate::state::{BlockProgress, UploadContext, UploadState};
use crate::transport::Transport;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Device validation failed: {0}")]
    Validation(String),

    #[error("Verify failed at 0x{address:04X}")]
    Verification { address: u32 },

    #[error("Bootloader error: {0}")]
    Bootloader(#[from] BootloaderError),

    #[error("Bootloader session already closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything read from the bootloader during initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bootloader: String,
    pub programmer_type: Option<u8>,
    pub software_version: String,
    pub auto_increment: bool,
    pub block_size: u16,
    pub device_list: Vec<u8>,
    pub signature: [u8; 3],
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let programmer = self
            .programmer_type
            .map(|p| (p as char).to_string())
            .unwrap_or_else(|| "?".to_string());
        writeln!(f, "  Found programmer: Id = '{}'; type = '{}'", self.bootloader, programmer)?;
        writeln!(f, "Programmer Version: {}", self.software_version)?;
        writeln!(f, "Has auto-increment: {}", self.auto_increment)?;
        writeln!(
            f,
            "    Has block-mode: {} (size = {})",
            self.block_size > 0,
            self.block_size
        )?;
        write!(
            f,
            "  Device Signature: {:02x} {:02x} {:02x}",
            self.signature[0], self.signature[1], self.signature[2]
        )
    }
}

/// One firmware upload session.
pub struct FirmwareLoader<T: Transport, O: TncObserver> {
    /// Cleared by `exit`, so the exit command fires once.
    avr: Option<Avr109<T>>,
    firmware: FirmwareImage,
    config: UploadConfig,
    observer: Arc<O>,
    ctx: UploadContext,
    device: Option<DeviceInfo>,
}

impl<T: Transport> FirmwareLoader<T, TracingObserver> {
    /// Create a loader reporting through tracing.
    pub fn new(transport: T, firmware: FirmwareImage, config: UploadConfig) -> Self {
        Self::with_observer(transport, firmware, config, Arc::new(TracingObserver))
    }
}

impl<T: Transport, O: TncObserver> FirmwareLoader<T, O> {
    pub fn with_observer(
        transport: T,
        firmware: FirmwareImage,
        config: UploadConfig,
        observer: Arc<O>,
    ) -> Self {
        let avr = Avr109::with_config(transport, config.avr109());
        Self {
            avr: Some(avr),
            firmware,
            config,
            observer,
            ctx: UploadContext::new(),
            device: None,
        }
    }

    pub fn state(&self) -> UploadState {
        self.ctx.state
    }

    /// Blocks done in the current write or verify pass.
    pub fn progress(&self) -> BlockProgress {
        self.ctx.progress
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    pub fn firmware(&self) -> &FirmwareImage {
        &self.firmware
    }

    fn avr(&self) -> Result<&Avr109<T>, LoaderError> {
        self.avr.as_ref().ok_or(LoaderError::SessionClosed)
    }

    fn goto(&mut self, state: UploadState) {
        if self.ctx.state == state {
            return;
        }
        let from = self.ctx.goto_state(state);
        self.observer
            .on_event(&TncEvent::PhaseChanged { from, to: state });
    }

    fn log(&self, level: LogLevel, message: String) {
        self.observer.on_event(&TncEvent::Log { level, message });
    }

    fn report_progress(&self) {
        let BlockProgress { current, total } = self.ctx.progress;
        trace!(current, total, pct = self.ctx.progress.progress_pct(), "Block done");
        self.observer.on_event(&TncEvent::Progress { current, total });
    }

    /// Identify the bootloader and check the device can take this image.
    ///
    /// On any failure the bootloader is exited; nothing is erased.
    #[instrument(skip(self))]
    pub fn initialize(&mut self) -> Result<DeviceInfo, LoaderError> {
        self.goto(UploadState::Initializing);

        let result = self.query_device().and_then(|info| {
            self.validate(&info)?;
            Ok(info)
        });

        match result {
            Ok(info) => {
                info!(
                    bootloader = %info.bootloader,
                    version = %info.software_version,
                    signature = %format!("{:02X} {:02X} {:02X}", info.signature[0], info.signature[1], info.signature[2]),
                    "Bootloader ready"
                );
                self.device = Some(info.clone());
                self.goto(UploadState::ReadyToProgram);
                Ok(info)
            }
            Err(e) => {
                error!(error = %e, "Initialization failed");
                if let Err(exit_err) = self.exit() {
                    warn!(error = %exit_err, "Exit after failed initialization also failed");
                }
                self.goto(UploadState::Failed);
                Err(e)
            }
        }
    }

    fn query_device(&self) -> Result<DeviceInfo, LoaderError> {
        let avr = self.avr()?;
        Ok(DeviceInfo {
            bootloader: avr.get_bootloader_signature()?,
            programmer_type: avr.get_programmer_type()?,
            software_version: avr.get_software_version()?,
            auto_increment: avr.supports_auto_increment()?,
            block_size: avr.get_block_size()?,
            device_list: avr.get_device_list()?,
            signature: avr.get_device_signature()?,
        })
    }

    fn validate(&self, info: &DeviceInfo) -> Result<(), LoaderError> {
        if self.config.block_size as usize > MAX_BLOCK_LEN {
            return Err(LoaderError::Validation(format!(
                "block size {} exceeds the {MAX_BLOCK_LEN}-byte transfer limit",
                self.config.block_size
            )));
        }
        if !self.config.accepted_signatures.contains(&info.signature) {
            return Err(LoaderError::Validation(format!(
                "bad device signature {:02X} {:02X} {:02X}",
                info.signature[0], info.signature[1], info.signature[2]
            )));
        }
        if !info.auto_increment {
            return Err(LoaderError::Validation(
                "bootloader does not support auto-increment".to_string(),
            ));
        }
        if info.block_size != self.config.block_size {
            return Err(LoaderError::Validation(format!(
                "unexpected block size {} (expected {})",
                info.block_size, self.config.block_size
            )));
        }
        Ok(())
    }

    /// Erase the whole chip: enter program mode, erase, leave.
    pub fn chip_erase(&self) -> Result<(), LoaderError> {
        let avr = self.avr()?;
        info!("Erasing chip");
        avr.enter_program_mode()?;
        avr.chip_erase()?;
        avr.leave_program_mode()?;
        Ok(())
    }

    /// Write every segment. Program mode is always left before returning;
    /// on failure the chip is erased first.
    #[instrument(skip(self))]
    pub fn load(&mut self) -> Result<(), LoaderError> {
        self.goto(UploadState::Writing);

        let written = self.write_segments();
        let avr = self.avr()?;

        if let Err(e) = &written {
            error!(error = %e, "Write failed, erasing chip");
            if let Err(erase_err) = avr.chip_erase() {
                warn!(error = %erase_err, "Chip erase after failed write also failed");
            }
        }

        let left = avr.leave_program_mode();
        match written {
            Err(e) => {
                if let Err(leave_err) = left {
                    warn!(error = %leave_err, "Could not leave program mode");
                }
                self.log(LogLevel::Error, format!("Write failed: {e}"));
                Err(e)
            }
            Ok(()) => {
                left?;
                info!(bytes = self.firmware.total_len(), "Firmware written");
                Ok(())
            }
        }
    }

    fn write_segments(&mut self) -> Result<(), LoaderError> {
        let avr = self.avr.as_ref().ok_or(LoaderError::SessionClosed)?;
        let block_size = self.config.block_size as usize;
        self.ctx.progress = BlockProgress::new(self.firmware.block_count(block_size));

        avr.enter_program_mode()?;
        for segment in self.firmware.segments() {
            debug!(
                address = %format!("0x{:04X}", segment.start_address),
                len = segment.len(),
                "Writing segment"
            );
            avr.send_address(segment.start_address as u32)?;
            for block in segment.blocks(block_size) {
                avr.send_block(segment.memory_type, &block.padded())?;
                self.ctx.progress.advance();
                self.report_progress();
            }
        }
        Ok(())
    }

    /// Read back and compare every segment.
    ///
    /// Any failure erases the chip and yields `false`.
    pub fn verify(&mut self) -> bool {
        self.verify_or_erase().is_ok()
    }

    #[instrument(skip(self))]
    fn verify_or_erase(&mut self) -> Result<(), LoaderError> {
        self.goto(UploadState::Verifying);

        let result = self.read_back();
        if let Err(e) = &result {
            error!(error = %e, "Verify failed, erasing chip");
            self.log(LogLevel::Error, format!("Verify failed: {e}"));
            if let Err(erase_err) = self.chip_erase() {
                warn!(error = %erase_err, "Chip erase after failed verify also failed");
            }
        } else {
            info!("Firmware verified");
        }
        result
    }

    fn read_back(&mut self) -> Result<(), LoaderError> {
        let avr = self.avr.as_ref().ok_or(LoaderError::SessionClosed)?;
        let block_size = self.config.block_size as usize;
        self.ctx.progress = BlockProgress::new(self.firmware.block_count(block_size));

        for segment in self.firmware.segments() {
            avr.send_address(segment.start_address as u32)?;
            for block in segment.blocks(block_size) {
                let len = block.padded().len() as u8;
                let data = avr.read_block(segment.memory_type, len)?;
                if data[..block.data.len()] != *block.data {
                    return Err(LoaderError::Verification {
                        address: block.address,
                    });
                }
                self.ctx.progress.advance();
                self.report_progress();
            }
        }
        Ok(())
    }

    /// Leave the bootloader. Safe to call more than once.
    pub fn exit(&mut self) -> Result<(), LoaderError> {
        let Some(avr) = self.avr.take() else {
            debug!("Bootloader already exited");
            return Ok(());
        };
        self.goto(UploadState::Exiting);
        avr.exit_bootloader()?;
        info!("Bootloader exited");
        Ok(())
    }

    /// Initialize, optionally erase, write, verify and exit.
    ///
    /// Reports `UploadSucceeded` after the reboot delay, or `UploadFailed`.
    #[instrument(skip(self))]
    pub fn run_upload(&mut self) -> Result<(), LoaderError> {
        if self.ctx.state.is_terminal() {
            return Err(LoaderError::SessionClosed);
        }
        info!(
            bytes = self.firmware.total_len(),
            segments = self.firmware.segments().len(),
            "Starting firmware upload"
        );
        let steps = self.run_steps();
        let exited = self.exit();
        if let (Err(_), Err(exit_err)) = (&steps, &exited) {
            warn!(error = %exit_err, "Exit after failed upload also failed");
        }

        let result = steps.and(exited);
        match &result {
            Ok(()) => {
                let delay = self.config.reboot_delay();
                if !delay.is_zero() {
                    debug!(delay_ms = self.config.reboot_delay_ms, "Waiting for reboot");
                    thread::sleep(delay);
                }
                self.goto(UploadState::Done);
                self.observer.on_event(&TncEvent::UploadSucceeded);
            }
            Err(e) => {
                self.goto(UploadState::Failed);
                self.observer.on_event(&TncEvent::UploadFailed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn run_steps(&mut self) -> Result<(), LoaderError> {
        self.initialize()?;
        if self.config.erase_before_write {
            self.goto(UploadState::Erasing);
            self.chip_erase()?;
        }
        self.load()?;
        self.verify_or_erase()
    }
}

impl<T, O> FirmwareLoader<T, O>
where
    T: Transport + 'static,
    O: TncObserver + 'static,
{
    /// Run the whole upload on a dedicated thread.
    pub fn spawn(mut self) -> Result<JoinHandle<Result<(), LoaderError>>, LoaderError> {
        let handle = thread::Builder::new()
            .name("tnc-upload".to_string())
            .spawn(move || self.run_upload())?;
        Ok(handle)
    }
}

impl<T: Transport, O: TncObserver> Drop for FirmwareLoader<T, O> {
    fn drop(&mut self) {
        if self.ctx.state.is_destructive() {
            warn!(state = %self.ctx.state, "Loader dropped before the upload finished");
        }
        if self.avr.is_some() {
            if let Err(e) = self.exit() {
                warn!(error = %e, "Exit on drop failed");
            }
        }
    }
}
