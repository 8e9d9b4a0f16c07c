//! Runtime configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::bootloader::Avr109Config;
use crate::protocol::constants::{BLOCK_SIZE, SUPPORTED_SIGNATURES};
use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TncConfig {
    pub serial: SerialConfig,
    pub link: LinkConfig,
    pub upload: UploadConfig,
}

impl TncConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TncConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Serial port selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `/dev/rfcomm0`.
    pub port: Option<String>,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
        }
    }
}

/// Command client timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Receive-loop poll interval.
    pub read_timeout_ms: u64,
    /// Pause between the commands sent on connect.
    pub settle_delay_ms: u64,
    /// Retry budget for settings that expect an echo.
    pub request: RetryPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 100,
            settle_delay_ms: 1_000,
            request: RetryPolicy::new(5, 500, 0),
        }
    }
}

impl LinkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Firmware upload parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Block size the bootloader must report.
    pub block_size: u16,
    /// Device signatures the image may be written to.
    pub accepted_signatures: Vec<[u8; 3]>,
    pub confirm_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Erase the chip before writing.
    pub erase_before_write: bool,
    /// Wait after exiting the bootloader before reporting success.
    pub reboot_delay_ms: u64,
    pub block_retry: RetryPolicy,
    pub signature_retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            accepted_signatures: SUPPORTED_SIGNATURES.to_vec(),
            confirm_timeout_ms: 10_000,
            read_timeout_ms: 1_000,
            erase_before_write: false,
            reboot_delay_ms: 5_000,
            block_retry: RetryPolicy::new(5, 10_000, 50),
            signature_retry: RetryPolicy::new(10, 1_000, 100),
        }
    }
}

impl UploadConfig {
    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms)
    }

    /// Bootloader client settings derived from this configuration.
    pub fn avr109(&self) -> Avr109Config {
        Avr109Config {
            confirm_timeout: Duration::from_millis(self.confirm_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            block_retry: self.block_retry,
            signature_retry: self.signature_retry,
        }
    }
}
