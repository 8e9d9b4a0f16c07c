//! TNC-Core: host-side library for KISS radio modems (TNCs).
//!
//! This crate talks to a TNC over a byte stream (USB serial or a bound
//! Bluetooth RFCOMM port): it reads telemetry, changes settings, and
//! replaces the firmware through the AVR109 bootloader.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: KISS framing, command encoding, telemetry decoding
//! - **Transport**: Byte transport abstraction (serial port, mocks)
//! - **Client**: Receive loop and command path for a live TNC
//! - **Payload**: Intel HEX parsing and firmware segment assembly
//! - **Bootloader**: AVR109 request/response client
//! - **Session**: Firmware upload orchestration with erase-on-failure
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use tnc_core::{FirmwareImage, FirmwareLoader, SerialTransport, TncConfig};
//!
//! let config = TncConfig::default();
//! let transport = SerialTransport::open("/dev/ttyUSB0", config.serial.baud_rate)?;
//! let firmware = FirmwareImage::load("firmware.hex")?;
//!
//! let mut loader = FirmwareLoader::new(transport, firmware, config.upload);
//! loader.run_upload()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bootloader;
pub mod client;
pub mod config;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use bootloader::{Avr109, Avr109Config, BootloaderError};
pub use client::{ClientError, KissParameter, TncClient};
pub use config::{LinkConfig, SerialConfig, TncConfig, UploadConfig};
pub use events::{
    LogLevel, NullObserver, RecordingObserver, TncEvent, TncObserver, TracingObserver,
};
pub use payload::{FirmwareError, FirmwareImage, FirmwareSegment, HexError, HexRecord, MemoryType};
pub use protocol::{Command, Decoder, Packet, PacketError, Telemetry, Tone};
pub use retry::RetryPolicy;
pub use session::{DeviceInfo, FirmwareLoader, LoaderError};
pub use state::{BlockProgress, UploadState};
pub use transport::{MockTransport, SerialTransport, Transport, TransportError};
