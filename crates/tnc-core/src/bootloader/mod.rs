//! Bootloader protocol client.

pub mod avr109;

pub use avr109::{Avr109, Avr109Config, BootloaderError, MAX_BLOCK_LEN};
