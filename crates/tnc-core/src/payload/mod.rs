//! Firmware payload handling: Intel HEX records and segment assembly.

pub mod firmware;
pub mod hex;

pub use firmware::{
    Block, BlockIterator, FirmwareError, FirmwareImage, FirmwareSegment, MemoryType,
};
pub use hex::{HexError, HexRecord, RecordType};
