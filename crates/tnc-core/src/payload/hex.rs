//! Intel HEX record parsing.
//!
//! One text line in, one validated [`HexRecord`] out. Segment assembly
//! lives in [`super::firmware`].

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    #[error("Missing ':' start code")]
    MissingStartCode,
    #[error("Invalid hex digits in record")]
    InvalidDigits,
    #[error("Record too short: {0} bytes")]
    TooShort(usize),
    #[error("Byte count {declared} does not match {actual} data bytes")]
    ByteCountMismatch { declared: u8, actual: usize },
    #[error("Unknown record type 0x{0:02X}")]
    UnknownRecordType(u8),
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

impl HexError {
    /// True for every malformed-structure error, false for a bad checksum.
    pub fn is_format_error(&self) -> bool {
        !matches!(self, HexError::ChecksumMismatch { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
}

impl TryFrom<u8> for RecordType {
    type Error = HexError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::EndOfFile),
            0x02 => Ok(Self::ExtendedSegmentAddress),
            0x03 => Ok(Self::StartSegmentAddress),
            0x04 => Ok(Self::ExtendedLinearAddress),
            0x05 => Ok(Self::StartLinearAddress),
            other => Err(HexError::UnknownRecordType(other)),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Data => write!(f, "DATA"),
            RecordType::EndOfFile => write!(f, "EOF"),
            RecordType::ExtendedSegmentAddress => write!(f, "EXT_SEGMENT_ADDR"),
            RecordType::StartSegmentAddress => write!(f, "START_SEGMENT_ADDR"),
            RecordType::ExtendedLinearAddress => write!(f, "EXT_LINEAR_ADDR"),
            RecordType::StartLinearAddress => write!(f, "START_LINEAR_ADDR"),
        }
    }
}

/// One parsed Intel HEX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub address: u16,
    pub record_type: RecordType,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl HexRecord {
    /// Parse one line (`:LLAAAATT<data>CC`).
    ///
    /// Surrounding whitespace, including a trailing `\r`, is ignored.
    pub fn parse(line: &str) -> Result<Self, HexError> {
        let body = line
            .trim()
            .strip_prefix(':')
            .ok_or(HexError::MissingStartCode)?;
        let bytes = decode_hex(body)?;

        // count + address (2) + type + checksum
        if bytes.len() < 5 {
            return Err(HexError::TooShort(bytes.len()));
        }

        let (fields, checksum) = bytes.split_at(bytes.len() - 1);
        let checksum = checksum[0];
        let expected = Self::compute_checksum(fields);
        if expected != checksum {
            return Err(HexError::ChecksumMismatch {
                expected,
                actual: checksum,
            });
        }

        let byte_count = fields[0];
        let data = &fields[4..];
        if byte_count as usize != data.len() {
            return Err(HexError::ByteCountMismatch {
                declared: byte_count,
                actual: data.len(),
            });
        }

        Ok(Self {
            address: u16::from_be_bytes([fields[1], fields[2]]),
            record_type: RecordType::try_from(fields[3])?,
            data: data.to_vec(),
            checksum,
        })
    }

    /// Two's complement of the byte sum, modulo 256.
    pub fn compute_checksum(bytes: &[u8]) -> u8 {
        bytes
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
            .wrapping_neg()
    }

    pub fn byte_count(&self) -> u8 {
        self.data.len() as u8
    }

    /// Address of the byte following this record's data.
    pub fn end_address(&self) -> u32 {
        self.address as u32 + self.data.len() as u32
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>, HexError> {
    let text = text.as_bytes();
    if text.len() % 2 != 0 {
        return Err(HexError::InvalidDigits);
    }
    text.chunks_exact(2)
        .map(|pair| {
            let hi = hex_nibble(pair[0])?;
            let lo = hex_nibble(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn hex_nibble(c: u8) -> Result<u8, HexError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(HexError::InvalidDigits),
    }
}
