//! Firmware image assembly and block iteration.
//!
//! Data records are merged into contiguous [`FirmwareSegment`]s; a gap in
//! the address sequence starts a new segment. Each segment is then streamed
//! to the bootloader in fixed-size blocks.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, trace};

use super::hex::{HexError, HexRecord, RecordType};

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Line {line}: {source}")]
    Hex {
        line: usize,
        #[source]
        source: HexError,
    },
    #[error("Image contains no data records")]
    NoData,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bootloader memory space a segment is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    #[default]
    Flash,
    Eeprom,
}

impl MemoryType {
    /// Tag byte used on the AVR109 wire.
    pub fn tag(self) -> u8 {
        match self {
            MemoryType::Flash => b'F',
            MemoryType::Eeprom => b'E',
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryType::Flash => write!(f, "Flash"),
            MemoryType::Eeprom => write!(f, "EEPROM"),
        }
    }
}

/// A contiguous run of firmware bytes destined for one base address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSegment {
    pub memory_type: MemoryType,
    pub start_address: u16,
    pub data: Vec<u8>,
}

impl FirmwareSegment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last byte address covered.
    pub fn end_address(&self) -> u32 {
        self.start_address as u32 + self.data.len() as u32
    }

    /// Iterate over `block_size` chunks of this segment.
    pub fn blocks(&self, block_size: usize) -> BlockIterator<'_> {
        BlockIterator::new(&self.data, self.start_address as u32, block_size)
    }
}

/// Parsed firmware image: ordered, non-empty segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    segments: Vec<FirmwareSegment>,
}

impl FirmwareImage {
    /// Load an Intel HEX file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FirmwareError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading firmware image");
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_hex_str(text: &str) -> Result<Self, FirmwareError> {
        Self::from_reader(text.as_bytes())
    }

    /// Parse records line by line, stopping at the first end-of-file record.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, FirmwareError> {
        let mut builder = SegmentBuilder::default();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = HexRecord::parse(&line).map_err(|source| FirmwareError::Hex {
                line: index + 1,
                source,
            })?;

            match record.record_type {
                RecordType::Data => builder.push(&record),
                RecordType::EndOfFile => {
                    trace!(line = index + 1, "End of file record");
                    break;
                }
                other => {
                    trace!(line = index + 1, record_type = %other, "Ignoring record");
                }
            }
        }

        let segments = builder.finish();
        if segments.is_empty() {
            return Err(FirmwareError::NoData);
        }

        let image = Self { segments };
        debug!(
            segments = image.segments.len(),
            bytes = image.total_len(),
            "Firmware image assembled"
        );
        Ok(image)
    }

    pub fn segments(&self) -> &[FirmwareSegment] {
        &self.segments
    }

    /// Sum of segment lengths.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(FirmwareSegment::len).sum()
    }

    /// Blocks needed to write the whole image.
    pub fn block_count(&self, block_size: usize) -> usize {
        self.segments
            .iter()
            .map(|s| s.blocks(block_size).total())
            .sum()
    }
}

#[derive(Default)]
struct SegmentBuilder {
    segments: Vec<FirmwareSegment>,
    current: Option<FirmwareSegment>,
    expected: u32,
}

impl SegmentBuilder {
    fn push(&mut self, record: &HexRecord) {
        let contiguous = self.current.is_some() && record.address as u32 == self.expected;
        if !contiguous {
            self.close();
            trace!(address = %format!("0x{:04X}", record.address), "New segment");
            self.current = Some(FirmwareSegment {
                memory_type: MemoryType::Flash,
                start_address: record.address,
                data: Vec::new(),
            });
        }
        if let Some(segment) = self.current.as_mut() {
            segment.data.extend_from_slice(&record.data);
        }
        self.expected = record.end_address();
    }

    fn close(&mut self) {
        if let Some(segment) = self.current.take() {
            if !segment.is_empty() {
                self.segments.push(segment);
            }
        }
    }

    fn finish(mut self) -> Vec<FirmwareSegment> {
        self.close();
        self.segments
    }
}

/// One bootloader transfer unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    /// Byte address of the first byte.
    pub address: u32,
    pub data: &'a [u8],
}

impl Block<'_> {
    /// Data padded with 0xFF to an even length for word-sized transfers.
    pub fn padded(&self) -> Vec<u8> {
        let mut out = self.data.to_vec();
        if out.len() % 2 != 0 {
            out.push(0xFF);
        }
        out
    }
}

/// Iterator over fixed-size blocks with a short final block.
#[derive(Debug)]
pub struct BlockIterator<'a> {
    data: &'a [u8],
    base: u32,
    block_size: usize,
    offset: usize,
    current: usize,
}

impl<'a> BlockIterator<'a> {
    pub fn new(data: &'a [u8], base: u32, block_size: usize) -> Self {
        Self {
            data,
            base,
            block_size: block_size.max(1),
            offset: 0,
            current: 0,
        }
    }

    /// Total number of blocks (including partial).
    pub fn total(&self) -> usize {
        self.data.len().div_ceil(self.block_size)
    }

    /// Blocks yielded so far.
    pub fn current(&self) -> usize {
        self.current
    }
}

impl<'a> Iterator for BlockIterator<'a> {
    type Item = Block<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let end = (self.offset + self.block_size).min(self.data.len());
        let block = Block {
            address: self.base + self.offset as u32,
            data: &self.data[self.offset..end],
        };
        self.offset = end;
        self.current += 1;

        Some(block)
    }
}
