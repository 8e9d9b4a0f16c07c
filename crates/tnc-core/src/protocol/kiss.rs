//! KISS frame encoder and streaming decoder.
//!
//! The decoder consumes one byte at a time and yields a [`Packet`] whenever a
//! closing `FEND` is seen. Reads from the link arrive in arbitrary pieces, so
//! all state survives between calls.

use std::fmt;

use tracing::{debug, trace};

use super::constants::{FEND, FESC, PACKET_HARDWARE, TFEND, TFESC};
use super::packet::Packet;

/// Encode a logical payload into a complete frame.
///
/// Output is `FEND`, the escaped payload, then `FEND`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FEND);
    for &b in payload {
        match b {
            FEND => out.extend_from_slice(&[FESC, TFEND]),
            FESC => out.extend_from_slice(&[FESC, TFESC]),
            _ => out.push(b),
        }
    }
    out.push(FEND);
    out
}

/// Decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    /// Between frames; bytes here are line noise.
    #[default]
    AwaitBoundary,
    /// Frame opened, next byte is the packet type.
    AwaitPacketType,
    /// Hardware packet, next byte is the sub-type.
    AwaitSubType,
    /// Accumulating payload until the closing boundary.
    AwaitData,
}

impl fmt::Display for DecodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeState::AwaitBoundary => write!(f, "AWAIT_BOUNDARY"),
            DecodeState::AwaitPacketType => write!(f, "AWAIT_PACKET_TYPE"),
            DecodeState::AwaitSubType => write!(f, "AWAIT_SUB_TYPE"),
            DecodeState::AwaitData => write!(f, "AWAIT_DATA"),
        }
    }
}

/// Streaming KISS decoder.
///
/// A malformed escape (`FESC` followed by anything other than `TFEND` or
/// `TFESC`) drops the offending byte together with the partial frame and
/// falls back to [`DecodeState::AwaitBoundary`]. The next unescaped `FEND`
/// then opens a fresh frame at [`DecodeState::AwaitPacketType`]; when that
/// `FEND` was really the tail of the damaged frame, the following frame's
/// opening `FEND` is absorbed as a duplicate boundary.
///
/// Dropping just the bad escape byte and carrying on with the frame would
/// also resynchronize. This decoder discards the whole frame instead, so a
/// packet is never delivered with bytes missing from its middle.
#[derive(Debug, Default)]
pub struct Decoder {
    state: DecodeState,
    escape: bool,
    packet_type: u8,
    sub_type: Option<u8>,
    data: Vec<u8>,
    noise: usize,
    malformed_escapes: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Number of malformed escape sequences dropped so far.
    pub fn malformed_escapes(&self) -> u64 {
        self.malformed_escapes
    }

    /// Feed a single byte, returning a packet when a frame closes.
    pub fn feed_byte(&mut self, byte: u8) -> Option<Packet> {
        let (byte, escaped) = if self.escape {
            self.escape = false;
            match byte {
                TFEND => (FEND, true),
                TFESC => (FESC, true),
                other => {
                    self.malformed_escapes += 1;
                    debug!(
                        byte = %format!("0x{:02X}", other),
                        state = %self.state,
                        "Malformed escape sequence, dropping frame"
                    );
                    self.reset_frame();
                    self.state = DecodeState::AwaitBoundary;
                    return None;
                }
            }
        } else if byte == FESC {
            self.escape = true;
            return None;
        } else {
            (byte, false)
        };

        let boundary = byte == FEND && !escaped;

        match self.state {
            DecodeState::AwaitBoundary => {
                if boundary {
                    if self.noise > 0 {
                        trace!(bytes = self.noise, "Discarded bytes outside frame");
                        self.noise = 0;
                    }
                    self.reset_frame();
                    self.state = DecodeState::AwaitPacketType;
                } else {
                    self.noise += 1;
                }
                None
            }
            DecodeState::AwaitPacketType => {
                if boundary {
                    // Duplicate boundary, or the opener of back-to-back frames.
                    return None;
                }
                self.packet_type = byte;
                self.state = if byte == PACKET_HARDWARE {
                    DecodeState::AwaitSubType
                } else {
                    DecodeState::AwaitData
                };
                None
            }
            DecodeState::AwaitSubType => {
                if boundary {
                    return Some(self.finish());
                }
                self.sub_type = Some(byte);
                self.state = DecodeState::AwaitData;
                None
            }
            DecodeState::AwaitData => {
                if boundary {
                    return Some(self.finish());
                }
                self.data.push(byte);
                None
            }
        }
    }

    /// Feed a buffer, collecting every packet completed within it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        bytes.iter().filter_map(|&b| self.feed_byte(b)).collect()
    }

    fn finish(&mut self) -> Packet {
        self.state = DecodeState::AwaitBoundary;
        Packet {
            packet_type: self.packet_type,
            sub_type: self.sub_type.take(),
            data: std::mem::take(&mut self.data),
        }
    }

    fn reset_frame(&mut self) {
        self.packet_type = 0;
        self.sub_type = None;
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Packet> {
        Decoder::new().feed(bytes)
    }

    #[test]
    fn test_encode_escapes() {
        assert_eq!(encode(&[0x06, FEND, 0x01]), vec![FEND, 0x06, FESC, TFEND, 0x01, FEND]);
        assert_eq!(encode(&[0x07, FESC]), vec![FEND, 0x07, FESC, TFESC, FEND]);
        assert_eq!(encode(b"\x06\x28"), vec![FEND, 0x06, 0x28, FEND]);
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(encode(&[]), vec![FEND, FEND]);
        assert!(decode_all(&encode(&[])).is_empty());
    }

    #[test]
    fn test_roundtrip_all_byte_values() {
        // Hardware and non-hardware leading bytes take different decoder paths.
        for lead in [0x06u8, 0x07, 0x01, FEND, FESC] {
            let mut payload = vec![lead];
            payload.extend(0..=255u8);
            let packets = decode_all(&encode(&payload));
            assert_eq!(packets.len(), 1, "lead byte 0x{:02X}", lead);
            assert_eq!(packets[0].to_bytes(), payload);
        }
    }

    #[test]
    fn test_roundtrip_short_payloads() {
        for payload in [&[0x06u8][..], &[0x06, FEND], &[0x07], &[FESC, FESC, FEND]] {
            let packets = decode_all(&encode(payload));
            assert_eq!(packets.len(), 1);
            assert_eq!(packets[0].to_bytes(), payload);
        }
    }

    #[test]
    fn test_escaped_boundary_inside_payload() {
        let packets = decode_all(&[0xC0, 0x06, 0x04, 0x01, 0xDB, 0xDC, 0x02, 0xC0]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, 0x06);
        assert_eq!(packets[0].sub_type, Some(0x04));
        assert_eq!(packets[0].data, vec![0x01, 0xC0, 0x02]);
        assert_eq!(packets[0].to_bytes(), vec![0x06, 0x04, 0x01, 0xC0, 0x02]);
    }

    #[test]
    fn test_spurious_boundary_closes_frame() {
        let packets = decode_all(&[0xC0, 0x06, 0x04, 0x01, 0xC0, 0xC0, 0x06, 0x06, 0x0F, 0xA0, 0xC0]);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data, vec![0x01]);
        assert_eq!(packets[1].sub_type, Some(0x06));
        assert_eq!(packets[1].data, vec![0x0F, 0xA0]);
    }

    #[test]
    fn test_duplicate_boundaries_ignored() {
        let packets = decode_all(&[0xC0, 0xC0, 0xC0, 0x07, b'h', b'i', 0xC0]);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_log());
        assert_eq!(packets[0].sub_type, None);
        assert_eq!(packets[0].data, b"hi".to_vec());
    }

    #[test]
    fn test_noise_before_frame() {
        let packets = decode_all(&[0x41, 0x42, 0x43, 0xC0, 0x06, 0x28, b'1', 0xC0]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, b"1".to_vec());
    }

    #[test]
    fn test_partial_reads() {
        let frame = encode(&[0x06, 0x06, FEND, FESC, 0x10]);
        let mut decoder = Decoder::new();
        let mut packets = Vec::new();
        for chunk in frame.chunks(2) {
            packets.extend(decoder.feed(chunk));
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![FEND, FESC, 0x10]);
    }

    #[test]
    fn test_escape_split_across_reads() {
        let mut decoder = Decoder::new();
        assert!(decoder.feed(&[0xC0, 0x06, 0x04, 0xDB]).is_empty());
        let packets = decoder.feed(&[0xDD, 0xC0]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![FESC]);
    }

    #[test]
    fn test_malformed_escape_in_data_resyncs() {
        let mut decoder = Decoder::new();
        // Damaged frame: FESC followed by 0x41.
        let damaged = [0xC0, 0x06, 0x04, 0x01, 0xDB, 0x41, 0x02, 0xC0];
        assert!(decoder.feed(&damaged).is_empty());
        assert_eq!(decoder.malformed_escapes(), 1);
        // The damaged frame's closing FEND reopened a frame.
        assert_eq!(decoder.state(), DecodeState::AwaitPacketType);

        let packets = decoder.feed(&[0xC0, 0x06, 0x06, 0x0F, 0xA0, 0xC0]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].sub_type, Some(0x06));
        assert_eq!(packets[0].data, vec![0x0F, 0xA0]);
    }

    #[test]
    fn test_malformed_escape_drops_whole_frame() {
        let stream = [0xC0, 0x07, b'a', 0xDB, 0x41, b'b', 0xC0, 0xC0, 0x07, b'c', 0xC0];
        let packets = decode_all(&stream);
        // Nothing of the damaged frame survives, not even the bytes around the bad escape.
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, b"c".to_vec());
    }

    #[test]
    fn test_malformed_escape_at_packet_type() {
        let mut decoder = Decoder::new();
        assert!(decoder.feed(&[0xC0, 0xDB, 0x00]).is_empty());
        assert_eq!(decoder.state(), DecodeState::AwaitBoundary);

        // Trailing bytes of the damaged frame are noise until the next FEND.
        let packets = decoder.feed(&[0x04, 0x05, 0xC0, 0x07, b'o', b'k', 0xC0]);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_log());
        assert_eq!(packets[0].data, b"ok".to_vec());
    }

    #[test]
    fn test_escaped_boundary_outside_frame_is_noise() {
        let packets = decode_all(&[0xDB, 0xDC, 0x07, 0xC0]);
        assert!(packets.is_empty());
    }

    #[test]
    fn test_hardware_packet_without_sub_type() {
        let packets = decode_all(&[0xC0, 0x06, 0xC0]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].sub_type, None);
        assert!(packets[0].data.is_empty());
    }
}
