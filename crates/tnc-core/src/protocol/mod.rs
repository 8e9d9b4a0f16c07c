//! Protocol module - KISS framing, packets and telemetry.

pub mod constants;
pub mod kiss;
pub mod packet;
pub mod telemetry;

pub use constants::*;
pub use kiss::{DecodeState, Decoder, encode};
pub use packet::{Command, Packet, Tone};
pub use telemetry::{Capabilities, MacAddress, PacketError, Telemetry};
