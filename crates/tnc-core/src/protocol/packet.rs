//! Decoded packets and outbound commands.

use byteorder::{BigEndian, WriteBytesExt};
use chrono::{Datelike, NaiveDateTime, Timelike};

use super::constants::*;

/// Payload of one decoded frame.
///
/// Hardware packets (type 0x06) carry a sub-type; every other packet type,
/// log packets included, carries only data after the type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u8,
    pub sub_type: Option<u8>,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn hardware(sub_type: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            packet_type: PACKET_HARDWARE,
            sub_type: Some(sub_type),
            data: data.into(),
        }
    }

    pub fn log(text: &str) -> Self {
        Self {
            packet_type: PACKET_LOG,
            sub_type: None,
            data: text.as_bytes().to_vec(),
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.packet_type == PACKET_HARDWARE
    }

    pub fn is_log(&self) -> bool {
        self.packet_type == PACKET_LOG
    }

    /// Unescaped frame payload: type, optional sub-type, data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.push(self.packet_type);
        if let Some(sub) = self.sub_type {
            out.push(sub);
        }
        out.extend_from_slice(&self.data);
        out
    }
}

/// PTT tone selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tone {
    #[default]
    None,
    Space,
    Mark,
    Both,
}

impl Tone {
    /// Tone after toggling the mark component.
    pub fn with_mark(self, on: bool) -> Self {
        match (self, on) {
            (Tone::None, true) | (Tone::Mark, true) => Tone::Mark,
            (Tone::Space, true) | (Tone::Both, true) => Tone::Both,
            (Tone::Both, false) | (Tone::Space, false) => Tone::Space,
            (Tone::Mark, false) | (Tone::None, false) => Tone::None,
        }
    }

    /// Tone after toggling the space component.
    pub fn with_space(self, on: bool) -> Self {
        match (self, on) {
            (Tone::None, true) | (Tone::Space, true) => Tone::Space,
            (Tone::Mark, true) | (Tone::Both, true) => Tone::Both,
            (Tone::Both, false) | (Tone::Mark, false) => Tone::Mark,
            (Tone::Space, false) | (Tone::None, false) => Tone::None,
        }
    }
}

/// Host -> TNC command.
///
/// Commands are fire-and-forget; replies, when any, arrive later as
/// telemetry with a matching sub-type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // KISS parameters (top-level packet types)
    SetTxDelay(u8),
    SetPersistence(u8),
    SetSlotTime(u8),
    SetTxTail(u8),
    SetDuplex(bool),

    GetTxDelay,
    GetPersistence,
    GetSlotTime,
    GetTxTail,
    GetDuplex,

    // Audio
    /// 8-bit on API 1.0, 16-bit on API 2.0.
    SetOutputVolume(u16),
    GetOutputVolume,
    SetOutputTwist(u8),
    GetOutputTwist,
    SetInputAtten(bool),
    GetInputAtten,
    /// API 2.0 signed input gain.
    SetInputGain(i16),
    SetInputTwist(i8),
    SetSquelchLevel(u8),
    AdjustInputLevels,
    PollVolume,
    StreamVolume,

    // Transmit
    Ptt(Tone),
    PttOff,
    SetPttChannel(u8),
    GetPttChannel,
    SetPassall(bool),
    SetRxReversePolarity(bool),
    SetTxReversePolarity(bool),
    SetModemType(u8),

    // Device
    GetBatteryLevel,
    GetFirmwareVersion,
    GetAllValues,
    SetVerbosity(bool),
    GetVerbosity,
    SetConnectionTracking(bool),
    SetUsbPowerOn(bool),
    SetUsbPowerOff(bool),
    SaveEepromSettings,
    SetDateTime(NaiveDateTime),
}

impl Command {
    /// Unescaped frame payload for this command.
    ///
    /// `api_version` selects between the 1.0 and 2.0 encodings of output
    /// volume.
    pub fn to_bytes(&self, api_version: u16) -> Vec<u8> {
        match self {
            Command::SetTxDelay(v) => vec![PACKET_TX_DELAY, *v],
            Command::SetPersistence(v) => vec![PACKET_PERSISTENCE, *v],
            Command::SetSlotTime(v) => vec![PACKET_SLOT_TIME, *v],
            Command::SetTxTail(v) => vec![PACKET_TX_TAIL, *v],
            Command::SetDuplex(v) => vec![PACKET_DUPLEX, *v as u8],

            Command::GetTxDelay => hw(CMD_GET_TX_DELAY),
            Command::GetPersistence => hw(CMD_GET_PERSISTENCE),
            Command::GetSlotTime => hw(CMD_GET_SLOT_TIME),
            Command::GetTxTail => hw(CMD_GET_TX_TAIL),
            Command::GetDuplex => hw(CMD_GET_DUPLEX),

            Command::SetOutputVolume(v) => {
                let mut out = hw(CMD_SET_OUTPUT_VOLUME);
                if api_version <= API_VERSION_1_0 {
                    out.push((*v).min(u8::MAX as u16) as u8);
                } else {
                    push_i16(&mut out, (*v).min(i16::MAX as u16) as i16);
                }
                out
            }
            Command::GetOutputVolume => hw(CMD_GET_OUTPUT_VOLUME),
            Command::SetOutputTwist(v) => hw_u8(CMD_SET_OUTPUT_TWIST, *v),
            Command::GetOutputTwist => hw(CMD_GET_OUTPUT_TWIST),
            Command::SetInputAtten(on) => hw_u8(CMD_SET_INPUT_ATTEN, if *on { 2 } else { 0 }),
            Command::GetInputAtten => hw(CMD_GET_INPUT_ATTEN),
            Command::SetInputGain(g) => {
                let mut out = hw(CMD_SET_INPUT_ATTEN);
                push_i16(&mut out, *g);
                out
            }
            Command::SetInputTwist(v) => hw_u8(CMD_SET_INPUT_TWIST, *v as u8),
            Command::SetSquelchLevel(v) => hw_u8(CMD_SET_SQUELCH_LEVEL, *v),
            Command::AdjustInputLevels => hw(CMD_ADJUST_INPUT_LEVELS),
            Command::PollVolume => hw(CMD_POLL_VOLUME),
            Command::StreamVolume => hw(CMD_STREAM_VOLUME),

            Command::Ptt(tone) => match tone {
                Tone::Mark => hw(CMD_PTT_MARK),
                Tone::Space => hw(CMD_PTT_SPACE),
                Tone::Both => hw(CMD_PTT_BOTH),
                Tone::None => hw(CMD_PTT_OFF),
            },
            Command::PttOff => hw(CMD_PTT_OFF),
            Command::SetPttChannel(v) => hw_u8(CMD_SET_PTT_CHANNEL, *v),
            Command::GetPttChannel => hw(CMD_GET_PTT_CHANNEL),
            Command::SetPassall(v) => hw_u8(CMD_SET_PASSALL, *v as u8),
            Command::SetRxReversePolarity(v) => hw_u8(CMD_SET_RX_REVERSE_POLARITY, *v as u8),
            Command::SetTxReversePolarity(v) => hw_u8(CMD_SET_TX_REVERSE_POLARITY, *v as u8),
            Command::SetModemType(v) => {
                vec![PACKET_HARDWARE, CMD_EXTENDED_1, CMD_EXT1_SET_MODEM_TYPE, *v]
            }

            Command::GetBatteryLevel => hw(CMD_GET_BATTERY_LEVEL),
            Command::GetFirmwareVersion => hw(CMD_GET_FIRMWARE_VERSION),
            Command::GetAllValues => hw(CMD_GET_ALL_VALUES),
            Command::SetVerbosity(v) => hw_u8(CMD_SET_VERBOSITY, *v as u8),
            Command::GetVerbosity => hw(CMD_GET_VERBOSITY),
            Command::SetConnectionTracking(v) => hw_u8(CMD_SET_BT_CONN_TRACK, *v as u8),
            Command::SetUsbPowerOn(v) => hw_u8(CMD_SET_USB_POWER_ON, *v as u8),
            Command::SetUsbPowerOff(v) => hw_u8(CMD_SET_USB_POWER_OFF, *v as u8),
            Command::SaveEepromSettings => hw(CMD_SAVE_EEPROM_SETTINGS),
            Command::SetDateTime(dt) => {
                let mut out = hw(CMD_SET_DATETIME);
                out.extend_from_slice(&[
                    to_bcd((dt.year() - 2000).clamp(0, 99) as u8),
                    to_bcd(dt.month() as u8),
                    to_bcd(dt.day() as u8),
                    to_bcd(dt.weekday().num_days_from_monday() as u8),
                    to_bcd(dt.hour() as u8),
                    to_bcd(dt.minute() as u8),
                    to_bcd(dt.second() as u8),
                ]);
                out
            }
        }
    }
}

fn hw(sub: u8) -> Vec<u8> {
    vec![PACKET_HARDWARE, sub]
}

fn hw_u8(sub: u8, value: u8) -> Vec<u8> {
    vec![PACKET_HARDWARE, sub, value]
}

fn push_i16(out: &mut Vec<u8>, value: i16) {
    // Writing into a Vec cannot fail.
    let _ = out.write_i16::<BigEndian>(value);
}

/// Packed BCD encoding of a value below 100.
pub fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Decode a packed BCD byte.
pub fn from_bcd(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}
