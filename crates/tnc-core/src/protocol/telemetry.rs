//! Typed decoding of TNC replies.
//!
//! Every known hardware sub-type maps to one [`Telemetry`] variant. Unknown
//! sub-types decode to `None` so newer firmware does not break older hosts.

use std::fmt;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use super::constants::*;
use super::packet::{Packet, from_bcd};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("Sub-type {sub_type} truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        sub_type: u8,
        expected: usize,
        actual: usize,
    },
    #[error("Sub-type {sub_type} is not valid UTF-8")]
    InvalidText { sub_type: u8 },
}

/// Device capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u16);

impl Capabilities {
    pub fn eeprom_save(&self) -> bool {
        self.0 & CAP_EEPROM_SAVE != 0
    }

    pub fn adjust_input(&self) -> bool {
        self.0 & CAP_ADJUST_INPUT != 0
    }

    pub fn dfu_firmware(&self) -> bool {
        self.0 & CAP_DFU_FIRMWARE != 0
    }
}

/// Six-byte hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacAddress(pub Vec<u8>);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", parts.join(":"))
    }
}

/// A decoded reply from the TNC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Telemetry {
    /// Raw receive level; the display scale is log2 of this.
    InputLevel(u8),
    /// Millivolts.
    BatteryLevel(u16),
    TxVolume(u16),
    TxTwist(u8),
    /// API 1.0 only.
    InputAtten(bool),
    /// API 2.0 only.
    InputGain(i16),
    InputTwist(u8),
    SquelchLevel(u8),
    Verbosity(u8),
    TxDelay(u8),
    Persistence(u8),
    SlotTime(u8),
    TxTail(u8),
    Duplex(bool),
    FirmwareVersion(String),
    HardwareVersion(String),
    SerialNumber(String),
    MacAddress(MacAddress),
    /// `None` when the device clock holds an impossible date.
    DateTime(Option<DateTime<Utc>>),
    BluetoothName(String),
    ConnectionTracking(u8),
    UsbPowerOn(u8),
    UsbPowerOff(u8),
    PttChannel(u8),
    Passall(u8),
    RxReversePolarity(u8),
    TxReversePolarity(u8),
    MinInputTwist(i8),
    MaxInputTwist(i8),
    ApiVersion(u16),
    MinInputGain(i16),
    MaxInputGain(i16),
    Capabilities(Capabilities),
    SelectedModemType(u8),
    SupportedModemTypes(Vec<u8>),
}

impl Telemetry {
    /// Input level on the log2 scale used for metering.
    pub fn input_level_log2(raw: u8) -> f32 {
        (raw.max(1) as f32).log2()
    }

    /// Decode a hardware packet.
    ///
    /// Returns `Ok(None)` for packets that are not hardware replies and for
    /// unknown sub-types.
    pub fn decode(packet: &Packet, api_version: u16) -> Result<Option<Self>, PacketError> {
        if !packet.is_hardware() {
            return Ok(None);
        }
        let Some(sub) = packet.sub_type else {
            return Ok(None);
        };
        let d = packet.data.as_slice();

        let value = match sub {
            RSP_INPUT_LEVEL => Telemetry::InputLevel(byte(sub, d)?),
            RSP_BATTERY_LEVEL => Telemetry::BatteryLevel(be_u16(sub, d)?),
            RSP_TX_VOLUME => {
                if api_version <= API_VERSION_1_0 {
                    Telemetry::TxVolume(byte(sub, d)? as u16)
                } else {
                    Telemetry::TxVolume(be_u16(sub, d)?)
                }
            }
            RSP_TX_TWIST => Telemetry::TxTwist(byte(sub, d)?),
            RSP_INPUT_GAIN => {
                if api_version <= API_VERSION_1_0 {
                    Telemetry::InputAtten(byte(sub, d)? != 0)
                } else {
                    Telemetry::InputGain(be_i16(sub, d)?)
                }
            }
            RSP_INPUT_TWIST => Telemetry::InputTwist(byte(sub, d)?),
            RSP_SQUELCH_LEVEL => Telemetry::SquelchLevel(byte(sub, d)?),
            RSP_VERBOSITY => Telemetry::Verbosity(byte(sub, d)?),
            RSP_TX_DELAY => Telemetry::TxDelay(byte(sub, d)?),
            RSP_PERSISTENCE => Telemetry::Persistence(byte(sub, d)?),
            RSP_SLOT_TIME => Telemetry::SlotTime(byte(sub, d)?),
            RSP_TX_TAIL => Telemetry::TxTail(byte(sub, d)?),
            RSP_DUPLEX => Telemetry::Duplex(byte(sub, d)? != 0),
            RSP_FIRMWARE_VERSION => Telemetry::FirmwareVersion(text(sub, d)?),
            RSP_HARDWARE_VERSION => Telemetry::HardwareVersion(text(sub, d)?),
            RSP_SERIAL_NUMBER => Telemetry::SerialNumber(text(sub, d)?),
            RSP_MAC_ADDRESS => Telemetry::MacAddress(MacAddress(d.to_vec())),
            RSP_DATE_TIME => Telemetry::DateTime(bcd_datetime(sub, d)?),
            RSP_BLUETOOTH_NAME => Telemetry::BluetoothName(text(sub, d)?),
            RSP_CONNECTION_TRACKING => Telemetry::ConnectionTracking(byte(sub, d)?),
            RSP_USB_POWER_ON => Telemetry::UsbPowerOn(byte(sub, d)?),
            RSP_USB_POWER_OFF => Telemetry::UsbPowerOff(byte(sub, d)?),
            RSP_PTT_CHANNEL => Telemetry::PttChannel(byte(sub, d)?),
            RSP_PASSALL => Telemetry::Passall(byte(sub, d)?),
            RSP_RX_REVERSE_POLARITY => Telemetry::RxReversePolarity(byte(sub, d)?),
            RSP_TX_REVERSE_POLARITY => Telemetry::TxReversePolarity(byte(sub, d)?),
            RSP_MIN_INPUT_TWIST => Telemetry::MinInputTwist(byte(sub, d)? as i8),
            RSP_MAX_INPUT_TWIST => Telemetry::MaxInputTwist(byte(sub, d)? as i8),
            RSP_API_VERSION => Telemetry::ApiVersion(be_u16(sub, d)?),
            RSP_MIN_INPUT_GAIN => Telemetry::MinInputGain(be_i16(sub, d)?),
            RSP_MAX_INPUT_GAIN => Telemetry::MaxInputGain(be_i16(sub, d)?),
            RSP_CAPABILITIES => {
                ensure_len(sub, d, 2)?;
                Telemetry::Capabilities(Capabilities((d[1] as u16) << 8))
            }
            RSP_EXTENDED_1 => {
                let (&ext, rest) = d.split_first().ok_or(PacketError::Truncated {
                    sub_type: sub,
                    expected: 1,
                    actual: 0,
                })?;
                match ext {
                    RSP_EXT1_SELECTED_MODEM_TYPE => Telemetry::SelectedModemType(byte(sub, rest)?),
                    RSP_EXT1_SUPPORTED_MODEM_TYPES => Telemetry::SupportedModemTypes(rest.to_vec()),
                    _ => return Ok(None),
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(value))
    }
}

fn ensure_len(sub_type: u8, data: &[u8], expected: usize) -> Result<(), PacketError> {
    if data.len() < expected {
        return Err(PacketError::Truncated {
            sub_type,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn byte(sub_type: u8, data: &[u8]) -> Result<u8, PacketError> {
    ensure_len(sub_type, data, 1)?;
    Ok(data[0])
}

fn be_u16(sub_type: u8, data: &[u8]) -> Result<u16, PacketError> {
    ensure_len(sub_type, data, 2)?;
    Cursor::new(data)
        .read_u16::<BigEndian>()
        .map_err(|_| PacketError::Truncated {
            sub_type,
            expected: 2,
            actual: data.len(),
        })
}

fn be_i16(sub_type: u8, data: &[u8]) -> Result<i16, PacketError> {
    be_u16(sub_type, data).map(|v| v as i16)
}

fn text(sub_type: u8, data: &[u8]) -> Result<String, PacketError> {
    String::from_utf8(data.to_vec()).map_err(|_| PacketError::InvalidText { sub_type })
}

fn bcd_datetime(sub_type: u8, data: &[u8]) -> Result<Option<DateTime<Utc>>, PacketError> {
    ensure_len(sub_type, data, 7)?;
    let year = 2000 + from_bcd(data[0]) as i32;
    let month = from_bcd(data[1]) as u32;
    let day = from_bcd(data[2]) as u32;
    // data[3] is the weekday, implied by the date.
    let hour = from_bcd(data[4]) as u32;
    let minute = from_bcd(data[5]) as u32;
    let second = from_bcd(data[6]) as u32;

    Ok(NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .map(|naive| naive.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(sub: u8, data: &[u8], api: u16) -> Option<Telemetry> {
        Telemetry::decode(&Packet::hardware(sub, data.to_vec()), api).unwrap()
    }

    #[test]
    fn test_battery_level_big_endian() {
        assert_eq!(
            decode(RSP_BATTERY_LEVEL, &[0x0F, 0xA0], API_VERSION_1_0),
            Some(Telemetry::BatteryLevel(4000))
        );
    }

    #[test]
    fn test_api_dependent_fields() {
        assert_eq!(
            decode(RSP_TX_VOLUME, &[0x80], API_VERSION_1_0),
            Some(Telemetry::TxVolume(128))
        );
        assert_eq!(
            decode(RSP_TX_VOLUME, &[0x01, 0x00], API_VERSION_2_0),
            Some(Telemetry::TxVolume(256))
        );
        assert_eq!(
            decode(RSP_INPUT_GAIN, &[1], API_VERSION_1_0),
            Some(Telemetry::InputAtten(true))
        );
        assert_eq!(
            decode(RSP_INPUT_GAIN, &[0xFF, 0xF6], API_VERSION_2_0),
            Some(Telemetry::InputGain(-10))
        );
    }

    #[test]
    fn test_text_fields() {
        assert_eq!(
            decode(RSP_FIRMWARE_VERSION, b"0.7.4", API_VERSION_1_0),
            Some(Telemetry::FirmwareVersion("0.7.4".into()))
        );
        let err = Telemetry::decode(&Packet::hardware(RSP_HARDWARE_VERSION, vec![0xFF]), 0);
        assert_eq!(err, Err(PacketError::InvalidText { sub_type: RSP_HARDWARE_VERSION }));
    }

    #[test]
    fn test_mac_address_display() {
        let Some(Telemetry::MacAddress(mac)) =
            decode(RSP_MAC_ADDRESS, &[0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13], API_VERSION_2_0)
        else {
            panic!("expected MAC address");
        };
        assert_eq!(mac.to_string(), "00:1A:7D:DA:71:13");
    }

    #[test]
    fn test_bcd_datetime() {
        let Some(Telemetry::DateTime(Some(dt))) = decode(
            RSP_DATE_TIME,
            &[0x24, 0x03, 0x15, 0x04, 0x12, 0x34, 0x56],
            API_VERSION_2_0,
        ) else {
            panic!("expected date/time");
        };
        assert_eq!(dt.to_rfc3339(), "2024-03-15T12:34:56+00:00");

        // Month 13 is an RTC fault, not a decode error.
        assert_eq!(
            decode(RSP_DATE_TIME, &[0x24, 0x13, 0x01, 0, 0, 0, 0], API_VERSION_2_0),
            Some(Telemetry::DateTime(None))
        );
    }

    #[test]
    fn test_capabilities() {
        let Some(Telemetry::Capabilities(caps)) =
            decode(RSP_CAPABILITIES, &[0x00, 0x0A], API_VERSION_2_0)
        else {
            panic!("expected capabilities");
        };
        assert!(caps.eeprom_save());
        assert!(!caps.adjust_input());
        assert!(caps.dfu_firmware());

        assert!(matches!(
            Telemetry::decode(&Packet::hardware(RSP_CAPABILITIES, vec![0x00]), 0),
            Err(PacketError::Truncated { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_signed_ranges() {
        assert_eq!(
            decode(RSP_MIN_INPUT_TWIST, &[0xFA], API_VERSION_2_0),
            Some(Telemetry::MinInputTwist(-6))
        );
        assert_eq!(
            decode(RSP_MAX_INPUT_GAIN, &[0x00, 0x04], API_VERSION_2_0),
            Some(Telemetry::MaxInputGain(4))
        );
    }

    #[test]
    fn test_extended_range() {
        assert_eq!(
            decode(RSP_EXTENDED_1, &[0x81, 0x02], API_VERSION_2_0),
            Some(Telemetry::SelectedModemType(2))
        );
        assert_eq!(
            decode(RSP_EXTENDED_1, &[0x83, 1, 2, 5], API_VERSION_2_0),
            Some(Telemetry::SupportedModemTypes(vec![1, 2, 5]))
        );
        assert_eq!(decode(RSP_EXTENDED_1, &[0x99], API_VERSION_2_0), None);
    }

    #[test]
    fn test_unknown_and_non_hardware_ignored() {
        assert_eq!(decode(0xEE, &[1, 2, 3], API_VERSION_2_0), None);
        assert_eq!(Telemetry::decode(&Packet::log("hello"), 0), Ok(None));
    }

    #[test]
    fn test_truncated_payload() {
        assert!(matches!(
            Telemetry::decode(&Packet::hardware(RSP_BATTERY_LEVEL, vec![0x0F]), 0),
            Err(PacketError::Truncated { sub_type: RSP_BATTERY_LEVEL, .. })
        ));
    }

    #[test]
    fn test_input_level_log2() {
        assert_eq!(Telemetry::input_level_log2(0), 0.0);
        assert_eq!(Telemetry::input_level_log2(8), 3.0);
    }
}
