//! Protocol constants for the TNC host link.
//!
//! Covers the KISS framing bytes, the hardware (0x06) command/response
//! sub-protocol and the AVR109 bootloader command letters.

// ============================================================================
// KISS Framing
// ============================================================================

/// Frame boundary.
pub const FEND: u8 = 0xC0;
/// Frame escape.
pub const FESC: u8 = 0xDB;
/// Escaped FEND.
pub const TFEND: u8 = 0xDC;
/// Escaped FESC.
pub const TFESC: u8 = 0xDD;

// ============================================================================
// Packet Types (first byte of a frame payload)
// ============================================================================

pub const PACKET_TX_DELAY: u8 = 0x01;
pub const PACKET_PERSISTENCE: u8 = 0x02;
pub const PACKET_SLOT_TIME: u8 = 0x03;
pub const PACKET_TX_TAIL: u8 = 0x04;
pub const PACKET_DUPLEX: u8 = 0x05;

/// Hardware command/response packet. Followed by a sub-type byte.
pub const PACKET_HARDWARE: u8 = 0x06;

/// Log/notice packet. The remainder of the frame is message text.
pub const PACKET_LOG: u8 = 0x07;

// ============================================================================
// Hardware Commands (Host -> TNC, sub-type of PACKET_HARDWARE)
// ============================================================================

pub const CMD_SET_OUTPUT_VOLUME: u8 = 0x01;
pub const CMD_SET_INPUT_ATTEN: u8 = 0x02;
pub const CMD_SET_SQUELCH_LEVEL: u8 = 0x03;
pub const CMD_POLL_VOLUME: u8 = 0x04;
pub const CMD_STREAM_VOLUME: u8 = 0x05;
pub const CMD_GET_BATTERY_LEVEL: u8 = 0x06;
pub const CMD_PTT_MARK: u8 = 0x07;
pub const CMD_PTT_SPACE: u8 = 0x08;
pub const CMD_PTT_BOTH: u8 = 0x09;
pub const CMD_PTT_OFF: u8 = 0x0A;
pub const CMD_GET_OUTPUT_VOLUME: u8 = 0x0C;
pub const CMD_GET_INPUT_ATTEN: u8 = 0x0D;
pub const CMD_SET_VERBOSITY: u8 = 0x10;
pub const CMD_GET_VERBOSITY: u8 = 0x11;
pub const CMD_SET_INPUT_TWIST: u8 = 0x18;
pub const CMD_SET_OUTPUT_TWIST: u8 = 0x1A;
pub const CMD_GET_OUTPUT_TWIST: u8 = 0x1B;
pub const CMD_GET_TX_DELAY: u8 = 0x21;
pub const CMD_GET_PERSISTENCE: u8 = 0x22;
pub const CMD_GET_SLOT_TIME: u8 = 0x23;
pub const CMD_GET_TX_TAIL: u8 = 0x24;
pub const CMD_GET_DUPLEX: u8 = 0x25;
pub const CMD_GET_FIRMWARE_VERSION: u8 = 0x28;
pub const CMD_SAVE_EEPROM_SETTINGS: u8 = 0x2A;
pub const CMD_ADJUST_INPUT_LEVELS: u8 = 0x2B;
pub const CMD_SET_DATETIME: u8 = 0x32;
pub const CMD_SET_BT_CONN_TRACK: u8 = 0x45;
pub const CMD_SET_USB_POWER_ON: u8 = 0x49;
pub const CMD_SET_USB_POWER_OFF: u8 = 0x4B;
pub const CMD_SET_PTT_CHANNEL: u8 = 0x4F;
pub const CMD_GET_PTT_CHANNEL: u8 = 0x50;
pub const CMD_SET_PASSALL: u8 = 0x51;
pub const CMD_SET_RX_REVERSE_POLARITY: u8 = 0x53;
pub const CMD_SET_TX_REVERSE_POLARITY: u8 = 0x55;
pub const CMD_GET_ALL_VALUES: u8 = 0x7F;
pub const CMD_EXTENDED_1: u8 = 0xC1;
pub const CMD_EXT1_SET_MODEM_TYPE: u8 = 0x82;

// ============================================================================
// Hardware Responses (TNC -> Host, sub-type of PACKET_HARDWARE)
// ============================================================================

pub const RSP_INPUT_LEVEL: u8 = 4;
pub const RSP_BATTERY_LEVEL: u8 = 6;
pub const RSP_TX_VOLUME: u8 = 12;
/// Input attenuation on API 1.0, input gain on API 2.0.
pub const RSP_INPUT_GAIN: u8 = 13;
pub const RSP_SQUELCH_LEVEL: u8 = 14;
pub const RSP_VERBOSITY: u8 = 17;
pub const RSP_INPUT_TWIST: u8 = 25;
pub const RSP_TX_TWIST: u8 = 27;
pub const RSP_TX_DELAY: u8 = 33;
pub const RSP_PERSISTENCE: u8 = 34;
pub const RSP_SLOT_TIME: u8 = 35;
pub const RSP_TX_TAIL: u8 = 36;
pub const RSP_DUPLEX: u8 = 37;
pub const RSP_FIRMWARE_VERSION: u8 = 40;
pub const RSP_HARDWARE_VERSION: u8 = 41;
pub const RSP_SERIAL_NUMBER: u8 = 47;
pub const RSP_MAC_ADDRESS: u8 = 48;
pub const RSP_DATE_TIME: u8 = 49;
pub const RSP_BLUETOOTH_NAME: u8 = 66;
pub const RSP_CONNECTION_TRACKING: u8 = 70;
pub const RSP_USB_POWER_ON: u8 = 74;
pub const RSP_USB_POWER_OFF: u8 = 76;
pub const RSP_PTT_CHANNEL: u8 = 80;
pub const RSP_PASSALL: u8 = 82;
pub const RSP_RX_REVERSE_POLARITY: u8 = 84;
pub const RSP_TX_REVERSE_POLARITY: u8 = 86;
pub const RSP_MIN_INPUT_TWIST: u8 = 121;
pub const RSP_MAX_INPUT_TWIST: u8 = 122;
pub const RSP_API_VERSION: u8 = 123;
pub const RSP_MIN_INPUT_GAIN: u8 = 124;
pub const RSP_MAX_INPUT_GAIN: u8 = 125;
pub const RSP_CAPABILITIES: u8 = 126;
pub const RSP_EXTENDED_1: u8 = 0xC1;
pub const RSP_EXT1_SELECTED_MODEM_TYPE: u8 = 0x81;
pub const RSP_EXT1_SUPPORTED_MODEM_TYPES: u8 = 0x83;

// ============================================================================
// API Versions
// ============================================================================

pub const API_VERSION_1_0: u16 = 0x0100;
pub const API_VERSION_2_0: u16 = 0x0200;

// ============================================================================
// Capability Bits (big-endian u16 built from payload byte 1)
// ============================================================================

pub const CAP_EEPROM_SAVE: u16 = 0x0200;
pub const CAP_ADJUST_INPUT: u16 = 0x0400;
pub const CAP_DFU_FIRMWARE: u16 = 0x0800;

// ============================================================================
// AVR109 Bootloader Commands
// ============================================================================

pub const AVR_ESCAPE: u8 = 0x1B;
pub const AVR_SET_ADDRESS: u8 = b'A';
pub const AVR_WRITE_BLOCK: u8 = b'B';
pub const AVR_READ_BLOCK: u8 = b'g';
pub const AVR_CHIP_ERASE: u8 = b'e';
pub const AVR_ENTER_PROGRAM_MODE: u8 = b'P';
pub const AVR_LEAVE_PROGRAM_MODE: u8 = b'L';
pub const AVR_EXIT_BOOTLOADER: u8 = b'E';
pub const AVR_AUTO_INCREMENT: u8 = b'a';
pub const AVR_BLOCK_SIZE: u8 = b'b';
pub const AVR_BOOTLOADER_ID: u8 = b'S';
pub const AVR_SOFTWARE_VERSION: u8 = b'V';
pub const AVR_PROGRAMMER_TYPE: u8 = b'p';
pub const AVR_DEVICE_LIST: u8 = b't';
pub const AVR_DEVICE_SIGNATURE: u8 = b's';

/// Confirmation byte for commands without a data reply.
pub const AVR_CONFIRM: u8 = b'\r';
/// Positive answer to capability queries.
pub const AVR_YES: u8 = b'Y';

/// Identifier returned by the supported bootloader.
pub const XBOOT_ID: &[u8; 7] = b"XBoot++";

/// Block transfer unit expected from the bootloader.
pub const BLOCK_SIZE: u16 = 128;

/// ATmega328P signature.
pub const SIGNATURE_ATMEGA328P: [u8; 3] = [0x0F, 0x95, 0x1E];
/// ATmega328PB signature.
pub const SIGNATURE_ATMEGA328PB: [u8; 3] = [0x16, 0x95, 0x1E];

/// All chip signatures accepted for upload.
pub const SUPPORTED_SIGNATURES: &[[u8; 3]] = &[SIGNATURE_ATMEGA328P, SIGNATURE_ATMEGA328PB];
