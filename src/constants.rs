//! IXXAT USB-to-CAN protocol constants
//!
//! This module contains the constants used by the adapter protocol: USB
//! identifiers, control transfer parameters, command codes, controller mode
//! bits and the flag layout of CAN message records.

use std::time::Duration;

// ============================================================================
// USB Vendor/Product IDs
// ============================================================================

/// IXXAT vendor ID
pub const IXXAT_USB_VENDOR_ID: u16 = 0x08D8;

/// USB-to-CAN compact
pub const USB2CAN_COMPACT_PRODUCT_ID: u16 = 0x0008;
/// USB-to-CAN embedded
pub const USB2CAN_EMBEDDED_PRODUCT_ID: u16 = 0x0009;
/// USB-to-CAN professional
pub const USB2CAN_PROFESSIONAL_PRODUCT_ID: u16 = 0x000A;
/// USB-to-CAN automotive
pub const USB2CAN_AUTOMOTIVE_PRODUCT_ID: u16 = 0x000B;
/// USB-to-CAN FD compact
pub const USB2CAN_FD_COMPACT_PRODUCT_ID: u16 = 0x0014;
/// USB-to-CAN FD professional
pub const USB2CAN_FD_PROFESSIONAL_PRODUCT_ID: u16 = 0x0016;
/// USB-to-CAN FD automotive
pub const USB2CAN_FD_AUTOMOTIVE_PRODUCT_ID: u16 = 0x0017;
/// USB-to-CAN FD PCIe mini
pub const USB2CAN_FD_PCIE_MINI_PRODUCT_ID: u16 = 0x001B;
/// USB-to-CAR
pub const USB2CAR_PRODUCT_ID: u16 = 0x001C;
/// CAN-IDM101 (classic CAN on the generic bus interface)
pub const CAN_IDM101_PRODUCT_ID: u16 = 0xFF12;
/// CAN-IDM200 (CAN FD on the generic bus interface)
pub const CAN_IDM200_PRODUCT_ID: u16 = 0xFF13;

// ============================================================================
// Control Transfer Parameters
// ============================================================================

/// Vendor request number used for every command
pub const IXXAT_USB_VENDOR_REQUEST: u8 = 0xFF;
/// bmRequestType: vendor, device recipient, host-to-device
pub const IXXAT_USB_REQUEST_TYPE_OUT: u8 = 0x40;
/// bmRequestType: vendor, device recipient, device-to-host
pub const IXXAT_USB_REQUEST_TYPE_IN: u8 = 0xC0;

/// `value` used for commands addressed to the whole board
pub const IXXAT_USB_BOARD_PORT: u16 = 0xFFFF;

/// Maximum number of attempts for a single send or receive
pub const IXXAT_USB_MAX_COM_REQ: u32 = 10;
/// Per-attempt control transfer timeout
pub const IXXAT_USB_MSG_TIMEOUT: Duration = Duration::from_millis(50);
/// Delay between two attempts
pub const IXXAT_USB_MSG_CYCLE: Duration = Duration::from_millis(20);
/// Time the board needs after a power wake-up request
pub const IXXAT_USB_POWER_WAKEUP_TIME: Duration = Duration::from_millis(500);

// ============================================================================
// Command Envelope
// ============================================================================

/// Request header: size (4) + port (2) + socket (2) + code (4)
pub const IXXAT_USB_REQ_HEADER_SIZE: usize = 12;
/// Response header: size (4) + returned size (4) + result code (4)
pub const IXXAT_USB_RES_HEADER_SIZE: usize = 12;

/// Port/socket value of a request that has not been addressed yet
pub const IXXAT_USB_UNSET_PORT: u16 = 0xFFFF;
/// Result code of a response that has not been filled in by the device
pub const IXXAT_USB_UNSET_RESULT: u32 = 0xFFFF_FFFF;

// ============================================================================
// Command Codes
// ============================================================================

/// Initialize a CL1 controller (BTR register pair)
pub const IXXAT_USB_CAN_CMD_INIT_CL1: u32 = 0x325;
/// Start a controller, returns the device start timestamp
pub const IXXAT_USB_CAN_CMD_START: u32 = 0x326;
/// Stop a controller
pub const IXXAT_USB_CAN_CMD_STOP: u32 = 0x327;
/// Reset a controller
pub const IXXAT_USB_CAN_CMD_RESET: u32 = 0x328;
/// Initialize a CL2 controller (nominal and data timing blocks)
pub const IXXAT_USB_CAN_CMD_INIT_CL2: u32 = 0x337;

/// Query board capabilities (bus controller count and types)
pub const IXXAT_USB_BRD_CMD_GET_DEVCAPS: u32 = 0x401;
/// Query board identification
pub const IXXAT_USB_BRD_CMD_GET_DEVINFO: u32 = 0x402;
/// Board power management
pub const IXXAT_USB_BRD_CMD_POWER: u32 = 0x421;

/// Power mode: wake up the board
pub const IXXAT_USB_POWER_WAKEUP: u8 = 0;

/// Stop action: abort pending transmissions and clear all filters
pub const IXXAT_USB_STOP_ACTION_CLEARALL: u32 = 3;

// ============================================================================
// Board Capabilities
// ============================================================================

/// Maximum number of bus controllers reported in GET_DEVCAPS
pub const IXXAT_USB_MAX_TYPES: usize = 32;
/// Maximum number of CAN channels a board exposes
pub const IXXAT_USB_MAX_CHANNEL: usize = 5;
/// Bus type of a CAN controller
pub const IXXAT_USB_BUS_CAN: u8 = 1;

/// Extract the bus type from a bus controller type word
pub fn bus_type(ctrl_type: u16) -> u8 {
    ((ctrl_type >> 8) & 0x00FF) as u8
}

// ============================================================================
// Controller Operating Modes
// ============================================================================

/// Receive standard (11-bit) frames
pub const IXXAT_USB_OPMODE_STANDARD: u8 = 1 << 0;
/// Receive extended (29-bit) frames
pub const IXXAT_USB_OPMODE_EXTENDED: u8 = 1 << 1;
/// Report bus error frames
pub const IXXAT_USB_OPMODE_ERRFRAME: u8 = 1 << 2;
/// Listen-only mode
pub const IXXAT_USB_OPMODE_LISTONLY: u8 = 1 << 3;

/// Extended data length (FD frames)
pub const IXXAT_USB_EXMODE_EXTDATA: u8 = 1 << 0;
/// Fast data bit rate (bit rate switching)
pub const IXXAT_USB_EXMODE_FASTDATA: u8 = 1 << 1;
/// ISO CAN FD framing
pub const IXXAT_USB_EXMODE_ISOFD: u8 = 1 << 2;

/// Timing block holds native controller values
pub const IXXAT_USB_BTMODE_NAT: u32 = 1 << 0;
/// Triple sampling
pub const IXXAT_USB_BTMODE_TSM: u32 = 1 << 1;

/// CL1 BTR1 triple sampling bit
pub const IXXAT_USB_BTR1_SAM: u8 = 0x80;

/// Synchronization segment length in time quanta
pub const CAN_SYNC_SEG: u32 = 1;

// ============================================================================
// CAN Message Record Types (flags low byte)
// ============================================================================

/// CAN data frame
pub const IXXAT_USB_CAN_DATA: u8 = 0x00;
/// Informational message
pub const IXXAT_USB_CAN_INFO: u8 = 0x01;
/// Bus error
pub const IXXAT_USB_CAN_ERROR: u8 = 0x02;
/// Controller status change
pub const IXXAT_USB_CAN_STATUS: u8 = 0x03;
/// Wake-up
pub const IXXAT_USB_CAN_WAKEUP: u8 = 0x04;
/// Device timer overflow
pub const IXXAT_USB_CAN_TIMEOVR: u8 = 0x05;
/// Device timer reset
pub const IXXAT_USB_CAN_TIMERST: u8 = 0x06;

// ============================================================================
// CAN Message Record Flags
// ============================================================================

/// Record type mask
pub const IXXAT_USB_MSG_FLAGS_TYPE: u32 = 0x0000_00FF;
/// Extended data length (CAN FD frame)
pub const IXXAT_USB_FDMSG_FLAGS_EDL: u32 = 0x0000_0400;
/// Fast data rate (bit rate switch)
pub const IXXAT_USB_FDMSG_FLAGS_FDR: u32 = 0x0000_0800;
/// Error state indicator
pub const IXXAT_USB_FDMSG_FLAGS_ESI: u32 = 0x0000_1000;
/// Data length code mask
pub const IXXAT_USB_MSG_FLAGS_DLC: u32 = 0x000F_0000;
/// Receive overrun happened before this record
pub const IXXAT_USB_MSG_FLAGS_OVR: u32 = 0x0010_0000;
/// Remote transmission request
pub const IXXAT_USB_MSG_FLAGS_RTR: u32 = 0x0040_0000;
/// Extended (29-bit) identifier
pub const IXXAT_USB_MSG_FLAGS_EXT: u32 = 0x0080_0000;

/// Bit position of the data length code
pub const IXXAT_USB_MSG_DLC_SHIFT: u32 = 16;

/// Decode the data length code from record flags
pub fn decode_dlc(flags: u32) -> u8 {
    ((flags & IXXAT_USB_MSG_FLAGS_DLC) >> IXXAT_USB_MSG_DLC_SHIFT) as u8
}

/// Encode a data length code into record flags
pub fn encode_dlc(dlc: u8) -> u32 {
    ((dlc as u32) << IXXAT_USB_MSG_DLC_SHIFT) & IXXAT_USB_MSG_FLAGS_DLC
}

// ============================================================================
// CAN Message Record Layout
// ============================================================================

/// Common record header after the size byte: time (4) + id (4) + flags (4)
pub const IXXAT_USB_MSG_HEADER_SIZE: usize = 12;
/// Payload capacity of a CL1 record
pub const IXXAT_USB_CL1_DATA_SIZE: usize = 8;
/// Client id field of a CL2 record
pub const IXXAT_USB_CL2_CLIENT_ID_SIZE: usize = 4;
/// Payload capacity of a CL2 record
pub const IXXAT_USB_CL2_DATA_SIZE: usize = 64;
/// Full CL1 record including the size byte
pub const IXXAT_USB_CL1_MSG_SIZE: usize = 1 + IXXAT_USB_MSG_HEADER_SIZE + IXXAT_USB_CL1_DATA_SIZE;
/// Full CL2 record including the size byte
pub const IXXAT_USB_CL2_MSG_SIZE: usize =
    1 + IXXAT_USB_MSG_HEADER_SIZE + IXXAT_USB_CL2_CLIENT_ID_SIZE + IXXAT_USB_CL2_DATA_SIZE;

// ============================================================================
// Controller Status Word (STATUS records)
// ============================================================================

/// No error condition
pub const IXXAT_USB_CAN_STATUS_OK: u32 = 0x0000_0000;
/// Receive overrun
pub const IXXAT_USB_CAN_STATUS_OVERRUN: u32 = 0x0000_0002;
/// Error warning limit reached
pub const IXXAT_USB_CAN_STATUS_ERRLIM: u32 = 0x0000_0004;
/// Bus off
pub const IXXAT_USB_CAN_STATUS_BUSOFF: u32 = 0x0000_0008;
/// Error passive
pub const IXXAT_USB_CAN_STATUS_ERR_PAS: u32 = 0x0000_2000;

// ============================================================================
// Bus Error Codes (ERROR records)
// ============================================================================

/// Bit stuffing error
pub const IXXAT_USB_CAN_ERROR_STUFF: u8 = 1;
/// Form error
pub const IXXAT_USB_CAN_ERROR_FORM: u8 = 2;
/// Acknowledgement error
pub const IXXAT_USB_CAN_ERROR_ACK: u8 = 3;
/// Bit error
pub const IXXAT_USB_CAN_ERROR_BIT: u8 = 4;
/// CRC error
pub const IXXAT_USB_CAN_ERROR_CRC: u8 = 6;

// ============================================================================
// CAN Identifiers and Payload
// ============================================================================

/// Standard frame format mask (11-bit ID)
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Extended frame format mask (29-bit ID)
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Maximum data length for classic CAN
pub const CAN_MAX_DLEN: usize = 8;
/// Maximum data length for CAN FD
pub const CANFD_MAX_DLEN: usize = 64;

/// DLC to data length conversion table for CAN FD
pub const CANFD_DLC_TO_LEN: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

// ============================================================================
// Transmit Contexts
// ============================================================================

/// Number of transmit contexts (in-flight bulk OUT transfers) per channel
pub const IXXAT_USB_MAX_TX_URBS: usize = 10;
/// Number of receive transfers kept posted per channel
pub const IXXAT_USB_MAX_RX_URBS: usize = 4;
