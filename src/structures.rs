//! Command envelope and board structures
//!
//! Every command is a request header plus payload, followed by the response
//! header the device fills in. This module packs and unpacks those headers
//! and the board-level response payloads.

use crate::constants::*;
use crate::error::{IxxatError, Result};

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Command request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Request size: header plus payload
    pub size: u32,
    /// Target port (channel), `0xFFFF` for the board
    pub port: u16,
    /// Target socket
    pub socket: u16,
    /// Command code
    pub code: u32,
}

impl RequestHeader {
    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; IXXAT_USB_REQ_HEADER_SIZE] {
        let mut buf = [0u8; IXXAT_USB_REQ_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..6].copy_from_slice(&self.port.to_le_bytes());
        buf[6..8].copy_from_slice(&self.socket.to_le_bytes());
        buf[8..12].copy_from_slice(&self.code.to_le_bytes());
        buf
    }

    /// Unpack from bytes
    pub fn unpack(data: &[u8]) -> Self {
        Self {
            size: read_u32(data, 0),
            port: read_u16(data, 4),
            socket: read_u16(data, 6),
            code: read_u32(data, 8),
        }
    }
}

/// Command response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Response size: header plus payload
    pub size: u32,
    /// Bytes the device actually returned
    pub returned_size: u32,
    /// Result code, zero on success
    pub code: u32,
}

impl ResponseHeader {
    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; IXXAT_USB_RES_HEADER_SIZE] {
        let mut buf = [0u8; IXXAT_USB_RES_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.returned_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.code.to_le_bytes());
        buf
    }

    /// Unpack from bytes
    pub fn unpack(data: &[u8]) -> Self {
        Self {
            size: read_u32(data, 0),
            returned_size: read_u32(data, 4),
            code: read_u32(data, 8),
        }
    }
}

/// Request/response header pair of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub request: RequestHeader,
    pub response: ResponseHeader,
}

impl Envelope {
    /// Generic setup: unaddressed request, unfilled response
    pub fn setup() -> Self {
        Self {
            request: RequestHeader {
                size: IXXAT_USB_REQ_HEADER_SIZE as u32,
                port: IXXAT_USB_UNSET_PORT,
                socket: IXXAT_USB_UNSET_PORT,
                code: 0,
            },
            response: ResponseHeader {
                size: IXXAT_USB_RES_HEADER_SIZE as u32,
                returned_size: 0,
                code: IXXAT_USB_UNSET_RESULT,
            },
        }
    }

    /// Envelope for `code` on `port`
    pub fn new(code: u32, port: u16, request_payload: usize, response_payload: usize) -> Self {
        let mut env = Self::setup();
        env.request.size = (IXXAT_USB_REQ_HEADER_SIZE + request_payload) as u32;
        env.request.port = port;
        env.request.socket = 0;
        env.request.code = code;
        env.response.size = (IXXAT_USB_RES_HEADER_SIZE + response_payload) as u32;
        env
    }

    /// Bytes expected back from the device
    pub fn response_size(&self) -> usize {
        self.response.size as usize
    }

    /// Pack request header, payload and response header
    pub fn pack(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(IXXAT_USB_REQ_HEADER_SIZE + payload.len() + IXXAT_USB_RES_HEADER_SIZE);
        buf.extend_from_slice(&self.request.pack());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&self.response.pack());
        buf
    }
}

/// Board capabilities from GET_DEVCAPS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Bus controller types, one per controller
    pub bus_ctrl_types: Vec<u16>,
}

impl DeviceCaps {
    /// Response payload size: count (2) + 32 types (2 each)
    pub const SIZE: usize = 2 + 2 * IXXAT_USB_MAX_TYPES;

    /// Unpack from the response payload
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(IxxatError::MalformedResponse {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let count = (read_u16(data, 0) as usize).min(IXXAT_USB_MAX_TYPES);
        let bus_ctrl_types = (0..count).map(|i| read_u16(data, 2 + 2 * i)).collect();
        Ok(Self { bus_ctrl_types })
    }

    /// Indices of the controllers that are CAN controllers
    pub fn can_controllers(&self) -> impl Iterator<Item = usize> + '_ {
        self.bus_ctrl_types
            .iter()
            .enumerate()
            .filter(|(_, &t)| bus_type(t) == IXXAT_USB_BUS_CAN)
            .map(|(i, _)| i)
    }
}

/// Board identification from GET_DEVINFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Product name
    pub name: String,
    /// Serial / device id
    pub id: String,
    /// Hardware version
    pub version: u16,
    /// FPGA version
    pub fpga_version: u32,
}

impl DeviceInfo {
    /// Response payload size: name (16) + id (16) + version (2) + fpga version (4)
    pub const SIZE: usize = 38;

    /// Unpack from the response payload
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(IxxatError::MalformedResponse {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            name: c_string(&data[0..16]),
            id: c_string(&data[16..32]),
            version: read_u16(data, 32),
            fpga_version: read_u32(data, 34),
        })
    }

    /// Major and minor hardware version
    pub fn hardware_version(&self) -> (u8, u8) {
        ((self.version >> 8) as u8, self.version as u8)
    }
}

fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim().to_string()
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor) = self.hardware_version();
        write!(
            f,
            "Name: {}\nID: {}\nHW Version: {}.{}\nFPGA Version: 0x{:08x}",
            self.name, self.id, major, minor, self.fpga_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_setup() {
        let env = Envelope::setup();
        assert_eq!(env.request.port, 0xFFFF);
        assert_eq!(env.request.socket, 0xFFFF);
        assert_eq!(env.request.code, 0);
        assert_eq!(env.response.returned_size, 0);
        assert_eq!(env.response.code, 0xFFFF_FFFF);
    }

    #[test]
    fn test_envelope_pack() {
        let env = Envelope::new(IXXAT_USB_CAN_CMD_STOP, 1, 4, 0);
        let packed = env.pack(&IXXAT_USB_STOP_ACTION_CLEARALL.to_le_bytes());
        assert_eq!(packed.len(), 12 + 4 + 12);
        assert_eq!(packed[0..4], [16, 0, 0, 0]);
        assert_eq!(packed[4..6], [1, 0]);
        assert_eq!(packed[6..8], [0, 0]);
        assert_eq!(packed[8..12], [0x27, 0x03, 0, 0]);
        assert_eq!(packed[12..16], [3, 0, 0, 0]);

        let res = ResponseHeader::unpack(&packed[16..]);
        assert_eq!(res.size, 12);
        assert_eq!(res.returned_size, 0);
        assert_eq!(res.code, IXXAT_USB_UNSET_RESULT);

        assert_eq!(RequestHeader::unpack(&packed), env.request);
    }

    #[test]
    fn test_device_caps_unpack() {
        let mut data = vec![0u8; DeviceCaps::SIZE];
        data[0] = 3;
        data[2..4].copy_from_slice(&0x0101u16.to_le_bytes());
        data[4..6].copy_from_slice(&0x0201u16.to_le_bytes());
        data[6..8].copy_from_slice(&0x0102u16.to_le_bytes());
        let caps = DeviceCaps::unpack(&data).unwrap();
        assert_eq!(caps.bus_ctrl_types.len(), 3);
        assert_eq!(caps.can_controllers().collect::<Vec<_>>(), vec![0, 2]);

        assert!(DeviceCaps::unpack(&data[..10]).is_err());
    }

    #[test]
    fn test_device_info_unpack() {
        let mut data = vec![0u8; DeviceInfo::SIZE];
        data[..11].copy_from_slice(b"USB-to-CAN ");
        data[16..22].copy_from_slice(b"HW1234");
        data[32..34].copy_from_slice(&0x0201u16.to_le_bytes());
        data[34..38].copy_from_slice(&0x0000_0042u32.to_le_bytes());
        let info = DeviceInfo::unpack(&data).unwrap();
        assert_eq!(info.name, "USB-to-CAN");
        assert_eq!(info.id, "HW1234");
        assert_eq!(info.hardware_version(), (2, 1));
        assert_eq!(info.fpga_version, 0x42);
    }
}
