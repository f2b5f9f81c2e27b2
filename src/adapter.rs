//! Adapter descriptor table
//!
//! Every supported product maps onto one of a few compile-time descriptors.
//! A descriptor carries everything the rest of the crate needs to know about
//! a hardware variant: controller clock, bit timing ranges, supported modes,
//! buffer sizes and the endpoint layout.

use crate::constants::*;
use crate::timing::{BitTimingConst, CtrlMode};

/// Protocol family of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Classic CAN, BTR0/BTR1 register timing, 8-byte records
    Cl1,
    /// CAN FD capable, generic timing blocks, 64-byte records
    Cl2,
}

impl Family {
    /// Full size of a record including its size byte
    pub fn record_size(self) -> usize {
        match self {
            Family::Cl1 => IXXAT_USB_CL1_MSG_SIZE,
            Family::Cl2 => IXXAT_USB_CL2_MSG_SIZE,
        }
    }

    /// Bytes between the record header and the data area
    pub fn payload_offset(self) -> usize {
        match self {
            Family::Cl1 => 1 + IXXAT_USB_MSG_HEADER_SIZE,
            Family::Cl2 => 1 + IXXAT_USB_MSG_HEADER_SIZE + IXXAT_USB_CL2_CLIENT_ID_SIZE,
        }
    }

    /// Data capacity of a record
    pub fn data_capacity(self) -> usize {
        match self {
            Family::Cl1 => IXXAT_USB_CL1_DATA_SIZE,
            Family::Cl2 => IXXAT_USB_CL2_DATA_SIZE,
        }
    }

    /// Command code of the controller init command
    pub fn init_command(self) -> u32 {
        match self {
            Family::Cl1 => IXXAT_USB_CAN_CMD_INIT_CL1,
            Family::Cl2 => IXXAT_USB_CAN_CMD_INIT_CL2,
        }
    }
}

/// Bulk endpoint pair serving one CAN channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Bulk IN endpoint (device to host)
    pub msg_in: u8,
    /// Bulk OUT endpoint (host to device)
    pub msg_out: u8,
}

/// Immutable description of a hardware variant
#[derive(Debug)]
pub struct Adapter {
    /// Descriptor name used in logs
    pub name: &'static str,
    /// Protocol family, selects init encoder and record layout
    pub family: Family,
    /// CAN controller clock in Hz
    pub clock_hz: u32,
    /// Nominal (arbitration) bit timing limits
    pub bittiming_const: BitTimingConst,
    /// Data phase bit timing limits, present on FD capable adapters
    pub data_bittiming_const: Option<BitTimingConst>,
    /// Controller modes the adapter accepts
    pub ctrlmode_supported: CtrlMode,
    /// Size of one bulk IN transfer
    pub rx_buffer_size: usize,
    /// Size of one bulk OUT transfer
    pub tx_buffer_size: usize,
    /// Bulk IN endpoints, indexed by channel plus `ep_offs`
    pub ep_msg_in: [u8; IXXAT_USB_MAX_CHANNEL + 1],
    /// Bulk OUT endpoints, indexed by channel plus `ep_offs`
    pub ep_msg_out: [u8; IXXAT_USB_MAX_CHANNEL + 1],
    /// Index of channel 0 in the endpoint tables
    pub ep_offs: usize,
}

impl Adapter {
    /// Endpoint pair of a channel
    pub fn endpoints(&self, channel: usize) -> Option<Endpoints> {
        if channel >= IXXAT_USB_MAX_CHANNEL {
            return None;
        }
        let idx = channel + self.ep_offs;
        Some(Endpoints {
            msg_in: *self.ep_msg_in.get(idx)?,
            msg_out: *self.ep_msg_out.get(idx)?,
        })
    }

    /// Check if the adapter can run CAN FD
    pub fn supports_fd(&self) -> bool {
        self.ctrlmode_supported.contains(CtrlMode::FD)
    }
}

const CL1_BITTIMING: BitTimingConst = BitTimingConst {
    name: "ixxat_usb_cl1",
    tseg1_min: 1,
    tseg1_max: 16,
    tseg2_min: 1,
    tseg2_max: 8,
    sjw_max: 4,
    brp_min: 1,
    brp_max: 64,
    brp_inc: 1,
};

const CL2_BITTIMING: BitTimingConst = BitTimingConst {
    name: "ixxat_usb_cl2",
    tseg1_min: 1,
    tseg1_max: 256,
    tseg2_min: 1,
    tseg2_max: 256,
    sjw_max: 128,
    brp_min: 1,
    brp_max: 512,
    brp_inc: 1,
};

const CL2_DATA_BITTIMING: BitTimingConst = BitTimingConst {
    name: "ixxat_usb_cl2",
    tseg1_min: 1,
    tseg1_max: 32,
    tseg2_min: 1,
    tseg2_max: 16,
    sjw_max: 8,
    brp_min: 1,
    brp_max: 32,
    brp_inc: 1,
};

/// USB-to-CAN V2 family (classic CAN)
pub static USB2CAN_CL1: Adapter = Adapter {
    name: "USB-to-CAN",
    family: Family::Cl1,
    clock_hz: 8_000_000,
    bittiming_const: CL1_BITTIMING,
    data_bittiming_const: None,
    ctrlmode_supported: CtrlMode::LISTEN_ONLY
        .union(CtrlMode::TRIPLE_SAMPLING)
        .union(CtrlMode::BERR_REPORTING),
    rx_buffer_size: 512,
    tx_buffer_size: 256,
    ep_msg_in: [0x81, 0x82, 0x83, 0x84, 0x85, 0x86],
    ep_msg_out: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
    ep_offs: 0,
};

/// USB-to-CAN FD family
pub static USB2CAN_CL2: Adapter = Adapter {
    name: "USB-to-CAN FD",
    family: Family::Cl2,
    clock_hz: 80_000_000,
    bittiming_const: CL2_BITTIMING,
    data_bittiming_const: Some(CL2_DATA_BITTIMING),
    ctrlmode_supported: CtrlMode::LISTEN_ONLY
        .union(CtrlMode::BERR_REPORTING)
        .union(CtrlMode::FD)
        .union(CtrlMode::FD_NON_ISO),
    rx_buffer_size: 512,
    tx_buffer_size: 512,
    ep_msg_in: [0x81, 0x82, 0x83, 0x84, 0x85, 0x86],
    ep_msg_out: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
    ep_offs: 1,
};

/// CAN-IDM101 (generic bus interface, classic CAN on CL2 records)
pub static CAN_IDM101: Adapter = Adapter {
    name: "CAN-IDM101",
    family: Family::Cl2,
    clock_hz: 80_000_000,
    bittiming_const: CL2_BITTIMING,
    data_bittiming_const: None,
    ctrlmode_supported: CtrlMode::LISTEN_ONLY.union(CtrlMode::BERR_REPORTING),
    rx_buffer_size: 512,
    tx_buffer_size: 512,
    ep_msg_in: [0x81, 0x82, 0x83, 0x84, 0x85, 0x86],
    ep_msg_out: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
    ep_offs: 0,
};

/// CAN-IDM200 (generic bus interface, CAN FD)
pub static CAN_IDM200: Adapter = Adapter {
    name: "CAN-IDM200",
    family: Family::Cl2,
    clock_hz: 80_000_000,
    bittiming_const: CL2_BITTIMING,
    data_bittiming_const: Some(CL2_DATA_BITTIMING),
    ctrlmode_supported: CtrlMode::LISTEN_ONLY
        .union(CtrlMode::BERR_REPORTING)
        .union(CtrlMode::FD)
        .union(CtrlMode::FD_NON_ISO),
    rx_buffer_size: 512,
    tx_buffer_size: 512,
    ep_msg_in: [0x81, 0x82, 0x83, 0x84, 0x85, 0x86],
    ep_msg_out: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
    ep_offs: 0,
};

/// Product table: (product id, descriptor)
pub static PRODUCTS: [(u16, &Adapter); 11] = [
    (USB2CAN_COMPACT_PRODUCT_ID, &USB2CAN_CL1),
    (USB2CAN_EMBEDDED_PRODUCT_ID, &USB2CAN_CL1),
    (USB2CAN_PROFESSIONAL_PRODUCT_ID, &USB2CAN_CL1),
    (USB2CAN_AUTOMOTIVE_PRODUCT_ID, &USB2CAN_CL1),
    (USB2CAN_FD_COMPACT_PRODUCT_ID, &USB2CAN_CL2),
    (USB2CAN_FD_PROFESSIONAL_PRODUCT_ID, &USB2CAN_CL2),
    (USB2CAN_FD_AUTOMOTIVE_PRODUCT_ID, &USB2CAN_CL2),
    (USB2CAN_FD_PCIE_MINI_PRODUCT_ID, &USB2CAN_CL2),
    (USB2CAR_PRODUCT_ID, &USB2CAN_CL2),
    (CAN_IDM101_PRODUCT_ID, &CAN_IDM101),
    (CAN_IDM200_PRODUCT_ID, &CAN_IDM200),
];

/// Find the descriptor of a USB device
pub fn lookup(vendor_id: u16, product_id: u16) -> Option<&'static Adapter> {
    if vendor_id != IXXAT_USB_VENDOR_ID {
        return None;
    }
    PRODUCTS
        .iter()
        .find(|(pid, _)| *pid == product_id)
        .map(|(_, adapter)| *adapter)
}
