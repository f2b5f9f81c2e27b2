//! CAN frame representation and record encoding
//!
//! [`CanFrame`] holds one classic CAN or CAN FD frame. [`encode_record`]
//! turns it into the adapter's message record for a bulk OUT transfer.

use crate::adapter::Family;
use crate::constants::*;
use crate::error::{IxxatError, Result};

/// Convert DLC to data length
pub fn dlc_to_len(dlc: u8, fd: bool) -> usize {
    if fd {
        if (dlc as usize) < CANFD_DLC_TO_LEN.len() {
            CANFD_DLC_TO_LEN[dlc as usize]
        } else {
            CANFD_MAX_DLEN
        }
    } else {
        (dlc as usize).min(CAN_MAX_DLEN)
    }
}

/// Convert data length to DLC
pub fn len_to_dlc(length: usize, fd: bool) -> u8 {
    if fd {
        for (dlc, &dlen) in CANFD_DLC_TO_LEN.iter().enumerate() {
            if dlen >= length {
                return dlc as u8;
            }
        }
        15 // Max DLC for CAN FD
    } else {
        length.min(CAN_MAX_DLEN) as u8
    }
}

/// Frame format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Classic CAN, up to 8 bytes
    Classic,
    /// CAN FD, up to 64 bytes
    Fd {
        /// Data phase sent at the data bitrate
        brs: bool,
        /// Transmitter was error passive
        esi: bool,
    },
}

/// A classic CAN or CAN FD frame
#[derive(Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    remote: bool,
    format: FrameFormat,
    len: usize,
    data: [u8; CANFD_MAX_DLEN],
}

impl CanFrame {
    /// Create a classic data frame
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        if data.len() > CAN_MAX_DLEN {
            return Err(IxxatError::InvalidFrame("classic frame longer than 8 bytes"));
        }
        let mut frame = Self::empty(id, extended, FrameFormat::Classic)?;
        frame.data[..data.len()].copy_from_slice(data);
        frame.len = data.len();
        Ok(frame)
    }

    /// Create a classic remote frame requesting `len` bytes
    pub fn new_remote(id: u32, extended: bool, len: usize) -> Result<Self> {
        if len > CAN_MAX_DLEN {
            return Err(IxxatError::InvalidFrame("remote frame longer than 8 bytes"));
        }
        let mut frame = Self::empty(id, extended, FrameFormat::Classic)?;
        frame.remote = true;
        frame.len = len;
        Ok(frame)
    }

    /// Create a CAN FD frame
    ///
    /// The length is rounded up to the next valid FD length and padded with
    /// zeros.
    pub fn new_fd(id: u32, extended: bool, data: &[u8], brs: bool, esi: bool) -> Result<Self> {
        if data.len() > CANFD_MAX_DLEN {
            return Err(IxxatError::InvalidFrame("FD frame longer than 64 bytes"));
        }
        let mut frame = Self::empty(id, extended, FrameFormat::Fd { brs, esi })?;
        frame.data[..data.len()].copy_from_slice(data);
        frame.len = dlc_to_len(len_to_dlc(data.len(), true), true);
        Ok(frame)
    }

    fn empty(id: u32, extended: bool, format: FrameFormat) -> Result<Self> {
        let mask = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if id & !mask != 0 {
            return Err(IxxatError::InvalidFrame("identifier out of range"));
        }
        Ok(Self {
            id,
            extended,
            remote: false,
            format,
            len: 0,
            data: [0u8; CANFD_MAX_DLEN],
        })
    }

    /// Get the arbitration ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Check if this is an extended ID frame (29-bit)
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Check if this is a remote transmission request
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Frame format
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Check if this is a CAN FD frame
    pub fn is_fd(&self) -> bool {
        matches!(self.format, FrameFormat::Fd { .. })
    }

    /// Check if bit rate switch is enabled
    pub fn is_brs(&self) -> bool {
        matches!(self.format, FrameFormat::Fd { brs: true, .. })
    }

    /// Check if the error state indicator is set
    pub fn is_esi(&self) -> bool {
        matches!(self.format, FrameFormat::Fd { esi: true, .. })
    }

    /// Data length (requested length for remote frames)
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the frame carries no data
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Data length code
    pub fn dlc(&self) -> u8 {
        len_to_dlc(self.len, self.is_fd())
    }

    /// Get frame data as a slice
    pub fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.len]
        }
    }

    /// Build a frame from decoded record fields
    pub(crate) fn from_record(id: u32, flags: u32, payload: &[u8]) -> Result<Self> {
        let extended = flags & IXXAT_USB_MSG_FLAGS_EXT != 0;
        let id = if extended {
            id & CAN_EFF_MASK
        } else {
            id & CAN_SFF_MASK
        };
        let dlc = decode_dlc(flags);

        if flags & IXXAT_USB_FDMSG_FLAGS_EDL != 0 {
            let len = dlc_to_len(dlc, true);
            let data = payload
                .get(..len)
                .ok_or(IxxatError::InvalidFrame("record shorter than its DLC"))?;
            let brs = flags & IXXAT_USB_FDMSG_FLAGS_FDR != 0;
            let esi = flags & IXXAT_USB_FDMSG_FLAGS_ESI != 0;
            return Self::new_fd(id, extended, data, brs, esi);
        }

        let len = dlc_to_len(dlc, false);
        if flags & IXXAT_USB_MSG_FLAGS_RTR != 0 {
            return Self::new_remote(id, extended, len);
        }
        let data = payload
            .get(..len)
            .ok_or(IxxatError::InvalidFrame("record shorter than its DLC"))?;
        Self::new(id, extended, data)
    }
}

/// Size of the encoded record, excluding the size byte itself
///
/// The record is the full variant layout minus the unused part of the data
/// area; the device parses strictly by this value.
pub fn record_size(family: Family, data_len: usize) -> usize {
    family.record_size() - 1 - family.data_capacity() + data_len
}

/// Encode a frame into a message record for a bulk OUT transfer
pub fn encode_record(frame: &CanFrame, family: Family) -> Result<Vec<u8>> {
    if frame.is_fd() && family == Family::Cl1 {
        return Err(IxxatError::FdNotSupported);
    }

    let payload = frame.data();
    let size = record_size(family, payload.len());

    let mut flags = IXXAT_USB_CAN_DATA as u32 | encode_dlc(frame.dlc());
    if frame.is_remote() {
        flags |= IXXAT_USB_MSG_FLAGS_RTR;
    }
    if frame.is_extended() {
        flags |= IXXAT_USB_MSG_FLAGS_EXT;
    }
    if let FrameFormat::Fd { brs, esi } = frame.format() {
        flags |= IXXAT_USB_FDMSG_FLAGS_EDL;
        if brs {
            flags |= IXXAT_USB_FDMSG_FLAGS_FDR;
        }
        if esi {
            flags |= IXXAT_USB_FDMSG_FLAGS_ESI;
        }
    }

    let mut buf = Vec::with_capacity(size + 1);
    buf.push(size as u8);
    // time is assigned by the device
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&frame.id().to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    if family == Family::Cl2 {
        // client id, reserved
        buf.extend_from_slice(&0u32.to_le_bytes());
    }
    buf.extend_from_slice(payload);

    Ok(buf)
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fd_indicator = if self.is_fd() { " FD" } else { "" };
        let brs_indicator = if self.is_brs() { " BRS" } else { "" };

        let data_str = if self.is_remote() {
            "remote request".to_string()
        } else {
            self.data()
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        };

        write!(
            f,
            "{:>8X}{}{}   [{}]  {}",
            self.id, fd_indicator, brs_indicator, self.len, data_str
        )
    }
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:08X}", self.id))
            .field("extended", &self.extended)
            .field("remote", &self.remote)
            .field("format", &self.format)
            .field("data", &self.data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlc_to_len_classic() {
        assert_eq!(dlc_to_len(0, false), 0);
        assert_eq!(dlc_to_len(8, false), 8);
        assert_eq!(dlc_to_len(15, false), 8); // Clamped to 8
    }

    #[test]
    fn test_dlc_to_len_fd() {
        assert_eq!(dlc_to_len(0, true), 0);
        assert_eq!(dlc_to_len(8, true), 8);
        assert_eq!(dlc_to_len(9, true), 12);
        assert_eq!(dlc_to_len(15, true), 64);
    }

    #[test]
    fn test_len_to_dlc_fd() {
        assert_eq!(len_to_dlc(0, true), 0);
        assert_eq!(len_to_dlc(8, true), 8);
        assert_eq!(len_to_dlc(10, true), 9);
        assert_eq!(len_to_dlc(64, true), 15);
    }

    #[test]
    fn test_frame_validation() {
        assert!(CanFrame::new(0x800, false, &[]).is_err());
        assert!(CanFrame::new(0x800, true, &[]).is_ok());
        assert!(CanFrame::new(0x123, false, &[0; 9]).is_err());
        assert!(CanFrame::new_fd(0x123, false, &[0; 65], false, false).is_err());
    }

    #[test]
    fn test_fd_length_padding() {
        let frame = CanFrame::new_fd(0x123, false, &[0xAA; 10], true, false).unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(frame.dlc(), 9);
        assert_eq!(&frame.data()[10..], &[0, 0]);
    }

    #[test]
    fn test_encode_cl1_layout() {
        let data = [0x12, 0x34, 0x56];
        let frame = CanFrame::new(0x1ABCDE, true, &data).unwrap();
        let rec = encode_record(&frame, Family::Cl1).unwrap();

        // 21 - 1 - 8 + 3
        assert_eq!(rec[0], 15);
        assert_eq!(rec.len(), 16);
        assert_eq!(rec[5..9], 0x1ABCDEu32.to_le_bytes());
        let flags = u32::from_le_bytes([rec[9], rec[10], rec[11], rec[12]]);
        assert_eq!(flags & IXXAT_USB_MSG_FLAGS_TYPE, IXXAT_USB_CAN_DATA as u32);
        assert_ne!(flags & IXXAT_USB_MSG_FLAGS_EXT, 0);
        assert_eq!(decode_dlc(flags), 3);
        assert_eq!(&rec[13..], &data);
    }

    #[test]
    fn test_encode_cl2_layout() {
        let data: Vec<u8> = (0..64).collect();
        let frame = CanFrame::new_fd(0x7FF, false, &data, true, false).unwrap();
        let rec = encode_record(&frame, Family::Cl2).unwrap();

        assert_eq!(rec[0] as usize, IXXAT_USB_CL2_MSG_SIZE - 1);
        assert_eq!(rec.len(), IXXAT_USB_CL2_MSG_SIZE);
        let flags = u32::from_le_bytes([rec[9], rec[10], rec[11], rec[12]]);
        assert_ne!(flags & IXXAT_USB_FDMSG_FLAGS_EDL, 0);
        assert_ne!(flags & IXXAT_USB_FDMSG_FLAGS_FDR, 0);
        assert_eq!(decode_dlc(flags), 15);
        assert_eq!(rec[13..17], [0, 0, 0, 0]);
        assert_eq!(&rec[17..], &data[..]);
    }

    #[test]
    fn test_encode_remote_has_no_payload() {
        let frame = CanFrame::new_remote(0x100, false, 4).unwrap();
        let rec = encode_record(&frame, Family::Cl1).unwrap();
        assert_eq!(rec[0], 12);
        let flags = u32::from_le_bytes([rec[9], rec[10], rec[11], rec[12]]);
        assert_ne!(flags & IXXAT_USB_MSG_FLAGS_RTR, 0);
        assert_eq!(decode_dlc(flags), 4);
    }

    #[test]
    fn test_encode_fd_on_cl1_rejected() {
        let frame = CanFrame::new_fd(0x100, false, &[1, 2], false, false).unwrap();
        assert!(matches!(
            encode_record(&frame, Family::Cl1),
            Err(IxxatError::FdNotSupported)
        ));
    }
}
