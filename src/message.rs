//! Inbound message record decoding
//!
//! A bulk IN buffer is a sequence of size-prefixed records. [`Records`]
//! walks the buffer and yields one [`Record`] per entry. A record that would
//! read past the end of the buffer stops the walk with a single framing
//! error; everything decoded before it stays valid. A record whose size fits
//! but whose content is bad yields a [`IxxatError::MalformedRecord`] and the
//! walk moves on to the next one.

use log::warn;

use crate::adapter::Family;
use crate::constants::*;
use crate::error::{IxxatError, Result};
use crate::frame::CanFrame;

/// One decoded message record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Received CAN or CAN FD frame
    Data {
        time: u32,
        frame: CanFrame,
        /// Device lost frames before this one
        overrun: bool,
    },
    /// Controller status word
    Status { time: u32, status: u32 },
    /// Bus error with the counter snapshot taken by the device
    Error {
        time: u32,
        code: u8,
        rx_errors: u8,
        tx_errors: u8,
    },
    /// Device timer overflowed
    TimeOverflow { time: u32 },
    /// Informational message from the controller
    Info,
    /// Controller woke up from sleep
    Wakeup,
    /// Device timer was reset
    TimerReset,
    /// Record type this crate does not know
    Unknown { kind: u8 },
}

/// Iterator over the records of one bulk IN buffer
pub struct Records<'a> {
    buf: &'a [u8],
    pos: usize,
    family: Family,
    decoded: usize,
    failed: bool,
}

/// Decode the records of a bulk IN buffer
pub fn decode_records(buf: &[u8], family: Family) -> Records<'_> {
    Records {
        buf,
        pos: 0,
        family,
        decoded: 0,
        failed: false,
    }
}

impl<'a> Records<'a> {
    fn framing_error(&mut self) -> IxxatError {
        self.failed = true;
        IxxatError::Framing {
            offset: self.pos,
            remaining: self.buf.len() - self.pos,
            decoded: self.decoded,
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }

        let remaining = &self.buf[self.pos..];
        let size = remaining[0] as usize;
        if size == 0 || size + 1 > remaining.len() || size < IXXAT_USB_MSG_HEADER_SIZE {
            return Some(Err(self.framing_error()));
        }

        let offset = self.pos;
        let raw = &remaining[..size + 1];
        self.pos += size + 1;
        match parse_record(raw, self.family) {
            Ok(record) => {
                self.decoded += 1;
                Some(Ok(record))
            }
            Err(e) => {
                let reason = match e {
                    IxxatError::InvalidFrame(reason) => reason,
                    _ => "undecodable record",
                };
                Some(Err(IxxatError::MalformedRecord { offset, reason }))
            }
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Parse one record; `raw` holds exactly `size + 1` bytes
fn parse_record(raw: &[u8], family: Family) -> Result<Record> {
    let time = read_u32(raw, 1);
    let id = read_u32(raw, 5);
    let flags = read_u32(raw, 9);
    let payload = raw.get(family.payload_offset()..).unwrap_or(&[]);

    let kind = (flags & IXXAT_USB_MSG_FLAGS_TYPE) as u8;
    let record = match kind {
        IXXAT_USB_CAN_DATA => Record::Data {
            time,
            frame: CanFrame::from_record(id, flags, payload)?,
            overrun: flags & IXXAT_USB_MSG_FLAGS_OVR != 0,
        },
        IXXAT_USB_CAN_STATUS => {
            let status = payload
                .get(..4)
                .map(|b| read_u32(b, 0))
                .ok_or(IxxatError::InvalidFrame("status record too short"))?;
            Record::Status { time, status }
        }
        IXXAT_USB_CAN_ERROR => {
            let fields = payload
                .get(..5)
                .ok_or(IxxatError::InvalidFrame("error record too short"))?;
            Record::Error {
                time,
                code: fields[0],
                rx_errors: fields[3],
                tx_errors: fields[4],
            }
        }
        IXXAT_USB_CAN_TIMEOVR => Record::TimeOverflow { time },
        IXXAT_USB_CAN_INFO => Record::Info,
        IXXAT_USB_CAN_WAKEUP => Record::Wakeup,
        IXXAT_USB_CAN_TIMERST => Record::TimerReset,
        other => {
            warn!("Unhandled record type 0x{:02x}", other);
            Record::Unknown { kind: other }
        }
    };

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_record;

    fn raw_record(family: Family, kind: u8, time: u32, payload: &[u8]) -> Vec<u8> {
        let extra = if family == Family::Cl2 { 4 } else { 0 };
        let size = IXXAT_USB_MSG_HEADER_SIZE + extra + payload.len();
        let mut buf = vec![size as u8];
        buf.extend_from_slice(&time.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(kind as u32).to_le_bytes());
        buf.extend_from_slice(&vec![0u8; extra]);
        buf.extend_from_slice(payload);
        buf
    }

    fn frames() -> Vec<CanFrame> {
        let data: Vec<u8> = (0..64).map(|b| b as u8 ^ 0x5A).collect();
        let mut frames = Vec::new();
        for extended in [false, true] {
            let id = if extended { 0x1234_5678 & CAN_EFF_MASK } else { 0x6A5 };
            for len in [0, 1, 8] {
                frames.push(CanFrame::new(id, extended, &data[..len]).unwrap());
                frames.push(CanFrame::new_remote(id, extended, len).unwrap());
            }
        }
        frames
    }

    fn fd_frames() -> Vec<CanFrame> {
        let data: Vec<u8> = (0..64).collect();
        let mut frames = Vec::new();
        for (len, brs, esi) in [(0, false, false), (7, true, false), (12, false, true), (64, true, true)] {
            frames.push(CanFrame::new_fd(0x321, false, &data[..len], brs, esi).unwrap());
            frames.push(CanFrame::new_fd(0x1FFF_FFFF, true, &data[..len], brs, esi).unwrap());
        }
        frames
    }

    fn round_trip(frame: &CanFrame, family: Family) -> CanFrame {
        let rec = encode_record(frame, family).unwrap();
        let mut records = decode_records(&rec, family);
        match records.next() {
            Some(Ok(Record::Data { frame, .. })) => {
                assert!(records.next().is_none());
                frame
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_classic() {
        for family in [Family::Cl1, Family::Cl2] {
            for frame in frames() {
                assert_eq!(round_trip(&frame, family), frame);
            }
        }
    }

    #[test]
    fn test_round_trip_fd() {
        for frame in fd_frames() {
            assert_eq!(round_trip(&frame, Family::Cl2), frame);
        }
    }

    #[test]
    fn test_truncated_last_record() {
        let a = CanFrame::new(0x10, false, &[1, 2, 3]).unwrap();
        let b = CanFrame::new(0x20, false, &[4, 5, 6, 7, 8, 9, 10, 11]).unwrap();
        let mut buf = encode_record(&a, Family::Cl1).unwrap();
        buf.extend(encode_record(&a, Family::Cl1).unwrap());
        let good_len = buf.len();
        let tail = encode_record(&b, Family::Cl1).unwrap();
        buf.extend_from_slice(&tail[..tail.len() - 3]);

        let results: Vec<_> = decode_records(&buf, Family::Cl1).collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Ok(Record::Data { .. })));
        assert!(matches!(results[1], Ok(Record::Data { .. })));
        match &results[2] {
            Err(IxxatError::Framing {
                offset,
                remaining,
                decoded,
            }) => {
                assert_eq!(*offset, good_len);
                assert_eq!(*remaining, tail.len() - 3);
                assert_eq!(*decoded, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_data_record_is_skipped() {
        let good = CanFrame::new(0x30, false, &[0xAA, 0xBB]).unwrap();
        let mut buf = encode_record(&good, Family::Cl1).unwrap();
        // claim eight data bytes while carrying two
        let flags = (read_u32(&buf, 9) & !IXXAT_USB_MSG_FLAGS_DLC) | encode_dlc(8);
        buf[9..13].copy_from_slice(&flags.to_le_bytes());
        buf.extend(encode_record(&good, Family::Cl1).unwrap());
        buf.extend(encode_record(&good, Family::Cl1).unwrap());

        let results: Vec<_> = decode_records(&buf, Family::Cl1).collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[0],
            Err(IxxatError::MalformedRecord { offset: 0, .. })
        ));
        for result in &results[1..] {
            match result {
                Ok(Record::Data { frame, .. }) => assert_eq!(frame, &good),
                other => panic!("unexpected {:?}", other),
            }
        }

        // a short status record is skipped the same way
        let mut buf = raw_record(Family::Cl2, IXXAT_USB_CAN_STATUS, 0, &[0x04]);
        buf.extend(raw_record(Family::Cl2, IXXAT_USB_CAN_TIMEOVR, 9, &[]));
        let results: Vec<_> = decode_records(&buf, Family::Cl2).collect();
        assert!(matches!(results[0], Err(IxxatError::MalformedRecord { .. })));
        assert!(matches!(results[1], Ok(Record::TimeOverflow { time: 9 })));
    }

    #[test]
    fn test_zero_size_stops_decoding() {
        let mut buf = raw_record(Family::Cl1, IXXAT_USB_CAN_INFO, 0, &[0; 8]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        let results: Vec<_> = decode_records(&buf, Family::Cl1).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Ok(Record::Info)));
        assert!(matches!(results[1], Err(IxxatError::Framing { .. })));
    }

    #[test]
    fn test_control_records() {
        let mut buf = raw_record(Family::Cl2, IXXAT_USB_CAN_STATUS, 100, &0x2004u32.to_le_bytes());
        buf.extend(raw_record(Family::Cl2, IXXAT_USB_CAN_ERROR, 200, &[3, 0, 0, 17, 42]));
        buf.extend(raw_record(Family::Cl2, IXXAT_USB_CAN_TIMEOVR, 300, &[]));
        buf.extend(raw_record(Family::Cl2, IXXAT_USB_CAN_WAKEUP, 0, &[]));
        buf.extend(raw_record(Family::Cl2, 0x42, 0, &[]));
        buf.extend(raw_record(Family::Cl2, IXXAT_USB_CAN_TIMERST, 0, &[]));

        let records: Vec<_> = decode_records(&buf, Family::Cl2)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            records,
            vec![
                Record::Status {
                    time: 100,
                    status: 0x2004
                },
                Record::Error {
                    time: 200,
                    code: 3,
                    rx_errors: 17,
                    tx_errors: 42
                },
                Record::TimeOverflow { time: 300 },
                Record::Wakeup,
                Record::Unknown { kind: 0x42 },
                Record::TimerReset,
            ]
        );
    }

    #[test]
    fn test_overrun_flag() {
        let frame = CanFrame::new(0x10, false, &[1]).unwrap();
        let mut rec = encode_record(&frame, Family::Cl1).unwrap();
        let flags = read_u32(&rec, 9) | IXXAT_USB_MSG_FLAGS_OVR;
        rec[9..13].copy_from_slice(&flags.to_le_bytes());
        match decode_records(&rec, Family::Cl1).next() {
            Some(Ok(Record::Data { overrun, .. })) => assert!(overrun),
            other => panic!("unexpected {:?}", other),
        }
    }
}
