//! Bit timing and controller mode encoding
//!
//! [`encode_init`] turns abstract bit timing parameters into the payload of
//! the adapter's controller init command: a BTR0/BTR1 register pair on CL1
//! adapters, nominal and data phase timing blocks on CL2 adapters.

use bitflags::bitflags;

use crate::adapter::{Adapter, Family};
use crate::constants::*;
use crate::error::{IxxatError, Result};

bitflags! {
    /// Controller modes requested by the user
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlMode: u32 {
        /// Do not acknowledge or transmit
        const LISTEN_ONLY = 1 << 0;
        /// Sample each bit three times (CL1 only)
        const TRIPLE_SAMPLING = 1 << 1;
        /// Report bus errors as error records
        const BERR_REPORTING = 1 << 2;
        /// Enable CAN FD
        const FD = 1 << 3;
        /// Use non-ISO (Bosch) CAN FD framing
        const FD_NON_ISO = 1 << 4;
    }
}

/// Abstract CAN bit timing, expressed in time quanta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitTiming {
    /// Baud rate prescaler
    pub brp: u32,
    /// Propagation segment
    pub prop_seg: u32,
    /// Phase segment 1
    pub phase_seg1: u32,
    /// Phase segment 2
    pub phase_seg2: u32,
    /// Synchronization jump width
    pub sjw: u32,
}

impl BitTiming {
    /// Create a new bit timing configuration
    pub fn new(brp: u32, prop_seg: u32, phase_seg1: u32, phase_seg2: u32, sjw: u32) -> Self {
        Self {
            brp,
            prop_seg,
            phase_seg1,
            phase_seg2,
            sjw,
        }
    }

    /// Time segment 1 (propagation plus phase segment 1)
    pub fn tseg1(&self) -> u32 {
        self.prop_seg.saturating_add(self.phase_seg1)
    }

    /// Number of time quanta per bit
    pub fn quanta_per_bit(&self) -> u32 {
        CAN_SYNC_SEG
            .saturating_add(self.tseg1())
            .saturating_add(self.phase_seg2)
    }

    /// Resulting bitrate for a controller clock
    pub fn bitrate(&self, clock_hz: u32) -> u32 {
        let div = self.brp.saturating_mul(self.quanta_per_bit());
        if div == 0 {
            0
        } else {
            clock_hz / div
        }
    }

    /// Sample point in percent
    pub fn sample_point(&self) -> f32 {
        let qpb = self.quanta_per_bit();
        if qpb == 0 {
            return 0.0;
        }
        CAN_SYNC_SEG.saturating_add(self.tseg1()) as f32 * 100.0 / qpb as f32
    }
}

impl std::fmt::Display for BitTiming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BRP: {}\nProp Seg: {}\nPhase Seg 1: {}\nPhase Seg 2: {}\nSJW: {}",
            self.brp, self.prop_seg, self.phase_seg1, self.phase_seg2, self.sjw
        )
    }
}

/// Bit timing limits published by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTimingConst {
    /// Name used in diagnostics
    pub name: &'static str,
    /// Minimum TSEG1 value
    pub tseg1_min: u32,
    /// Maximum TSEG1 value
    pub tseg1_max: u32,
    /// Minimum TSEG2 value
    pub tseg2_min: u32,
    /// Maximum TSEG2 value
    pub tseg2_max: u32,
    /// Maximum SJW value
    pub sjw_max: u32,
    /// Minimum BRP value
    pub brp_min: u32,
    /// Maximum BRP value
    pub brp_max: u32,
    /// BRP increment value
    pub brp_inc: u32,
}

impl BitTimingConst {
    /// Check a bit timing against these limits
    pub fn validate(&self, bt: &BitTiming) -> Result<()> {
        check("tseg1", bt.tseg1(), self.tseg1_min, self.tseg1_max)?;
        check("tseg2", bt.phase_seg2, self.tseg2_min, self.tseg2_max)?;
        check("sjw", bt.sjw, 1, self.sjw_max.min(bt.phase_seg2.max(1)))?;
        check("brp", bt.brp, self.brp_min, self.brp_max)?;
        Ok(())
    }

    /// Find a bit timing for `bitrate` close to `sample_point` percent
    ///
    /// Only exact bitrates are accepted. Among those the timing with the
    /// smallest sample point deviation wins, ties go to the smaller prescaler.
    pub fn calc(&self, clock_hz: u32, bitrate: u32, sample_point: f32) -> Result<BitTiming> {
        let unsupported = IxxatError::UnsupportedBitrate { bitrate, clock_hz };
        if bitrate == 0 {
            return Err(unsupported);
        }

        let qpb_min = CAN_SYNC_SEG + self.tseg1_min + self.tseg2_min;
        let qpb_max = CAN_SYNC_SEG + self.tseg1_max + self.tseg2_max;
        let step = self.brp_inc.max(1);

        let mut best: Option<(f32, BitTiming)> = None;
        let mut brp = self.brp_min.max(1);
        while brp <= self.brp_max {
            let div = brp as u64 * bitrate as u64;
            if clock_hz as u64 % div == 0 {
                let qpb = (clock_hz as u64 / div) as u32;
                if (qpb_min..=qpb_max).contains(&qpb) {
                    if let Some(bt) = self.split(brp, qpb, sample_point) {
                        let err = (bt.sample_point() - sample_point).abs();
                        if best.map_or(true, |(best_err, _)| err < best_err) {
                            best = Some((err, bt));
                        }
                    }
                }
            }
            brp += step;
        }

        best.map(|(_, bt)| bt).ok_or(unsupported)
    }

    fn split(&self, brp: u32, qpb: u32, sample_point: f32) -> Option<BitTiming> {
        let wanted = (qpb as f32 * sample_point / 100.0).round() as u32;
        let tseg1 = wanted
            .saturating_sub(CAN_SYNC_SEG)
            .clamp(self.tseg1_min, self.tseg1_max);
        let tseg2 = qpb.checked_sub(CAN_SYNC_SEG + tseg1)?;
        let (tseg1, tseg2) = if tseg2 < self.tseg2_min {
            let tseg1 = qpb.checked_sub(CAN_SYNC_SEG + self.tseg2_min)?;
            (tseg1, self.tseg2_min)
        } else if tseg2 > self.tseg2_max {
            let tseg1 = qpb.checked_sub(CAN_SYNC_SEG + self.tseg2_max)?;
            (tseg1, self.tseg2_max)
        } else {
            (tseg1, tseg2)
        };

        let phase_seg1 = tseg1 / 2;
        let bt = BitTiming::new(brp, tseg1 - phase_seg1, phase_seg1, tseg2, 1);
        self.validate(&bt).ok().map(|_| bt)
    }
}

fn check(param: &'static str, value: u32, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(IxxatError::InvalidBitTiming {
            param,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// CL1 init payload: operating mode and the BTR register pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cl1Init {
    pub mode: u8,
    pub btr0: u8,
    pub btr1: u8,
}

/// CL2 timing block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanBtp {
    pub mode: u32,
    pub bps: u32,
    pub ts1: u16,
    pub ts2: u16,
    pub sjw: u16,
    pub tdo: u16,
}

impl CanBtp {
    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.bps.to_le_bytes());
        buf[8..10].copy_from_slice(&self.ts1.to_le_bytes());
        buf[10..12].copy_from_slice(&self.ts2.to_le_bytes());
        buf[12..14].copy_from_slice(&self.sjw.to_le_bytes());
        buf[14..16].copy_from_slice(&self.tdo.to_le_bytes());
        buf
    }
}

/// CL2 init payload: operating mode, extended mode and both timing blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cl2Init {
    pub opmode: u8,
    pub exmode: u8,
    pub nominal: CanBtp,
    pub data: CanBtp,
}

/// Controller init command, one variant per adapter family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitCommand {
    Cl1(Cl1Init),
    Cl2(Cl2Init),
}

impl InitCommand {
    /// Command code
    pub fn code(&self) -> u32 {
        match self {
            InitCommand::Cl1(_) => Family::Cl1.init_command(),
            InitCommand::Cl2(_) => Family::Cl2.init_command(),
        }
    }

    /// Pack the command payload (without envelope)
    pub fn pack(&self) -> Vec<u8> {
        match self {
            InitCommand::Cl1(init) => vec![init.mode, init.btr0, init.btr1, 0],
            InitCommand::Cl2(init) => {
                let mut buf = Vec::with_capacity(36);
                buf.push(init.opmode);
                buf.push(init.exmode);
                buf.extend_from_slice(&init.nominal.pack());
                buf.extend_from_slice(&init.data.pack());
                buf.extend_from_slice(&[0, 0]);
                buf
            }
        }
    }
}

fn opmode(mode: CtrlMode) -> u8 {
    let mut opmode = IXXAT_USB_OPMODE_STANDARD | IXXAT_USB_OPMODE_EXTENDED;
    if mode.contains(CtrlMode::BERR_REPORTING) {
        opmode |= IXXAT_USB_OPMODE_ERRFRAME;
    }
    if mode.contains(CtrlMode::LISTEN_ONLY) {
        opmode |= IXXAT_USB_OPMODE_LISTONLY;
    }
    opmode
}

/// Transmitter delay offset for the data phase
///
/// Segments are summed first, then scaled by the prescaler.
pub fn transmitter_delay_offset(data: &BitTiming) -> u16 {
    let tdo = (CAN_SYNC_SEG + data.prop_seg + data.phase_seg1).saturating_mul(data.brp);
    u16::try_from(tdo).unwrap_or(u16::MAX)
}

fn narrow(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// Encode the controller init command for an adapter
///
/// The timing must already be validated against the adapter limits.
pub fn encode_init(
    adapter: &Adapter,
    nominal: &BitTiming,
    data: Option<&BitTiming>,
    mode: CtrlMode,
) -> InitCommand {
    match adapter.family {
        Family::Cl1 => {
            let btr0 = ((nominal.brp.wrapping_sub(1) & 0x3F)
                | ((nominal.sjw.wrapping_sub(1) & 0x03) << 6)) as u8;
            let mut btr1 = ((nominal.tseg1().wrapping_sub(1) & 0x0F)
                | ((nominal.phase_seg2.wrapping_sub(1) & 0x07) << 4)) as u8;
            if mode.contains(CtrlMode::TRIPLE_SAMPLING) {
                btr1 |= IXXAT_USB_BTR1_SAM;
            }
            InitCommand::Cl1(Cl1Init {
                mode: opmode(mode),
                btr0,
                btr1,
            })
        }
        Family::Cl2 => {
            let mut btmode = IXXAT_USB_BTMODE_NAT;
            if mode.contains(CtrlMode::TRIPLE_SAMPLING) {
                btmode |= IXXAT_USB_BTMODE_TSM;
            }
            let nominal = CanBtp {
                mode: btmode,
                bps: nominal.brp,
                ts1: narrow(nominal.tseg1()),
                ts2: narrow(nominal.phase_seg2),
                sjw: narrow(nominal.sjw),
                tdo: 0,
            };

            let mut exmode = 0;
            let mut data_btp = CanBtp::default();
            if mode.contains(CtrlMode::FD) {
                exmode = IXXAT_USB_EXMODE_EXTDATA | IXXAT_USB_EXMODE_FASTDATA;
                if !mode.contains(CtrlMode::FD_NON_ISO) {
                    exmode |= IXXAT_USB_EXMODE_ISOFD;
                }
                if let Some(dbt) = data {
                    data_btp = CanBtp {
                        mode: IXXAT_USB_BTMODE_NAT,
                        bps: dbt.brp,
                        ts1: narrow(dbt.tseg1()),
                        ts2: narrow(dbt.phase_seg2),
                        sjw: narrow(dbt.sjw),
                        tdo: transmitter_delay_offset(dbt),
                    };
                }
            }

            InitCommand::Cl2(Cl2Init {
                opmode: opmode(mode),
                exmode,
                nominal,
                data: data_btp,
            })
        }
    }
}
