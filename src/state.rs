//! Controller state and bus error interpretation
//!
//! [`BusMonitor`] turns STATUS words and ERROR records into controller state
//! transitions, statistics and [`ErrorRecord`]s for the network stack.

use bitflags::bitflags;
use log::{debug, info};

use crate::constants::*;

/// CAN controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanState {
    /// Normal operation
    ErrorActive,
    /// TEC/REC above the warning limit
    ErrorWarning,
    /// TEC/REC > 127
    ErrorPassive,
    /// TEC > 255
    BusOff,
    /// Controller not started
    #[default]
    Stopped,
}

impl CanState {
    /// Get human-readable name for CAN state
    pub fn name(&self) -> &'static str {
        match self {
            CanState::ErrorActive => "ERROR_ACTIVE",
            CanState::ErrorWarning => "ERROR_WARNING",
            CanState::ErrorPassive => "ERROR_PASSIVE",
            CanState::BusOff => "BUS_OFF",
            CanState::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for CanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Controller problems reported with a status change
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControllerFlags: u8 {
        const RX_WARNING = 1 << 0;
        const TX_WARNING = 1 << 1;
        const RX_PASSIVE = 1 << 2;
        const TX_PASSIVE = 1 << 3;
        const RX_OVERFLOW = 1 << 4;
    }
}

/// Protocol violation reported by an ERROR record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    Ack,
    Bit,
    Crc,
    Form,
    Stuff,
    Unspecified,
}

impl BusError {
    /// Classify a raw error byte
    pub fn from_code(code: u8) -> Self {
        match code {
            IXXAT_USB_CAN_ERROR_ACK => BusError::Ack,
            IXXAT_USB_CAN_ERROR_BIT => BusError::Bit,
            IXXAT_USB_CAN_ERROR_CRC => BusError::Crc,
            IXXAT_USB_CAN_ERROR_FORM => BusError::Form,
            IXXAT_USB_CAN_ERROR_STUFF => BusError::Stuff,
            _ => BusError::Unspecified,
        }
    }

    /// Check if the error is counted against transmission
    pub fn is_tx(&self) -> bool {
        matches!(self, BusError::Ack | BusError::Bit)
    }
}

/// TX/RX error counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorCounters {
    pub tx_errors: u8,
    pub rx_errors: u8,
}

/// Annotated error notification for the network stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRecord {
    /// Controller went bus-off
    BusOff,
    /// Controller state degraded or the receiver overflowed
    Controller {
        flags: ControllerFlags,
        counters: ErrorCounters,
    },
    /// Protocol error on the bus
    Bus {
        error: BusError,
        counters: ErrorCounters,
    },
}

/// Channel statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_over_errors: u64,
    pub tx_dropped: u64,
    pub bus_error: u64,
    pub error_warning: u64,
    pub error_passive: u64,
    pub bus_off: u64,
}

/// Result of interpreting a STATUS word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusOutcome {
    /// Record to hand to the network stack
    pub record: Option<ErrorRecord>,
    /// Controller just went bus-off
    pub bus_off: bool,
}

/// Controller state tracker
#[derive(Debug, Default)]
pub struct BusMonitor {
    state: CanState,
    counters: ErrorCounters,
    stats: ChannelStats,
}

impl BusMonitor {
    /// Current controller state
    pub fn state(&self) -> CanState {
        self.state
    }

    /// Force a state, used by the lifecycle on start and stop
    pub fn set_state(&mut self, state: CanState) {
        if self.state != state {
            debug!("CAN state {} -> {}", self.state, state);
        }
        self.state = state;
    }

    /// Last known error counters
    pub fn counters(&self) -> ErrorCounters {
        self.counters
    }

    /// Statistics so far
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Mutable statistics, for frame and transfer accounting
    pub fn stats_mut(&mut self) -> &mut ChannelStats {
        &mut self.stats
    }

    /// Interpret a controller status word
    pub fn on_status(&mut self, status: u32) -> StatusOutcome {
        if status == IXXAT_USB_CAN_STATUS_OK {
            self.set_state(CanState::ErrorActive);
            self.counters = ErrorCounters::default();
            return StatusOutcome::default();
        }

        if status & IXXAT_USB_CAN_STATUS_BUSOFF != 0 {
            if self.state != CanState::BusOff {
                info!("Controller is bus-off");
            }
            self.set_state(CanState::BusOff);
            self.stats.bus_off += 1;
            return StatusOutcome {
                record: Some(ErrorRecord::BusOff),
                bus_off: true,
            };
        }

        // None means the status carries no state information
        let mut new_state = None;
        let mut flags = ControllerFlags::empty();

        if status & IXXAT_USB_CAN_STATUS_ERRLIM != 0 {
            new_state = Some(CanState::ErrorWarning);
            flags |= ControllerFlags::RX_WARNING | ControllerFlags::TX_WARNING;
            self.stats.error_warning += 1;
        }
        if status & IXXAT_USB_CAN_STATUS_ERR_PAS != 0 {
            new_state = Some(CanState::ErrorPassive);
            flags |= ControllerFlags::RX_PASSIVE | ControllerFlags::TX_PASSIVE;
            self.stats.error_passive += 1;
        }
        if status & IXXAT_USB_CAN_STATUS_OVERRUN != 0 {
            new_state = None;
            flags |= ControllerFlags::RX_OVERFLOW;
            self.stats.rx_over_errors += 1;
            self.stats.rx_errors += 1;
        }

        // Only an all-clear leaves bus-off
        if let Some(state) = new_state {
            if self.state != CanState::BusOff {
                self.set_state(state);
            }
        }

        let record = (!flags.is_empty()).then_some(ErrorRecord::Controller {
            flags,
            counters: self.counters,
        });
        StatusOutcome {
            record,
            bus_off: false,
        }
    }

    /// Interpret an ERROR record
    ///
    /// Returns `None` while the controller is bus-off.
    pub fn on_error(&mut self, code: u8, rx_errors: u8, tx_errors: u8) -> Option<ErrorRecord> {
        self.counters = ErrorCounters {
            tx_errors,
            rx_errors,
        };

        if self.state == CanState::BusOff {
            return None;
        }

        let error = BusError::from_code(code);
        self.stats.bus_error += 1;
        if error.is_tx() {
            self.stats.tx_errors += 1;
        } else {
            self.stats.rx_errors += 1;
        }

        Some(ErrorRecord::Bus {
            error,
            counters: self.counters,
        })
    }
}
