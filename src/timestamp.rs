//! Device to host timestamp reconciliation
//!
//! The device counts microseconds in a wrapping 32-bit timer. The reference
//! anchors that counter to a host time taken when the controller started and
//! moves the anchor forward each time the counter wraps.

use std::time::{SystemTime, UNIX_EPOCH};

const TICK_RANGE: u64 = 1 << 32;

/// Host time in microseconds since the Unix epoch
pub fn host_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Per-channel time reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeReference {
    host_anchor_us: u64,
    device_anchor: u32,
    last_tick: u32,
}

impl TimeReference {
    /// Anchor device tick `tick` at host time `host_us`
    pub fn seed(&mut self, tick: u32, host_us: u64) {
        self.host_anchor_us = host_us;
        self.device_anchor = tick;
        self.last_tick = tick;
    }

    /// Map a device tick onto host time in microseconds
    pub fn observe(&mut self, tick: u32) -> u64 {
        if tick < self.last_tick {
            let elapsed = TICK_RANGE - self.device_anchor as u64 + tick as u64;
            self.host_anchor_us += elapsed;
            self.device_anchor = tick;
        }
        self.last_tick = tick;
        self.host_anchor_us + tick.wrapping_sub(self.device_anchor) as u64
    }

    /// Host anchor in microseconds
    pub fn host_anchor_us(&self) -> u64 {
        self.host_anchor_us
    }
}
