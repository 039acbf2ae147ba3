//! Wrapped monotonic time.
//!
//! The daemon's clock is an unsigned counter ticking at [`WTHZ`]; interval
//! comparisons use signed-difference semantics, so any delta of 2^31 ticks
//! or more reads as "past". The clock starts near the wrap point to shake
//! out rollover bugs early.

use std::ops::{Add, AddAssign, Sub};
use std::time::Instant;

/// Ticks per second of the wrapped clock.
pub const WTHZ: u32 = 1000;

/// Microseconds per tick.
pub const USEC_PER_TICK: u32 = 1_000_000 / WTHZ;

/// Initial value of the wrapped clock at daemon start.
pub const WT_START: u32 = 0xFFFF_0000;

/// A point on the wrapped clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WTime(pub u32);

impl WTime {
    /// Signed tick difference `self - other`; negative means `self` is
    /// earlier. The cast implements the 2^31 horizon rule.
    pub fn delta(self, other: WTime) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// True when `self` is at or before `other`.
    pub fn le(self, other: WTime) -> bool {
        self.delta(other) <= 0
    }

    /// Ticks until `self`, zero if already due.
    pub fn ticks_until(self, now: WTime) -> u32 {
        let d = self.delta(now);
        if d <= 0 {
            0
        } else {
            d as u32
        }
    }
}

impl Add<u32> for WTime {
    type Output = WTime;
    fn add(self, ticks: u32) -> WTime {
        WTime(self.0.wrapping_add(ticks))
    }
}

impl AddAssign<u32> for WTime {
    fn add_assign(&mut self, ticks: u32) {
        self.0 = self.0.wrapping_add(ticks);
    }
}

impl Sub<WTime> for WTime {
    type Output = i32;
    fn sub(self, other: WTime) -> i32 {
        self.delta(other)
    }
}

/// Convert a microsecond delay to ticks, rounding up.
pub fn ticks_from_micros(usec: u64) -> u32 {
    ((usec + (USEC_PER_TICK as u64 - 1)) / USEC_PER_TICK as u64) as u32
}

/// Convert interest-lifetime units (1/4096 s) to ticks, rounding up.
pub fn ticks_from_lifetime(lifetime: u32) -> u32 {
    ((lifetime as u64 * WTHZ as u64 + 4095) / 4096) as u32
}

/// The daemon's reference clock: wrapped ticks plus whole seconds since
/// start, both derived from one monotonic instant.
#[derive(Debug, Clone)]
pub struct TickClock {
    start: Instant,
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Unwrapped ticks since start.
    pub fn ticks(&self) -> u64 {
        (self.start.elapsed().as_micros() / USEC_PER_TICK as u128) as u64
    }

    /// The wrapped tick counter.
    pub fn wtnow(&self) -> WTime {
        WTime(WT_START.wrapping_add(self.ticks() as u32))
    }

    /// Whole seconds since daemon start; the staleness clock.
    pub fn seconds(&self) -> u32 {
        self.start.elapsed().as_secs() as u32
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}
