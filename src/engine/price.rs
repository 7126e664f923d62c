//! Tick-Aligned Prices
//!
//! All engine prices are exact tick counts (`i64`), never raw floats.
//! Conversion to and from decimal happens only at the instrument boundary,
//! where the tick size is known. This keeps stop/target arithmetic exact and
//! makes replay byte-stable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// MES tick size in index points.
pub const DEFAULT_TICK_SIZE: f64 = 0.25;
/// MES dollar value of one tick.
pub const DEFAULT_TICK_VALUE: f64 = 1.25;

/// A price expressed as a signed number of ticks from zero.
///
/// The tick size itself lives in [`crate::engine::config::Instrument`]; a
/// `Px` is meaningless without it, so every decimal conversion takes the
/// tick size explicitly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Px(pub i64);

impl Px {
    /// Round a decimal price to the nearest tick.
    #[inline]
    pub fn from_f64(price: f64, tick_size: f64) -> Self {
        Px((price / tick_size).round() as i64)
    }

    /// Decimal price for display and broker I/O.
    #[inline]
    pub fn to_f64(self, tick_size: f64) -> f64 {
        self.0 as f64 * tick_size
    }

    /// Tick count.
    #[inline]
    pub fn ticks(self) -> i64 {
        self.0
    }

    /// Absolute tick distance to another price.
    #[inline]
    pub fn distance_ticks(self, other: Px) -> i64 {
        (self.0 - other.0).abs()
    }

    /// Offset by a signed number of ticks.
    #[inline]
    pub fn offset(self, ticks: i64) -> Px {
        Px(self.0 + ticks)
    }
}

impl Add<i64> for Px {
    type Output = Px;
    fn add(self, rhs: i64) -> Px {
        Px(self.0 + rhs)
    }
}

impl Sub<i64> for Px {
    type Output = Px;
    fn sub(self, rhs: i64) -> Px {
        Px(self.0 - rhs)
    }
}

impl Sub for Px {
    type Output = i64;
    fn sub(self, rhs: Px) -> i64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for Px {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display in default tick units; callers with another instrument
        // should format via to_f64 themselves.
        write!(f, "{:.2}", self.to_f64(DEFAULT_TICK_SIZE))
    }
}

/// Dollar value of a tick move over `qty` contracts.
#[inline]
pub fn ticks_to_usd(ticks: i64, qty: i64, tick_value: f64) -> f64 {
    ticks as f64 * qty as f64 * tick_value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_tick() {
        let p = Px::from_f64(5600.12, DEFAULT_TICK_SIZE);
        assert_eq!(p.to_f64(DEFAULT_TICK_SIZE), 5600.0);
        let p = Px::from_f64(5600.13, DEFAULT_TICK_SIZE);
        assert_eq!(p.to_f64(DEFAULT_TICK_SIZE), 5600.25);
    }

    #[test]
    fn test_tick_arithmetic() {
        let entry = Px::from_f64(5598.25, DEFAULT_TICK_SIZE);
        let stop = entry - 8;
        assert_eq!(stop.to_f64(DEFAULT_TICK_SIZE), 5596.25);
        assert_eq!(entry.distance_ticks(stop), 8);
        assert_eq!(entry - stop, 8);
    }

    #[test]
    fn test_ticks_to_usd() {
        assert_eq!(ticks_to_usd(8, 1, DEFAULT_TICK_VALUE), 10.0);
        assert_eq!(ticks_to_usd(-4, 2, DEFAULT_TICK_VALUE), -10.0);
    }
}
