//! Bar Aggregation
//!
//! Folds the tick/quote stream from the market-data thread into
//! fixed-interval OHLCV bars. A bar is finalized lazily: the first tick at
//! or past the next interval boundary emits the prior bar before opening a
//! new one. Intervals with no ticks emit nothing; the gap shows up in the
//! DVS metrics instead.

use crate::engine::price::Px;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single trade tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub price: Px,
    pub size: u64,
}

/// Top-of-book quote update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Px,
    pub ask: Px,
}

/// Completed OHLCV bar. Timestamp is truncated to the interval boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Px,
    pub high: Px,
    pub low: Px,
    pub close: Px,
    pub volume: u64,
    pub tick_count: u32,
    pub bid: Option<Px>,
    pub ask: Option<Px>,
}

impl Bar {
    /// Structural OHLC checks. Returns the ids of every failed check; a
    /// non-empty result forces DVS to zero for the interval.
    pub fn validate(&self) -> Vec<&'static str> {
        let mut rejected = Vec::new();
        if !(self.low <= self.open && self.open <= self.high) {
            rejected.push("ohlc_open_range");
        }
        if !(self.low <= self.close && self.close <= self.high) {
            rejected.push("ohlc_close_range");
        }
        if self.low > self.high {
            rejected.push("ohlc_low_high");
        }
        rejected
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    /// Spread in ticks if both sides of the book are known.
    pub fn spread_ticks(&self) -> Option<i64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) if a > b => Some(a - b),
            _ => None,
        }
    }
}

/// Tick-to-bar aggregator for one instrument.
#[derive(Debug)]
pub struct BarAggregator {
    interval: TimeDelta,
    current: Option<BuildingBar>,
    bid: Option<Px>,
    ask: Option<Px>,
    last_tick_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct BuildingBar {
    boundary: DateTime<Utc>,
    open: Px,
    high: Px,
    low: Px,
    close: Px,
    volume: u64,
    tick_count: u32,
}

impl BarAggregator {
    /// One-minute bars.
    pub fn one_minute() -> Self {
        Self::new(TimeDelta::minutes(1))
    }

    pub fn new(interval: TimeDelta) -> Self {
        assert!(interval > TimeDelta::zero(), "bar interval must be positive");
        Self {
            interval,
            current: None,
            bid: None,
            ask: None,
            last_tick_ts: None,
        }
    }

    /// Process a tick; returns the finalized prior bar when a boundary was
    /// crossed. Out-of-order ticks are dropped.
    pub fn on_tick(&mut self, tick: Tick) -> Option<Bar> {
        if let Some(last) = self.last_tick_ts {
            if tick.timestamp < last {
                warn!(ts = %tick.timestamp, last = %last, "dropping out-of-order tick");
                return None;
            }
        }
        self.last_tick_ts = Some(tick.timestamp);

        let boundary = tick
            .timestamp
            .duration_trunc(self.interval)
            .expect("interval truncation");

        let mut emitted = None;
        match &mut self.current {
            Some(building) if building.boundary == boundary => {
                building.high = building.high.max(tick.price);
                building.low = building.low.min(tick.price);
                building.close = tick.price;
                building.volume += tick.size;
                building.tick_count += 1;
            }
            _ => {
                if let Some(done) = self.current.take() {
                    emitted = Some(self.seal(done));
                }
                self.current = Some(BuildingBar {
                    boundary,
                    open: tick.price,
                    high: tick.price,
                    low: tick.price,
                    close: tick.price,
                    volume: tick.size,
                    tick_count: 1,
                });
            }
        }
        emitted
    }

    /// Latch the latest known top of book; stamped onto finalized bars.
    pub fn on_quote(&mut self, quote: Quote) {
        self.bid = Some(quote.bid);
        self.ask = Some(quote.ask);
    }

    /// Force out the building bar, e.g. at shutdown.
    pub fn flush(&mut self) -> Option<Bar> {
        self.current.take().map(|b| self.seal(b))
    }

    fn seal(&self, b: BuildingBar) -> Bar {
        Bar {
            timestamp: b.boundary,
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: b.volume,
            tick_count: b.tick_count,
            bid: self.bid,
            ask: self.ask,
        }
    }
}
