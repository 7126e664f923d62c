//! Session Model
//!
//! All session logic is computed in America/New_York regardless of the
//! host timezone. Phase boundaries are inclusive-start, exclusive-end.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

/// The seven disjoint session phases. Total over wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionPhase {
    PreMarket = 0,
    Opening = 1,
    MidMorning = 2,
    Lunch = 3,
    Afternoon = 4,
    Close = 5,
    PostRth = 6,
}

impl Default for SessionPhase {
    fn default() -> Self {
        SessionPhase::PreMarket
    }
}

impl SessionPhase {
    /// Phase of a UTC timestamp, evaluated in New York local time.
    pub fn of(ts: DateTime<Utc>) -> SessionPhase {
        let local = ts.with_timezone(&New_York);
        let t = local.time();
        if t < NaiveTime::from_hms_opt(9, 30, 0).unwrap() {
            SessionPhase::PreMarket
        } else if t < NaiveTime::from_hms_opt(10, 30, 0).unwrap() {
            SessionPhase::Opening
        } else if t < NaiveTime::from_hms_opt(11, 30, 0).unwrap() {
            SessionPhase::MidMorning
        } else if t < NaiveTime::from_hms_opt(13, 30, 0).unwrap() {
            SessionPhase::Lunch
        } else if t < NaiveTime::from_hms_opt(15, 0, 0).unwrap() {
            SessionPhase::Afternoon
        } else if t < NaiveTime::from_hms_opt(16, 0, 0).unwrap() {
            SessionPhase::Close
        } else {
            SessionPhase::PostRth
        }
    }

    /// Phases during which new entries are ever considered.
    #[inline]
    pub fn is_tradable(self) -> bool {
        matches!(
            self,
            SessionPhase::Opening
                | SessionPhase::MidMorning
                | SessionPhase::Afternoon
                | SessionPhase::Close
        )
    }

    /// Phase is inside regular trading hours.
    #[inline]
    pub fn in_rth(self) -> bool {
        !matches!(self, SessionPhase::PreMarket | SessionPhase::PostRth)
    }
}

/// True when the timestamp falls in [09:30, 16:00) New York time.
pub fn in_rth(ts: DateTime<Utc>) -> bool {
    SessionPhase::of(ts).in_rth()
}

/// New York calendar date of a timestamp; the session-reset key.
pub fn session_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&New_York).date_naive()
}

/// Minutes remaining until the 16:00 close, negative after close.
pub fn minutes_to_close(ts: DateTime<Utc>) -> i64 {
    let local = ts.with_timezone(&New_York);
    let t = local.time();
    let current = t.hour() as i64 * 60 + t.minute() as i64;
    16 * 60 - current
}

/// A configured window during which no entries are taken, e.g. around
/// scheduled economic releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoTradeWindow {
    pub id: String,
    pub enabled: bool,
    /// "HH:MM" in New York time, inclusive.
    pub start_time: NaiveTime,
    /// "HH:MM" in New York time, exclusive.
    pub end_time: NaiveTime,
}

impl NoTradeWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let t = ts.with_timezone(&New_York).time();
        self.start_time <= t && t < self.end_time
    }
}

/// Holiday and half-day calendar. Date lists are normalized (deduplicated,
/// sorted) at config load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCalendar {
    pub holiday_dates: Vec<NaiveDate>,
    pub half_days: Vec<HalfDay>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HalfDay {
    pub date: NaiveDate,
    /// Early close in New York time.
    pub close_time: NaiveTime,
}

impl SessionCalendar {
    /// Whether the market is open on this date at this time (fail-closed on
    /// holidays and past early closes).
    pub fn is_market_open(&self, ts: DateTime<Utc>) -> bool {
        let local = ts.with_timezone(&New_York);
        let date = local.date_naive();
        if self.holiday_dates.binary_search(&date).is_ok() {
            return false;
        }
        for hd in &self.half_days {
            if hd.date == date && local.time() >= hd.close_time {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ny(h: u32, m: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(2025, 3, 10, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_phase_boundaries_inclusive_start() {
        assert_eq!(SessionPhase::of(ny(9, 29)), SessionPhase::PreMarket);
        assert_eq!(SessionPhase::of(ny(9, 30)), SessionPhase::Opening);
        assert_eq!(SessionPhase::of(ny(10, 30)), SessionPhase::MidMorning);
        assert_eq!(SessionPhase::of(ny(11, 30)), SessionPhase::Lunch);
        assert_eq!(SessionPhase::of(ny(13, 30)), SessionPhase::Afternoon);
        assert_eq!(SessionPhase::of(ny(15, 0)), SessionPhase::Close);
        assert_eq!(SessionPhase::of(ny(16, 0)), SessionPhase::PostRth);
    }

    #[test]
    fn test_tradable_phases() {
        assert!(SessionPhase::Opening.is_tradable());
        assert!(SessionPhase::Close.is_tradable());
        assert!(!SessionPhase::Lunch.is_tradable());
        assert!(!SessionPhase::PreMarket.is_tradable());
        assert!(!SessionPhase::PostRth.is_tradable());
    }

    #[test]
    fn test_rth_window() {
        assert!(!in_rth(ny(9, 29)));
        assert!(in_rth(ny(9, 30)));
        assert!(in_rth(ny(15, 59)));
        assert!(!in_rth(ny(16, 0)));
    }

    #[test]
    fn test_minutes_to_close() {
        assert_eq!(minutes_to_close(ny(15, 30)), 30);
        assert_eq!(minutes_to_close(ny(16, 0)), 0);
        assert_eq!(minutes_to_close(ny(16, 10)), -10);
    }

    #[test]
    fn test_no_trade_window() {
        let w = NoTradeWindow {
            id: "fomc".into(),
            enabled: true,
            start_time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(14, 30, 0).unwrap(),
        };
        assert!(w.contains(ny(14, 0)));
        assert!(w.contains(ny(14, 29)));
        assert!(!w.contains(ny(14, 30)));
        let disabled = NoTradeWindow {
            enabled: false,
            ..w.clone()
        };
        assert!(!disabled.contains(ny(14, 15)));
    }

    #[test]
    fn test_calendar_holiday_and_half_day() {
        let cal = SessionCalendar {
            holiday_dates: vec![NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()],
            half_days: vec![HalfDay {
                date: NaiveDate::from_ymd_opt(2025, 3, 11).unwrap(),
                close_time: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            }],
        };
        assert!(!cal.is_market_open(ny(10, 0)));
        let next_day = New_York
            .with_ymd_and_hms(2025, 3, 11, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let after_close = New_York
            .with_ymd_and_hms(2025, 3, 11, 13, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(cal.is_market_open(next_day));
        assert!(!cal.is_market_open(after_close));
    }
}
