//! Bias and Context Signals
//!
//! Twenty-two additional features (S29-S50) derived from the same bar state
//! plus clock context: crowd-psychology proxies, structural levels, calendar
//! effects, and meta-cognition flags about the system's own recent behavior.
//! Four aggregate scores summarize each group.
//!
//! These feed the belief engine's extended evidence matrix and the threshold
//! modifiers; they do not form a second belief system.

use crate::engine::numeric::{clamp01, RingBuf};
use crate::engine::session::SessionPhase;
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inputs distilled from the current core-signal record.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiasInputs {
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub vol_z: Option<f64>,
    pub micro_trend_5: Option<f64>,
    pub hhll_trend_strength: Option<f64>,
    pub range_compression: Option<f64>,
    pub climax_bar_flag: Option<f64>,
    pub session_phase: SessionPhase,
    /// Signed current position, for FOMO/fear context.
    pub net_position: i64,
}

/// The full bias feature record for one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasSignalOutput {
    // Psychological state (6)
    pub fomo_index: f64,
    pub panic_index: f64,
    pub herding_score: f64,
    pub greed_index: f64,
    pub fear_index: f64,
    pub euphoria_flag: f64,

    // Structural biases (6)
    pub round_number_proximity: f64,
    pub gamma_exposure_proxy: f64,
    pub anchoring_level_distance: f64,
    pub recency_bias_score: f64,
    pub overnight_gap_bias: f64,
    pub opening_drive_exhaustion: f64,

    // Temporal biases (6)
    pub time_of_day_edge: f64,
    pub day_of_week_edge: f64,
    pub pre_event_compression: f64,
    pub post_event_expansion: f64,
    pub month_end_flow: f64,
    pub quarter_end_flow: f64,

    // Meta-cognition (4)
    pub overconfidence_flag: f64,
    pub confirmation_bias_risk: f64,
    pub availability_bias_score: f64,
    pub hindsight_trap_flag: f64,

    // Aggregates
    pub psychological_state_score: f64,
    pub structural_bias_score: f64,
    pub temporal_bias_score: f64,
    pub meta_cognition_score: f64,

    pub timestamp: DateTime<Utc>,
}

impl BiasSignalOutput {
    /// Flat name → value view consumed by the belief engine. Keys sorted.
    pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
        let mut m = BTreeMap::new();
        m.insert("fomo_index", self.fomo_index);
        m.insert("panic_index", self.panic_index);
        m.insert("herding_score", self.herding_score);
        m.insert("greed_index", self.greed_index);
        m.insert("fear_index", self.fear_index);
        m.insert("euphoria_flag", self.euphoria_flag);
        m.insert("round_number_proximity", self.round_number_proximity);
        m.insert("gamma_exposure_proxy", self.gamma_exposure_proxy);
        m.insert("anchoring_level_distance", self.anchoring_level_distance);
        m.insert("recency_bias_score", self.recency_bias_score);
        m.insert("overnight_gap_bias", self.overnight_gap_bias);
        m.insert("opening_drive_exhaustion", self.opening_drive_exhaustion);
        m.insert("time_of_day_edge", self.time_of_day_edge);
        m.insert("day_of_week_edge", self.day_of_week_edge);
        m.insert("pre_event_compression", self.pre_event_compression);
        m.insert("post_event_expansion", self.post_event_expansion);
        m.insert("month_end_flow", self.month_end_flow);
        m.insert("quarter_end_flow", self.quarter_end_flow);
        m.insert("overconfidence_flag", self.overconfidence_flag);
        m.insert("confirmation_bias_risk", self.confirmation_bias_risk);
        m.insert("availability_bias_score", self.availability_bias_score);
        m.insert("hindsight_trap_flag", self.hindsight_trap_flag);
        m.insert("psychological_state_score", self.psychological_state_score);
        m.insert("structural_bias_score", self.structural_bias_score);
        m.insert("temporal_bias_score", self.temporal_bias_score);
        m.insert("meta_cognition_score", self.meta_cognition_score);
        m
    }
}

/// Streaming bias engine. All state is session- or outcome-scoped.
#[derive(Debug)]
pub struct BiasSignalEngine {
    session_open: Option<f64>,
    prev_session_close: Option<f64>,
    closes: RingBuf,
    ranges: RingBuf,
    /// Rolling recent trade outcomes (PnL), newest last.
    recent_outcomes: Vec<f64>,
    first_hour_extreme: Option<f64>,
    first_hour_drive_up: bool,
}

impl BiasSignalEngine {
    pub fn new() -> Self {
        Self {
            session_open: None,
            prev_session_close: None,
            closes: RingBuf::new(30),
            ranges: RingBuf::new(30),
            recent_outcomes: Vec::new(),
            first_hour_extreme: None,
            first_hour_drive_up: true,
        }
    }

    pub fn set_session_open(&mut self, price: f64) {
        self.session_open = Some(price);
    }

    pub fn set_prev_close(&mut self, price: f64) {
        self.prev_session_close = Some(price);
    }

    /// Record a closed trade's PnL for the meta-cognition flags.
    pub fn record_trade_outcome(&mut self, pnl_usd: f64) {
        self.recent_outcomes.push(pnl_usd);
        if self.recent_outcomes.len() > 10 {
            self.recent_outcomes.remove(0);
        }
    }

    pub fn reset_session(&mut self) {
        self.session_open = None;
        self.first_hour_extreme = None;
        self.first_hour_drive_up = true;
    }

    pub fn compute(&mut self, ts: DateTime<Utc>, inputs: &BiasInputs) -> BiasSignalOutput {
        self.closes.push(inputs.close);
        self.ranges.push(inputs.high - inputs.low);
        if self.session_open.is_none() && inputs.session_phase.in_rth() {
            self.session_open = Some(inputs.close);
        }
        if inputs.session_phase == SessionPhase::Opening {
            let extreme = self.first_hour_extreme.get_or_insert(inputs.close);
            if inputs.close > *extreme {
                *extreme = inputs.close;
                self.first_hour_drive_up = true;
            } else if inputs.close < *extreme {
                self.first_hour_drive_up = false;
            }
        }

        let trend = inputs.hhll_trend_strength.unwrap_or(0.0);
        let micro = inputs.micro_trend_5.unwrap_or(0.0);
        let vol_z = inputs.vol_z.unwrap_or(0.0);
        let compression = inputs.range_compression.unwrap_or(1.0);
        let climax = inputs.climax_bar_flag.unwrap_or(0.0);

        // --- Psychological state ---

        // FOMO: strong extended trend + volume surge while flat.
        let fomo_index = if inputs.net_position == 0 {
            clamp01(0.5 * trend.abs() + 0.3 * clamp01(vol_z / 3.0) + 0.2 * micro.abs())
        } else {
            0.0
        };

        // Panic: sharp down drive on climactic volume.
        let panic_index = if micro < 0.0 {
            clamp01(0.5 * (-micro) + 0.3 * climax + 0.2 * clamp01(vol_z / 3.0))
        } else {
            0.0
        };

        // Herding: trend and volume pointing the same way.
        let herding_score = clamp01(trend.abs() * clamp01((vol_z + 1.0) / 3.0));

        // Greed: extended move with shrinking ranges (chasing into thin air).
        let greed_index = if trend > 0.5 {
            clamp01(trend * (2.0 - compression) / 2.0)
        } else {
            0.0
        };

        // Fear: quiet tape after losses.
        let recent_losses = self
            .recent_outcomes
            .iter()
            .rev()
            .take(3)
            .filter(|&&p| p < 0.0)
            .count();
        let fear_index = clamp01(0.3 * recent_losses as f64 / 3.0 + 0.3 * clamp01(-vol_z / 2.0));

        // Euphoria: climax volume on a trend extreme.
        let euphoria_flag = clamp01(climax * clamp01(trend.abs() + micro.abs()));

        // --- Structural biases ---

        let round_number_proximity = Self::round_number_proximity(inputs.close);
        let gamma_exposure_proxy = Self::gamma_proxy(ts, round_number_proximity);
        let anchoring_level_distance = self.anchoring_distance(inputs.close);
        let recency_bias_score = self.recency_bias();
        let overnight_gap_bias = self.overnight_gap_bias(inputs.close);
        let opening_drive_exhaustion =
            self.opening_drive_exhaustion(inputs.session_phase, micro, vol_z);

        // --- Temporal biases ---

        let time_of_day_edge = Self::time_of_day_edge(inputs.session_phase);
        let day_of_week_edge = Self::day_of_week_edge(ts);
        let pre_event_compression = if compression < 0.6 {
            0.8
        } else if compression < 0.85 {
            0.5
        } else {
            0.0
        };
        let post_event_expansion = if compression > 1.6 && vol_z > 1.0 {
            0.9
        } else if compression > 1.3 {
            0.5
        } else {
            0.0
        };
        let month_end_flow = Self::month_end_flow(ts);
        let quarter_end_flow = Self::quarter_end_flow(ts);

        // --- Meta-cognition ---

        let recent_wins = self
            .recent_outcomes
            .iter()
            .rev()
            .take(5)
            .filter(|&&p| p > 0.0)
            .count();
        let overconfidence_flag = match recent_wins {
            5 => 0.9,
            4 => 0.6,
            3 => 0.3,
            _ => 0.0,
        };
        // Seeking confirming signals: streaks either way raise the risk.
        let streak = recent_wins.max(
            self.recent_outcomes
                .iter()
                .rev()
                .take(5)
                .filter(|&&p| p < 0.0)
                .count(),
        );
        let confirmation_bias_risk = clamp01(streak as f64 / 5.0 * 0.8);
        // Memorable extremes dominate judgment after climactic bars.
        let availability_bias_score = clamp01(0.5 * climax + 0.3 * clamp01(vol_z.abs() / 3.0));
        // Clean trends look obvious in hindsight.
        let hindsight_trap_flag = clamp01(trend.abs() * 0.7 + micro.abs() * 0.3);

        // --- Aggregates ---

        let psychological_state_score = clamp01(
            1.0 - (fomo_index + panic_index + greed_index + fear_index + euphoria_flag) / 5.0,
        );
        let structural_bias_score = clamp01(
            (round_number_proximity
                + gamma_exposure_proxy
                + anchoring_level_distance
                + overnight_gap_bias)
                / 4.0,
        );
        let temporal_bias_score = clamp01((time_of_day_edge + day_of_week_edge) / 2.0);
        let meta_cognition_score = clamp01(
            1.0 - (overconfidence_flag + confirmation_bias_risk + hindsight_trap_flag) / 3.0,
        );

        BiasSignalOutput {
            fomo_index,
            panic_index,
            herding_score,
            greed_index,
            fear_index,
            euphoria_flag,
            round_number_proximity,
            gamma_exposure_proxy,
            anchoring_level_distance,
            recency_bias_score,
            overnight_gap_bias,
            opening_drive_exhaustion,
            time_of_day_edge,
            day_of_week_edge,
            pre_event_compression,
            post_event_expansion,
            month_end_flow,
            quarter_end_flow,
            overconfidence_flag,
            confirmation_bias_risk,
            availability_bias_score,
            hindsight_trap_flag,
            psychological_state_score,
            structural_bias_score,
            temporal_bias_score,
            meta_cognition_score,
            timestamp: ts,
        }
    }

    /// Proximity to the $25 / $50 / $100 grids. 1.0 on the level, fading
    /// within ±5 points.
    fn round_number_proximity(close: f64) -> f64 {
        let mut best: f64 = 0.0;
        for grid in [25.0, 50.0, 100.0] {
            let dist = (close / grid - (close / grid).round()).abs() * grid;
            best = best.max(clamp01(1.0 - dist / 5.0));
        }
        best
    }

    /// Options pinning proxy: strongest near round levels on Fridays.
    fn gamma_proxy(ts: DateTime<Utc>, round_proximity: f64) -> f64 {
        let weekday = ts.with_timezone(&New_York).weekday();
        if weekday == chrono::Weekday::Fri {
            clamp01(round_proximity * 0.8 + 0.2)
        } else {
            clamp01(round_proximity * 0.4)
        }
    }

    /// Proximity to the session open and previous close anchors.
    fn anchoring_distance(&self, close: f64) -> f64 {
        let mut best: f64 = 0.5;
        for anchor in [self.session_open, self.prev_session_close]
            .into_iter()
            .flatten()
        {
            let dist = (close - anchor).abs();
            best = best.max(clamp01(1.0 - dist / 10.0));
        }
        best
    }

    /// Recent-move overweighting: last 5 closes moving much more than the
    /// prior 25.
    fn recency_bias(&self) -> f64 {
        if self.closes.len() < 30 {
            return 0.5;
        }
        let all: Vec<f64> = self.closes.iter().collect();
        let older = &all[..25];
        let recent = &all[25..];
        let recent_move: f64 = recent.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        let older_move: f64 =
            older.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / 24.0 * 4.0;
        if older_move == 0.0 {
            return 0.5;
        }
        clamp01(recent_move / older_move - 0.5)
    }

    /// Gap-fill tendency rises with gap size against the previous close.
    fn overnight_gap_bias(&self, close: f64) -> f64 {
        let Some(prev) = self.prev_session_close else {
            return 0.0;
        };
        let gap = (close - prev).abs();
        if gap < 2.0 {
            0.0
        } else if gap < 5.0 {
            0.3
        } else if gap < 10.0 {
            0.6
        } else {
            0.8
        }
    }

    /// First-hour drive running out of participation.
    fn opening_drive_exhaustion(&self, phase: SessionPhase, micro: f64, vol_z: f64) -> f64 {
        if phase != SessionPhase::Opening {
            return 0.0;
        }
        let drive_dir = if self.first_hour_drive_up { 1.0 } else { -1.0 };
        // Momentum stalling against the drive on fading volume.
        clamp01(0.6 * clamp01(-micro * drive_dir) + 0.4 * clamp01(-vol_z / 2.0))
    }

    fn time_of_day_edge(phase: SessionPhase) -> f64 {
        match phase {
            SessionPhase::MidMorning => 0.8,
            SessionPhase::Afternoon => 0.75,
            SessionPhase::Opening => 0.5,
            SessionPhase::Close => 0.6,
            SessionPhase::Lunch => 0.2,
            SessionPhase::PreMarket | SessionPhase::PostRth => 0.4,
        }
    }

    fn day_of_week_edge(ts: DateTime<Utc>) -> f64 {
        use chrono::Weekday::*;
        match ts.with_timezone(&New_York).weekday() {
            Tue => 0.7,
            Wed => 0.65,
            Thu => 0.6,
            Mon => 0.5,
            Fri => 0.45,
            _ => 0.3,
        }
    }

    fn month_end_flow(ts: DateTime<Utc>) -> f64 {
        let local = ts.with_timezone(&New_York);
        let day = local.day();
        let last = Self::days_in_month(local.year(), local.month());
        if day >= last - 1 {
            0.7
        } else if day >= last - 3 {
            0.3
        } else {
            0.0
        }
    }

    fn quarter_end_flow(ts: DateTime<Utc>) -> f64 {
        let local = ts.with_timezone(&New_York);
        let month = local.month();
        if !matches!(month, 3 | 6 | 9 | 12) {
            return 0.0;
        }
        let day = local.day();
        let last = Self::days_in_month(local.year(), month);
        if day >= last - 1 {
            0.8
        } else if day >= last - 4 {
            0.4
        } else {
            0.0
        }
    }

    fn days_in_month(year: i32, month: u32) -> u32 {
        match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 => {
                if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                    29
                } else {
                    28
                }
            }
            _ => 30,
        }
    }
}

impl Default for BiasSignalEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ny(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn inputs(close: f64, phase: SessionPhase) -> BiasInputs {
        BiasInputs {
            close,
            high: close + 0.5,
            low: close - 0.5,
            volume: 1000.0,
            session_phase: phase,
            ..Default::default()
        }
    }

    #[test]
    fn test_round_number_proximity_grid() {
        assert_eq!(BiasSignalEngine::round_number_proximity(5600.0), 1.0);
        assert!(BiasSignalEngine::round_number_proximity(5612.5) < 0.1);
        let near = BiasSignalEngine::round_number_proximity(5601.0);
        assert!((0.7..1.0).contains(&near), "got {near}");
    }

    #[test]
    fn test_gamma_proxy_stronger_on_friday() {
        let friday = ny(2025, 3, 14, 10, 0);
        let monday = ny(2025, 3, 10, 10, 0);
        assert!(
            BiasSignalEngine::gamma_proxy(friday, 1.0) > BiasSignalEngine::gamma_proxy(monday, 1.0)
        );
    }

    #[test]
    fn test_quarter_end_flow_only_quarter_months() {
        assert!(BiasSignalEngine::quarter_end_flow(ny(2025, 3, 31, 10, 0)) > 0.0);
        assert_eq!(BiasSignalEngine::quarter_end_flow(ny(2025, 4, 30, 10, 0)), 0.0);
    }

    #[test]
    fn test_fomo_requires_flat_position() {
        let mut engine = BiasSignalEngine::new();
        let mut flat = inputs(5600.0, SessionPhase::MidMorning);
        flat.hhll_trend_strength = Some(0.9);
        flat.vol_z = Some(2.5);
        flat.micro_trend_5 = Some(1.0);
        let out = engine.compute(ny(2025, 3, 11, 10, 45), &flat);
        assert!(out.fomo_index > 0.5);

        let mut positioned = flat;
        positioned.net_position = 1;
        let out = engine.compute(ny(2025, 3, 11, 10, 46), &positioned);
        assert_eq!(out.fomo_index, 0.0);
    }

    #[test]
    fn test_overconfidence_after_win_streak() {
        let mut engine = BiasSignalEngine::new();
        for _ in 0..5 {
            engine.record_trade_outcome(25.0);
        }
        let out = engine.compute(ny(2025, 3, 11, 11, 0), &inputs(5600.0, SessionPhase::MidMorning));
        assert_eq!(out.overconfidence_flag, 0.9);
        assert!(out.meta_cognition_score < 0.6);
    }

    #[test]
    fn test_all_outputs_bounded() {
        let mut engine = BiasSignalEngine::new();
        engine.set_prev_close(5590.0);
        engine.record_trade_outcome(-30.0);
        engine.record_trade_outcome(40.0);
        let mut inp = inputs(5603.25, SessionPhase::Opening);
        inp.vol_z = Some(3.0);
        inp.hhll_trend_strength = Some(-1.0);
        inp.micro_trend_5 = Some(-1.0);
        inp.climax_bar_flag = Some(1.0);
        inp.range_compression = Some(1.9);
        let out = engine.compute(ny(2025, 3, 28, 9, 45), &inp);
        for (name, value) in out.as_map() {
            assert!(
                (0.0..=1.0).contains(&value),
                "{name} out of bounds: {value}"
            );
        }
    }
}
