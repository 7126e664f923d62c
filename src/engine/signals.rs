//! Core Signal Engine
//!
//! Derives the 28 core features from the bar stream. Every feature is
//! bounded and `Option`-valued: `None` means the warm-up window for that
//! feature has not filled yet. Floating-point folds run in a fixed order so
//! replays are bit-identical.
//!
//! Session-scoped state (VWAP accumulators, opening range) resets on the
//! first in-RTH bar of a new date. ATR state persists across sessions; the
//! reference ATR for normalization anchors on the first completed ATR(14).

use crate::engine::bars::Bar;
use crate::engine::numeric::{ols_slope, true_range, RingBuf, WilderAtr};
use crate::engine::session::{self, SessionPhase};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const LOOKBACK_PRICES: usize = 30;
const LOOKBACK_VOL: usize = 20;

/// Reliability metadata attached to every signal record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalReliability {
    pub dvs_ok: bool,
    pub eqs_ok: bool,
    pub session_ok: bool,
    pub overall_score: f64,
}

/// The full fixed-schema record of core features for one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalOutput {
    // Price structure & volatility (12)
    pub vwap_z: Option<f64>,
    pub vwap_slope: Option<f64>,
    pub atr_14_n: Option<f64>,
    pub range_compression: Option<f64>,
    pub hhll_trend_strength: Option<f64>,
    pub breakout_distance_n: Option<f64>,
    pub rejection_wick_n: Option<f64>,
    pub close_location_value: Option<f64>,
    pub gap_from_prev_close_n: Option<f64>,
    pub distance_from_poc_proxy: Option<f64>,
    pub micro_trend_5: Option<f64>,
    pub real_body_impulse_n: Option<f64>,

    // Volume & participation (8)
    pub vol_z: Option<f64>,
    pub vol_slope_20: Option<f64>,
    pub effort_vs_result: Option<f64>,
    pub range_expansion_on_volume: Option<f64>,
    pub climax_bar_flag: Option<f64>,
    pub quiet_bar_flag: Option<f64>,
    pub consecutive_high_vol_bars: Option<f64>,
    pub participation_expansion_index: Option<f64>,

    // Session context (4)
    pub session_phase: SessionPhase,
    pub opening_range_break: Option<f64>,
    pub lunch_void_gate: f64,
    pub close_magnet_index: Option<f64>,

    // Quality & cost (3)
    pub spread_proxy_tickiness: Option<f64>,
    pub slippage_risk_proxy: Option<f64>,
    pub friction_regime_index: Option<f64>,

    /// Computed by the quality scorer, carried for downstream consumers.
    pub dvs: f64,

    pub reliability: SignalReliability,
    pub timestamp: DateTime<Utc>,
}

impl SignalOutput {
    /// Flat name → value view over the known (non-`None`) features, used by
    /// the belief evidence fold. Keys are stable and sorted.
    pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
        let mut m = BTreeMap::new();
        let mut put = |k: &'static str, v: Option<f64>| {
            if let Some(v) = v {
                m.insert(k, v);
            }
        };
        put("vwap_z", self.vwap_z);
        // Derived magnitude for the mean-reversion hypothesis; direction is
        // bound at decision time from the signed value.
        put("vwap_stretch", self.vwap_z.map(f64::abs));
        put("vwap_slope", self.vwap_slope);
        put("atr_14_n", self.atr_14_n);
        put("range_compression", self.range_compression);
        put("hhll_trend_strength", self.hhll_trend_strength);
        put("breakout_distance_n", self.breakout_distance_n);
        put("rejection_wick_n", self.rejection_wick_n);
        put("close_location_value", self.close_location_value);
        put("gap_from_prev_close_n", self.gap_from_prev_close_n);
        put("distance_from_poc_proxy", self.distance_from_poc_proxy);
        put("micro_trend_5", self.micro_trend_5);
        put("real_body_impulse_n", self.real_body_impulse_n);
        put("vol_z", self.vol_z);
        put("vol_slope_20", self.vol_slope_20);
        put("effort_vs_result", self.effort_vs_result);
        put("range_expansion_on_volume", self.range_expansion_on_volume);
        put("climax_bar_flag", self.climax_bar_flag);
        put("quiet_bar_flag", self.quiet_bar_flag);
        put("consecutive_high_vol_bars", self.consecutive_high_vol_bars);
        put(
            "participation_expansion_index",
            self.participation_expansion_index,
        );
        put("opening_range_break", self.opening_range_break);
        put("lunch_void_gate", Some(self.lunch_void_gate));
        put("close_magnet_index", self.close_magnet_index);
        put("spread_proxy_tickiness", self.spread_proxy_tickiness);
        put("slippage_risk_proxy", self.slippage_risk_proxy);
        put("friction_regime_index", self.friction_regime_index);
        put("dvs", Some(self.dvs));
        m
    }
}

/// Streaming engine holding all rolling state.
#[derive(Debug)]
pub struct SignalEngine {
    tick_size: f64,

    // VWAP state, session-scoped
    vwap_sum_pv: f64,
    vwap_sum_v: f64,
    last_rth_date: Option<NaiveDate>,
    vwap_history: RingBuf,

    // Rolling price/volume history
    closes: RingBuf,
    highs: RingBuf,
    lows: RingBuf,
    typical_prices: RingBuf,
    volumes: RingBuf,
    close_history_5: RingBuf,

    // ATR, persists across sessions
    atr14: WilderAtr,
    atr30: WilderAtr,
    prior_close: Option<f64>,
    reference_atr: Option<f64>,

    // Opening range, session-scoped
    opening_range_high: Option<f64>,
    opening_range_low: Option<f64>,
    opening_range_set: bool,

    consecutive_high_vol_count: u32,
}

impl SignalEngine {
    pub fn new(tick_size: f64) -> Self {
        Self {
            tick_size,
            vwap_sum_pv: 0.0,
            vwap_sum_v: 0.0,
            last_rth_date: None,
            vwap_history: RingBuf::new(5),
            closes: RingBuf::new(LOOKBACK_PRICES),
            highs: RingBuf::new(LOOKBACK_PRICES),
            lows: RingBuf::new(LOOKBACK_PRICES),
            typical_prices: RingBuf::new(LOOKBACK_PRICES),
            volumes: RingBuf::new(LOOKBACK_VOL),
            close_history_5: RingBuf::new(5),
            atr14: WilderAtr::new(14),
            atr30: WilderAtr::new(30),
            prior_close: None,
            reference_atr: None,
            opening_range_high: None,
            opening_range_low: None,
            opening_range_set: false,
            consecutive_high_vol_count: 0,
        }
    }

    /// Current ATR(14) in price points. First-class value for the decision
    /// and in-trade paths; the normalized feature is derived from it.
    #[inline]
    pub fn atr_14(&self) -> Option<f64> {
        self.atr14.value()
    }

    #[inline]
    pub fn atr_30(&self) -> Option<f64> {
        self.atr30.value()
    }

    /// Compute all features for one bar. `dvs`/`eqs` come from the quality
    /// scorers and only feed reliability and the dvs passthrough.
    pub fn compute(&mut self, bar: &Bar, dvs: f64, eqs: f64) -> SignalOutput {
        let ts = bar.timestamp;
        let phase = SessionPhase::of(ts);

        let open = bar.open.to_f64(self.tick_size);
        let high = bar.high.to_f64(self.tick_size);
        let low = bar.low.to_f64(self.tick_size);
        let close = bar.close.to_f64(self.tick_size);
        let volume = bar.volume as f64;

        // Gap uses the close before this bar; capture before ATR updates it.
        let prev_close = self.prior_close;

        self.update_history(high, low, close, volume);

        let vwap = self.update_vwap(ts, high, low, close, volume);
        let vwap_z = self.compute_vwap_z(close, vwap);
        let vwap_slope = self.compute_vwap_slope();

        // Both ATRs share the same TR, computed once.
        let tr = true_range(high, low, prev_close);
        let atr14 = self.atr14.update(tr);
        let _atr30 = self.atr30.update(tr);
        if self.reference_atr.is_none() {
            self.reference_atr = atr14;
        }
        self.prior_close = Some(close);

        let atr_14_n = self.normalize_atr(atr14);
        let range_compression = self.compute_range_compression(high, low);
        let hhll_trend_strength = self.compute_hhll_trend_strength();
        let breakout_distance_n = self.compute_breakout_distance_n(high, low, atr14);
        let rejection_wick_n = self.compute_rejection_wick_n(open, high, low, close, atr14);
        let close_location_value = Self::compute_close_location_value(high, low, close);
        let gap_from_prev_close_n = self.compute_gap_n(open, prev_close, atr14);
        let distance_from_poc_proxy = self.compute_poc_distance(close, atr14);
        let micro_trend_5 = self.compute_micro_trend_5();
        let real_body_impulse_n = self.compute_real_body_impulse_n(open, close);

        let vol_z = self.compute_vol_z(volume);
        let vol_slope_20 = self.compute_vol_slope_20();
        let effort_vs_result = self.compute_effort_vs_result(volume, high, low);
        let range_expansion_on_volume = self.compute_range_expansion_on_volume(volume, high, low);
        let climax_bar_flag = vol_z.map(|z| if z > 2.5 { 1.0 } else { 0.0 });
        let quiet_bar_flag = vol_z.map(|z| if z < -1.5 { 1.0 } else { 0.0 });
        let consecutive_high_vol_bars = self.compute_consecutive_high_vol(volume);
        let participation_expansion_index =
            self.compute_participation_expansion(volume, high, low);

        let opening_range_break = self.compute_opening_range_break(high, low, close, phase);
        let lunch_void_gate = if phase == SessionPhase::Lunch { 0.0 } else { 1.0 };
        let close_magnet_index = Some(Self::compute_close_magnet(ts));

        let spread_proxy_tickiness = self.compute_spread_proxy(bar);
        let slippage_risk_proxy = self.compute_slippage_risk_proxy(volume, atr14);
        let friction_regime_index =
            self.compute_friction_regime(spread_proxy_tickiness, slippage_risk_proxy, atr14);

        let reliability = Self::compute_reliability(dvs, eqs, phase);

        SignalOutput {
            vwap_z,
            vwap_slope,
            atr_14_n,
            range_compression,
            hhll_trend_strength,
            breakout_distance_n,
            rejection_wick_n,
            close_location_value,
            gap_from_prev_close_n,
            distance_from_poc_proxy,
            micro_trend_5,
            real_body_impulse_n,
            vol_z,
            vol_slope_20,
            effort_vs_result,
            range_expansion_on_volume,
            climax_bar_flag,
            quiet_bar_flag,
            consecutive_high_vol_bars,
            participation_expansion_index,
            session_phase: phase,
            opening_range_break,
            lunch_void_gate,
            close_magnet_index,
            spread_proxy_tickiness,
            slippage_risk_proxy,
            friction_regime_index,
            dvs,
            reliability,
            timestamp: ts,
        }
    }

    /// Reset session-scoped state. Called by the orchestrator at session
    /// boundaries; ATR state deliberately survives.
    pub fn reset_session_state(&mut self) {
        self.vwap_sum_pv = 0.0;
        self.vwap_sum_v = 0.0;
        self.last_rth_date = None;
        self.vwap_history.clear();
        self.opening_range_high = None;
        self.opening_range_low = None;
        self.opening_range_set = false;
        self.consecutive_high_vol_count = 0;
    }

    fn update_history(&mut self, high: f64, low: f64, close: f64, volume: f64) {
        self.closes.push(close);
        self.highs.push(high);
        self.lows.push(low);
        self.typical_prices.push((high + low + close) / 3.0);
        self.volumes.push(volume);
        self.close_history_5.push(close);
    }

    fn update_vwap(
        &mut self,
        ts: DateTime<Utc>,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Option<f64> {
        if !session::in_rth(ts) {
            return None;
        }
        let date = session::session_date(ts);
        if self.last_rth_date != Some(date) {
            self.vwap_sum_pv = 0.0;
            self.vwap_sum_v = 0.0;
            self.last_rth_date = Some(date);
            self.opening_range_high = None;
            self.opening_range_low = None;
            self.opening_range_set = false;
        }
        let typical = (high + low + close) / 3.0;
        self.vwap_sum_pv += typical * volume;
        self.vwap_sum_v += volume;
        if self.vwap_sum_v == 0.0 {
            return None;
        }
        let vwap = self.vwap_sum_pv / self.vwap_sum_v;
        self.vwap_history.push(vwap);
        Some(vwap)
    }

    fn compute_vwap_z(&self, close: f64, vwap: Option<f64>) -> Option<f64> {
        let vwap = vwap?;
        let atr = self.atr14.value()?;
        if atr <= 0.0 {
            return Some(0.0);
        }
        Some(((close - vwap) / atr).clamp(-3.0, 3.0))
    }

    fn compute_vwap_slope(&self) -> Option<f64> {
        if self.vwap_history.len() < 5 {
            return None;
        }
        let slope = ols_slope(self.vwap_history.iter())?;
        Some((slope / self.tick_size).clamp(-1.0, 1.0))
    }

    fn normalize_atr(&self, atr14: Option<f64>) -> Option<f64> {
        let atr = atr14?;
        let reference = self.reference_atr?;
        if reference <= 0.0 {
            return None;
        }
        Some((atr / reference).clamp(0.0, 2.0))
    }

    fn mean_range_10(&self) -> Option<f64> {
        if self.highs.len() < 10 {
            return None;
        }
        let sum: f64 = self
            .highs
            .tail(10)
            .zip(self.lows.tail(10))
            .map(|(h, l)| h - l)
            .sum();
        Some(sum / 10.0)
    }

    fn compute_range_compression(&self, high: f64, low: f64) -> Option<f64> {
        let avg_range = self.mean_range_10()?;
        if avg_range == 0.0 {
            return Some(0.0);
        }
        Some(((high - low) / avg_range).clamp(0.0, 2.0))
    }

    fn compute_hhll_trend_strength(&self) -> Option<f64> {
        if self.highs.len() < 10 || self.lows.len() < 10 {
            return None;
        }
        let highs: Vec<f64> = self.highs.tail(10).collect();
        let lows: Vec<f64> = self.lows.tail(10).collect();
        let hh = (1..10).filter(|&i| highs[i] > highs[i - 1]).count() as f64;
        let ll = (1..10).filter(|&i| lows[i] < lows[i - 1]).count() as f64;
        Some(((hh - ll) / 9.0).clamp(-1.0, 1.0))
    }

    fn compute_breakout_distance_n(
        &self,
        high: f64,
        low: f64,
        atr14: Option<f64>,
    ) -> Option<f64> {
        if self.highs.len() < 20 {
            return None;
        }
        let atr = atr14?;
        if atr <= 0.0 {
            return None;
        }
        let recent_high = self.highs.max()?;
        let recent_low = self.lows.min()?;
        let distance = if high > recent_high {
            high - recent_high
        } else if low < recent_low {
            low - recent_low
        } else {
            0.0
        };
        Some((distance / atr).clamp(-2.0, 2.0))
    }

    fn compute_rejection_wick_n(
        &self,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        atr14: Option<f64>,
    ) -> Option<f64> {
        let atr = atr14?;
        if atr <= 0.0 {
            return None;
        }
        let body = (close - open).abs();
        let upper_wick = high - open.max(close);
        let lower_wick = open.min(close) - low;
        let max_wick = upper_wick.max(lower_wick);
        let rejection = if body == 0.0 {
            max_wick / atr
        } else {
            (max_wick - body) / atr
        };
        Some(rejection.clamp(-1.0, 1.0))
    }

    fn compute_close_location_value(high: f64, low: f64, close: f64) -> Option<f64> {
        let range = high - low;
        if range == 0.0 {
            return Some(0.5);
        }
        Some(((close - low) / range).clamp(0.0, 1.0))
    }

    fn compute_gap_n(&self, open: f64, prev_close: Option<f64>, atr14: Option<f64>) -> Option<f64> {
        let prev = prev_close?;
        let atr = atr14?;
        if atr <= 0.0 {
            return None;
        }
        Some(((open - prev) / atr).clamp(-2.0, 2.0))
    }

    fn compute_poc_distance(&self, close: f64, atr14: Option<f64>) -> Option<f64> {
        if self.typical_prices.len() < 20 {
            return None;
        }
        let atr = atr14?;
        if atr <= 0.0 {
            return None;
        }
        let median = self.typical_prices.median()?;
        Some(((close - median) / atr).clamp(-2.0, 2.0))
    }

    fn compute_micro_trend_5(&self) -> Option<f64> {
        if self.close_history_5.len() < 5 {
            return None;
        }
        let closes: Vec<f64> = self.close_history_5.iter().collect();
        let up = (1..5).filter(|&i| closes[i] > closes[i - 1]).count() as f64;
        Some(((up - 2.0) / 2.0).clamp(-1.0, 1.0))
    }

    fn compute_real_body_impulse_n(&self, open: f64, close: f64) -> Option<f64> {
        if self.closes.len() < 11 {
            return None;
        }
        let current_body = (close - open).abs();
        let closes: Vec<f64> = self.closes.tail(11).collect();
        let bodies: Vec<f64> = (1..closes.len())
            .map(|i| (closes[i] - closes[i - 1]).abs())
            .collect();
        let avg: f64 = bodies.iter().sum::<f64>() / bodies.len() as f64;
        if avg == 0.0 {
            return Some(0.0);
        }
        Some((current_body / avg).clamp(0.0, 3.0))
    }

    fn vol_mean_std(&self) -> Option<(f64, f64)> {
        if self.volumes.len() < 20 {
            return None;
        }
        Some((self.volumes.mean()?, self.volumes.std()?))
    }

    fn compute_vol_z(&self, volume: f64) -> Option<f64> {
        let (mean, std) = self.vol_mean_std()?;
        if std == 0.0 {
            return Some(0.0);
        }
        Some(((volume - mean) / std).clamp(-3.0, 3.0))
    }

    fn compute_vol_slope_20(&self) -> Option<f64> {
        if self.volumes.len() < 20 {
            return None;
        }
        let mean = self.volumes.mean()?;
        if mean == 0.0 {
            return Some(0.0);
        }
        let slope = ols_slope(self.volumes.iter())?;
        Some((slope / mean).clamp(-1.0, 1.0))
    }

    fn compute_effort_vs_result(&self, volume: f64, high: f64, low: f64) -> Option<f64> {
        if self.volumes.len() < 10 {
            return None;
        }
        let range = high - low;
        if range == 0.0 {
            return Some(0.0);
        }
        let avg_vol = self.volumes.mean()?;
        if avg_vol == 0.0 {
            return Some(0.0);
        }
        let avg_range = self.mean_range_10()?;
        if avg_range == 0.0 {
            return Some(0.0);
        }
        Some((volume / avg_vol - range / avg_range).clamp(-1.0, 1.0))
    }

    fn compute_range_expansion_on_volume(
        &self,
        volume: f64,
        high: f64,
        low: f64,
    ) -> Option<f64> {
        if self.volumes.len() < 10 || self.highs.len() < 10 {
            return None;
        }
        let avg_range = self.mean_range_10()?;
        let avg_vol = self.volumes.mean()?;
        if avg_range == 0.0 || avg_vol == 0.0 {
            return Some(0.0);
        }
        let range_ratio = (high - low) / avg_range;
        let vol_ratio = volume / avg_vol;
        Some((range_ratio * vol_ratio - 1.0).clamp(-1.0, 2.0))
    }

    fn compute_consecutive_high_vol(&mut self, volume: f64) -> Option<f64> {
        if self.volumes.len() < 10 {
            return None;
        }
        let avg = self.volumes.mean()?;
        if volume > avg * 1.5 {
            self.consecutive_high_vol_count += 1;
        } else {
            self.consecutive_high_vol_count = 0;
        }
        // Saturates at 5 bars.
        Some((self.consecutive_high_vol_count as f64 / 5.0).min(1.0))
    }

    fn compute_participation_expansion(
        &self,
        volume: f64,
        high: f64,
        low: f64,
    ) -> Option<f64> {
        if self.volumes.len() < 10 || self.highs.len() < 10 {
            return None;
        }
        let avg_vol = self.volumes.mean()?;
        let avg_range = self.mean_range_10()?;
        if avg_vol == 0.0 || avg_range == 0.0 {
            return Some(0.0);
        }
        let vol_expansion = volume / avg_vol - 1.0;
        let range_expansion = (high - low) / avg_range - 1.0;
        Some((vol_expansion * range_expansion).clamp(-1.0, 2.0))
    }

    fn compute_opening_range_break(
        &mut self,
        high: f64,
        low: f64,
        close: f64,
        phase: SessionPhase,
    ) -> Option<f64> {
        if phase == SessionPhase::Opening {
            match (self.opening_range_high, self.opening_range_low) {
                (Some(h), Some(l)) => {
                    self.opening_range_high = Some(h.max(high));
                    self.opening_range_low = Some(l.min(low));
                }
                _ => {
                    self.opening_range_high = Some(high);
                    self.opening_range_low = Some(low);
                }
            }
            self.opening_range_set = false;
            return Some(0.0);
        }
        if phase > SessionPhase::Opening && !self.opening_range_set {
            self.opening_range_set = true;
        }
        let (Some(or_high), Some(or_low)) = (self.opening_range_high, self.opening_range_low)
        else {
            return Some(0.0);
        };
        if !self.opening_range_set {
            return Some(0.0);
        }
        if close > or_high {
            Some(1.0)
        } else if close < or_low {
            Some(-1.0)
        } else {
            Some(0.0)
        }
    }

    fn compute_close_magnet(ts: DateTime<Utc>) -> f64 {
        let minutes = session::minutes_to_close(ts);
        if minutes <= 0 || minutes > 30 {
            return 0.0;
        }
        (1.0 - minutes as f64 / 30.0).clamp(0.0, 1.0)
    }

    fn compute_spread_proxy(&self, bar: &Bar) -> Option<f64> {
        let spread = bar.spread_ticks()? as f64;
        if spread <= 1.0 {
            Some(1.0)
        } else if spread >= 3.0 {
            Some(0.0)
        } else {
            Some(1.0 - (spread - 1.0) / 2.0)
        }
    }

    fn compute_slippage_risk_proxy(&self, volume: f64, atr14: Option<f64>) -> Option<f64> {
        if self.volumes.len() < 20 {
            return None;
        }
        let atr = atr14?;
        if atr <= 0.0 {
            return None;
        }
        let avg_vol = self.volumes.mean()?;
        let vol_ratio = if avg_vol > 0.0 { volume / avg_vol } else { 1.0 };
        let atr_ratio = match self.reference_atr {
            Some(r) if r > 0.0 => atr / r,
            _ => 1.0,
        };
        let risk = if vol_ratio > 0.0 {
            atr_ratio / vol_ratio
        } else {
            atr_ratio
        };
        // Inverted so higher = better execution odds.
        Some(1.0 - (risk / 2.0).min(1.0))
    }

    fn compute_friction_regime(
        &self,
        spread_proxy: Option<f64>,
        slippage_proxy: Option<f64>,
        atr14: Option<f64>,
    ) -> Option<f64> {
        let spread = spread_proxy?;
        let slippage = slippage_proxy?;
        let avg_quality = (spread + slippage) / 2.0;
        let friction = match (atr14, self.reference_atr) {
            (Some(atr), Some(r)) if r > 0.0 => avg_quality / (atr / r),
            _ => avg_quality,
        };
        Some(friction.clamp(0.0, 1.0))
    }

    fn compute_reliability(dvs: f64, eqs: f64, phase: SessionPhase) -> SignalReliability {
        let session_ok = !matches!(
            phase,
            SessionPhase::PreMarket | SessionPhase::Lunch | SessionPhase::PostRth
        );
        SignalReliability {
            dvs_ok: dvs >= 0.80,
            eqs_ok: eqs >= 0.75,
            session_ok,
            overall_score: dvs * 0.4 + eqs * 0.3 + if session_ok { 0.3 } else { 0.0 },
        }
    }
}
