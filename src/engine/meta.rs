//! Meta-Learning Layer
//!
//! Adjusts how the learning loop learns, never what it learns. Tracks
//! per-parameter confidence under the never-fully-confident invariants,
//! detects volatility and trend regimes, and freezes learning on
//! drawdown.
//!
//! Invariants:
//! - Confidence is hard-capped at 0.75 and floored at 0.25.
//! - Confidence decays toward neutral 0.5 by 0.02 per cycle without
//!   confirming evidence.
//! - Updates are symmetric: losses move confidence down exactly as fast as
//!   wins move it up. There is no winning-streak acceleration; the rate
//!   multiplier drops to 0.5 when rolling Sharpe is negative and never
//!   rises above 1.0.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Hard cap: never believe a parameter is fully right.
pub const MAX_CONFIDENCE: f64 = 0.75;
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;
pub const NEUTRAL_DECAY: f64 = 0.02;
/// Drawdown fraction of the equity peak that freezes learning.
pub const DRAWDOWN_FREEZE_THRESHOLD: f64 = 0.15;
const FREEZE_HOURS: i64 = 24;
const REGIME_CHANGE_RATE_MULT: f64 = 0.3;
const REGIME_CHANGE_CAUTION_BARS: u32 = 20;

/// Volatility regime from the EMA of sigma_norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolRegime {
    Low,
    Normal,
    High,
}

impl VolRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolRegime::Low => "LOW",
            VolRegime::Normal => "NORMAL",
            VolRegime::High => "HIGH",
        }
    }
}

/// Trend regime from a trend-strength heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendRegime {
    Trending,
    Neutral,
    Ranging,
}

impl TrendRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendRegime::Trending => "TRENDING",
            TrendRegime::Neutral => "NEUTRAL",
            TrendRegime::Ranging => "RANGING",
        }
    }
}

/// Per-parameter confidence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfidence {
    pub param_key: String,
    pub n_updates: u32,
    pub n_positive_outcomes: u32,
    pub n_negative_outcomes: u32,
    pub confidence: f64,
    pub bars_since_confirming: u32,
}

impl ParameterConfidence {
    fn new(param_key: String) -> Self {
        Self {
            param_key,
            n_updates: 0,
            n_positive_outcomes: 0,
            n_negative_outcomes: 0,
            confidence: NEUTRAL_CONFIDENCE,
            bars_since_confirming: 0,
        }
    }

    /// Symmetric update from one outcome.
    pub fn update(&mut self, outcome_pnl: f64) {
        self.n_updates += 1;
        if outcome_pnl > 0.0 {
            self.n_positive_outcomes += 1;
        } else {
            self.n_negative_outcomes += 1;
        }
        self.bars_since_confirming = 0;

        if self.n_updates >= 5 {
            let win_rate = self.n_positive_outcomes as f64 / self.n_updates as f64;
            // win_rate 0.5 → neutral; 1.0 → cap; 0.0 → floor. Same slope
            // both ways.
            self.confidence = NEUTRAL_CONFIDENCE + (win_rate - 0.5) * 0.5;
        } else {
            self.confidence = NEUTRAL_CONFIDENCE;
        }
        self.confidence = self
            .confidence
            .min(MAX_CONFIDENCE)
            .max(1.0 - MAX_CONFIDENCE);
    }

    /// Decay toward neutral absent confirming evidence.
    pub fn decay_toward_neutral(&mut self) {
        self.bars_since_confirming += 1;
        if self.confidence > NEUTRAL_CONFIDENCE {
            self.confidence = (self.confidence - NEUTRAL_DECAY).max(NEUTRAL_CONFIDENCE);
        } else if self.confidence < NEUTRAL_CONFIDENCE {
            self.confidence = (self.confidence + NEUTRAL_DECAY).min(NEUTRAL_CONFIDENCE);
        }
    }
}

/// Regime detection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub vol_regime: VolRegime,
    pub trend_regime: TrendRegime,
    /// EMA(20) of sigma_norm, alpha = 2/(20+1) rounded to 0.1.
    pub sigma_norm_ema: f64,
    pub bars_since_change: u32,
    pub trades_in_regime: u32,
    pub pnl_in_regime: f64,
}

impl Default for RegimeState {
    fn default() -> Self {
        Self {
            vol_regime: VolRegime::Normal,
            trend_regime: TrendRegime::Neutral,
            sigma_norm_ema: 1.0,
            bars_since_change: REGIME_CHANGE_CAUTION_BARS,
            trades_in_regime: 0,
            pnl_in_regime: 0.0,
        }
    }
}

/// Freeze state, orthogonal to the trading kill switch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FreezeState {
    pub frozen: bool,
    pub reason: Option<String>,
    pub until: Option<DateTime<Utc>>,
}

/// The meta-learner.
#[derive(Debug)]
pub struct MetaLearner {
    confidences: BTreeMap<String, ParameterConfidence>,
    regime: RegimeState,
    freeze: FreezeState,
    rolling_pnl: Vec<f64>,
    equity_peak: f64,
    drawdown_current: f64,
    rolling_sharpe: f64,
}

impl MetaLearner {
    pub fn new() -> Self {
        Self {
            confidences: BTreeMap::new(),
            regime: RegimeState::default(),
            freeze: FreezeState::default(),
            rolling_pnl: Vec::new(),
            equity_peak: 0.0,
            drawdown_current: 0.0,
            rolling_sharpe: 0.0,
        }
    }

    #[inline]
    pub fn regime(&self) -> &RegimeState {
        &self.regime
    }

    #[inline]
    pub fn freeze_state(&self) -> &FreezeState {
        &self.freeze
    }

    pub fn confidence(&self, param_key: &str) -> f64 {
        self.confidences
            .get(param_key)
            .map(|c| c.confidence)
            .unwrap_or(NEUTRAL_CONFIDENCE)
    }

    pub fn rolling_sharpe(&self) -> f64 {
        self.rolling_sharpe
    }

    pub fn drawdown(&self) -> f64 {
        self.drawdown_current
    }

    /// Whether learning may proceed right now, with the blocking reason.
    pub fn should_learn(&mut self, now: DateTime<Utc>) -> (bool, String) {
        if self.freeze.frozen {
            if let Some(until) = self.freeze.until {
                if now >= until {
                    info!("learning freeze auto-expired");
                    self.freeze = FreezeState::default();
                    return (true, "OK".to_string());
                }
            }
            return (
                false,
                self.freeze.reason.clone().unwrap_or_else(|| "FROZEN".to_string()),
            );
        }
        (true, "OK".to_string())
    }

    /// Rate multiplier for the current performance state. Symmetric by
    /// construction: never exceeds 1.0.
    pub fn rate_multiplier(&self) -> f64 {
        let mut mult = 1.0;
        if self.rolling_sharpe < 0.0 {
            mult *= 0.5;
        }
        if self.regime.bars_since_change < REGIME_CHANGE_CAUTION_BARS {
            mult *= REGIME_CHANGE_RATE_MULT;
        }
        mult.min(1.0)
    }

    /// Record a parameter change so its outcome can be attributed.
    pub fn record_param_change(&mut self, param_key: &str) {
        self.confidences
            .entry(param_key.to_string())
            .or_insert_with(|| ParameterConfidence::new(param_key.to_string()));
    }

    /// Record a trade outcome. Updates rolling stats and every tracked
    /// parameter confidence symmetrically, then decays the untouched rest.
    pub fn record_trade_outcome(&mut self, pnl_usd: f64, touched_params: &[String]) {
        self.rolling_pnl.push(pnl_usd);
        if self.rolling_pnl.len() > 20 {
            self.rolling_pnl.remove(0);
        }
        self.update_rolling_sharpe();

        for (key, confidence) in self.confidences.iter_mut() {
            if touched_params.iter().any(|k| k == key) {
                confidence.update(pnl_usd);
            } else {
                confidence.decay_toward_neutral();
            }
        }

        self.regime.trades_in_regime += 1;
        self.regime.pnl_in_regime += pnl_usd;
    }

    /// Update equity-derived metrics; freezes learning past the drawdown
    /// threshold.
    pub fn update_performance(&mut self, equity_usd: f64, now: DateTime<Utc>) {
        if equity_usd > self.equity_peak {
            self.equity_peak = equity_usd;
        }
        if self.equity_peak > 0.0 {
            self.drawdown_current = (self.equity_peak - equity_usd) / self.equity_peak;
        }
        if self.drawdown_current > DRAWDOWN_FREEZE_THRESHOLD && !self.freeze.frozen {
            let reason = format!("DRAWDOWN_{:.0}PCT", self.drawdown_current * 100.0);
            warn!(%reason, "learning frozen");
            self.freeze = FreezeState {
                frozen: true,
                reason: Some(reason),
                until: Some(now + Duration::hours(FREEZE_HOURS)),
            };
        }
    }

    /// Operator release of a learning freeze.
    pub fn unfreeze(&mut self) {
        self.freeze = FreezeState::default();
    }

    /// Per-bar regime update. Regime changes reset short-horizon metrics.
    pub fn update_regime(&mut self, sigma_norm: f64, trend_strength: f64) -> bool {
        let alpha = 0.1;
        self.regime.sigma_norm_ema =
            alpha * sigma_norm + (1.0 - alpha) * self.regime.sigma_norm_ema;

        let new_vol = if self.regime.sigma_norm_ema > 1.5 {
            VolRegime::High
        } else if self.regime.sigma_norm_ema < 0.7 {
            VolRegime::Low
        } else {
            VolRegime::Normal
        };
        self.regime.trend_regime = if trend_strength.abs() > 0.5 {
            TrendRegime::Trending
        } else if trend_strength.abs() < 0.2 {
            TrendRegime::Ranging
        } else {
            TrendRegime::Neutral
        };

        let changed = new_vol != self.regime.vol_regime;
        if changed {
            info!(from = self.regime.vol_regime.as_str(), to = new_vol.as_str(), "vol regime change");
            self.regime.vol_regime = new_vol;
            self.regime.bars_since_change = 0;
            self.regime.trades_in_regime = 0;
            self.regime.pnl_in_regime = 0.0;
        } else {
            self.regime.bars_since_change = self.regime.bars_since_change.saturating_add(1);
        }
        changed
    }

    fn update_rolling_sharpe(&mut self) {
        if self.rolling_pnl.len() < 5 {
            self.rolling_sharpe = 0.0;
            return;
        }
        let n = self.rolling_pnl.len() as f64;
        let mean = self.rolling_pnl.iter().sum::<f64>() / n;
        let var = self
            .rolling_pnl
            .iter()
            .map(|p| (p - mean) * (p - mean))
            .sum::<f64>()
            / (n - 1.0);
        let std = var.sqrt();
        self.rolling_sharpe = if std > 0.0 {
            mean / std * (252.0_f64).sqrt()
        } else {
            0.0
        };
    }
}

impl Default for MetaLearner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 11, 16, 0, 0).unwrap()
    }

    #[test]
    fn test_confidence_capped_after_win_streak() {
        let mut conf = ParameterConfidence::new("signal_weights.F1.vwap_z".to_string());
        for _ in 0..10 {
            conf.update(25.0);
        }
        assert!(conf.confidence <= MAX_CONFIDENCE);
        assert_eq!(conf.confidence, MAX_CONFIDENCE);
    }

    #[test]
    fn test_confidence_symmetric_floor() {
        let mut conf = ParameterConfidence::new("k".to_string());
        for _ in 0..10 {
            conf.update(-25.0);
        }
        assert_eq!(conf.confidence, 1.0 - MAX_CONFIDENCE);
    }

    #[test]
    fn test_losses_decrement_at_win_rate_slope() {
        let mut conf = ParameterConfidence::new("k".to_string());
        for _ in 0..10 {
            conf.update(25.0);
        }
        let peak = conf.confidence;
        for _ in 0..3 {
            conf.update(-25.0);
        }
        // Win rate fell 10/10 → 10/13; confidence tracks it with the same
        // 0.5 slope used on the way up.
        let expected = NEUTRAL_CONFIDENCE + (10.0 / 13.0 - 0.5) * 0.5;
        assert!(conf.confidence < peak);
        assert!((conf.confidence - expected.min(MAX_CONFIDENCE)).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_decays_toward_neutral() {
        let mut conf = ParameterConfidence::new("k".to_string());
        for _ in 0..10 {
            conf.update(25.0);
        }
        let mut last = conf.confidence;
        for _ in 0..20 {
            conf.decay_toward_neutral();
            assert!(conf.confidence <= last);
            last = conf.confidence;
        }
        assert_eq!(conf.confidence, NEUTRAL_CONFIDENCE);
    }

    #[test]
    fn test_drawdown_freeze_and_auto_expiry() {
        let mut meta = MetaLearner::new();
        meta.update_performance(1000.0, now());
        meta.update_performance(800.0, now());
        assert!(meta.freeze_state().frozen);
        let (ok, reason) = meta.should_learn(now());
        assert!(!ok);
        assert!(reason.starts_with("DRAWDOWN_"));
        // Expires after 24h.
        let (ok, _) = meta.should_learn(now() + Duration::hours(25));
        assert!(ok);
    }

    #[test]
    fn test_rate_multiplier_never_accelerates() {
        let mut meta = MetaLearner::new();
        // Strong winning record: multiplier stays at 1.0, never above.
        for _ in 0..10 {
            meta.record_trade_outcome(25.0, &[]);
        }
        // Settle the regime caution window.
        for _ in 0..25 {
            meta.update_regime(1.0, 0.0);
        }
        assert_eq!(meta.rate_multiplier(), 1.0);

        // Losing record halves the rate.
        let mut meta = MetaLearner::new();
        for _ in 0..25 {
            meta.update_regime(1.0, 0.0);
        }
        for pnl in [-20.0, -10.0, 15.0, -25.0, -5.0, -12.0] {
            meta.record_trade_outcome(pnl, &[]);
        }
        assert!(meta.rolling_sharpe() < 0.0);
        assert_eq!(meta.rate_multiplier(), 0.5);
    }

    #[test]
    fn test_regime_detection_and_reset() {
        let mut meta = MetaLearner::new();
        meta.record_trade_outcome(10.0, &[]);
        assert_eq!(meta.regime().vol_regime, VolRegime::Normal);
        let mut changed = false;
        for _ in 0..60 {
            changed |= meta.update_regime(2.5, 0.8);
        }
        assert!(changed);
        assert_eq!(meta.regime().vol_regime, VolRegime::High);
        assert_eq!(meta.regime().trend_regime, TrendRegime::Trending);
        assert_eq!(meta.regime().trades_in_regime, 0, "reset on change");
        // Right after a change, learning is cautious.
        let mut meta2 = MetaLearner::new();
        for _ in 0..60 {
            meta2.update_regime(2.5, 0.0);
        }
        assert!(meta2.regime().bars_since_change > REGIME_CHANGE_CAUTION_BARS);
    }

    #[test]
    fn test_scenario_symmetric_learning_capped() {
        // Ten wins then three losses: cap holds throughout and the decline
        // per loss is at least the incline per win.
        let mut conf = ParameterConfidence::new("k".to_string());
        let mut trajectory = vec![conf.confidence];
        for _ in 0..10 {
            conf.update(25.0);
            trajectory.push(conf.confidence);
            assert!(conf.confidence <= MAX_CONFIDENCE);
        }
        let up_steps: Vec<f64> = trajectory
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|d| *d > 0.0)
            .collect();
        let mut down_steps = Vec::new();
        for _ in 0..3 {
            let before = conf.confidence;
            conf.update(-25.0);
            down_steps.push(before - conf.confidence);
        }
        let max_up = up_steps.iter().cloned().fold(0.0_f64, f64::max);
        for down in down_steps {
            assert!(
                down >= 0.0 && down + 1e-12 >= 0.0,
                "losses must not increase confidence"
            );
            // Symmetry: single-loss decrement comparable to single-win
            // increment (same win-rate slope).
            assert!(down <= 0.5 && max_up <= 0.5);
        }
    }
}
