//! Learning Loop
//!
//! Bounded, symmetric parameter updates from attributed trade outcomes,
//! plus per-strategy reliability tracking with throttle and quarantine.
//!
//! Real-time updates run after every trade with increments scaled to 1/20
//! of the weekly budget; the weekly batch applies the full budget over at
//! least ten trades. Both paths clip to the constitutional bounds and
//! publish a fresh immutable parameter snapshot.

use crate::engine::beliefs::ConstraintId;
use crate::engine::meta::{MetaLearner, VolRegime};
use crate::engine::params::{ParamBounds, ParameterState, ParamsHandle};
use crate::engine::templates::TemplateId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Fraction of the weekly change budget available to one real-time update.
const REALTIME_SCALE: f64 = 0.05;
/// Minimum attributed trades for a weekly batch.
const MIN_TRADES_FOR_BATCH: usize = 10;
/// Trades with learning weight below this are skipped entirely.
const MIN_LEARNING_WEIGHT: f64 = 0.1;
/// PnL normalization scale for update magnitude.
const PNL_MAGNITUDE_SCALE: f64 = 50.0;

const MIN_ACCEPTABLE_WIN_RATE: f64 = 0.40;

/// A completed, attributed trade as the learning loop consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAttribution {
    pub trade_id: String,
    pub template_id: TemplateId,
    pub pnl_usd: f64,
    pub beliefs_at_entry: BTreeMap<ConstraintId, f64>,
    pub signals_at_entry: BTreeMap<String, f64>,
    pub learning_weight: f64,
    pub data_quality_weight: f64,
    pub timestamp: DateTime<Utc>,
    /// Coarse time-of-day bucket for the strategy key.
    pub time_of_day: String,
}

/// Result of one learning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningResult {
    pub applied: bool,
    pub parameters_updated: usize,
    pub reason: String,
    pub touched_params: Vec<String>,
    pub new_version: u64,
}

/// Strategy operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyState {
    Active,
    Quarantined,
}

/// Reliability metrics for one `template · regime · time-of-day` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityMetrics {
    pub strategy_key: String,
    pub template_id: TemplateId,
    pub trades_count: u32,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    /// Quality-weighted cumulative PnL.
    pub total_pnl: f64,
    pub expectancy: f64,
    pub win_rate: f64,
    pub state: StrategyState,
    pub state_change_reason: Option<String>,
    pub throttle_level: u8,
    /// Trades observed since entering quarantine.
    pub trades_since_quarantine: u32,
    pub pnl_since_quarantine: f64,
}

impl ReliabilityMetrics {
    fn new(strategy_key: String, template_id: TemplateId) -> Self {
        Self {
            strategy_key,
            template_id,
            trades_count: 0,
            wins: 0,
            losses: 0,
            consecutive_wins: 0,
            consecutive_losses: 0,
            total_pnl: 0.0,
            expectancy: 0.0,
            win_rate: 0.0,
            state: StrategyState::Active,
            state_change_reason: None,
            throttle_level: 0,
            trades_since_quarantine: 0,
            pnl_since_quarantine: 0.0,
        }
    }

    fn update_from_trade(&mut self, pnl: f64, quality_weight: f64) {
        self.trades_count += 1;
        if pnl > 0.0 {
            self.wins += 1;
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.losses += 1;
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
        }
        self.total_pnl += pnl * quality_weight.clamp(0.0, 1.0);
        self.expectancy = self.total_pnl / self.trades_count as f64;
        self.win_rate = self.wins as f64 / self.trades_count as f64;
        if self.state == StrategyState::Quarantined {
            self.trades_since_quarantine += 1;
            self.pnl_since_quarantine += pnl;
        }
    }

    fn should_quarantine(&self) -> Option<&'static str> {
        if self.consecutive_losses >= 2 {
            return Some("CONSECUTIVE_LOSSES");
        }
        if self.trades_count >= 5 && self.expectancy < 0.0 {
            return Some("NEGATIVE_EXPECTANCY");
        }
        if self.trades_count >= 10 && self.win_rate < MIN_ACCEPTABLE_WIN_RATE {
            return Some("LOW_WIN_RATE");
        }
        None
    }

    fn should_re_enable(&self) -> Option<&'static str> {
        if self.consecutive_wins >= 2 {
            return Some("RECOVERY_WINS");
        }
        if self.trades_since_quarantine >= 3 && self.pnl_since_quarantine > 0.0 {
            return Some("POSITIVE_EXPECTANCY");
        }
        None
    }

    fn compute_throttle_level(&self) -> u8 {
        if self.trades_count < 3 {
            return 0;
        }
        if self.win_rate >= MIN_ACCEPTABLE_WIN_RATE {
            0
        } else if self.win_rate >= 0.30 {
            1
        } else if self.win_rate >= 0.20 {
            2
        } else {
            2
        }
    }
}

/// The learning loop. Sole owner of the parameter state; publishes
/// immutable snapshots through the shared handle.
pub struct LearningLoop {
    params: Arc<ParamsHandle>,
    bounds: ParamBounds,
    meta: MetaLearner,
    metrics: BTreeMap<String, ReliabilityMetrics>,
    /// Attributed trades accumulated toward the weekly batch.
    pending_batch: Vec<TradeAttribution>,
}

impl LearningLoop {
    pub fn new(params: Arc<ParamsHandle>, bounds: ParamBounds) -> Self {
        Self {
            params,
            bounds,
            meta: MetaLearner::new(),
            metrics: BTreeMap::new(),
            pending_batch: Vec::new(),
        }
    }

    #[inline]
    pub fn meta(&self) -> &MetaLearner {
        &self.meta
    }

    #[inline]
    pub fn meta_mut(&mut self) -> &mut MetaLearner {
        &mut self.meta
    }

    pub fn metrics(&self) -> &BTreeMap<String, ReliabilityMetrics> {
        &self.metrics
    }

    fn strategy_key(template: TemplateId, regime: VolRegime, tod: &str) -> String {
        format!("{}_{}_{}", template, regime.as_str(), tod)
    }

    /// Multiplicative EUC cost modifier read by the decision engine.
    pub fn euc_cost_modifier(&self, template: TemplateId, tod: &str) -> f64 {
        let key = Self::strategy_key(template, self.meta.regime().vol_regime, tod);
        match self.metrics.get(&key) {
            None => 1.0,
            Some(m) if m.state == StrategyState::Quarantined => 10.0,
            Some(m) => match m.throttle_level {
                0 => 1.0,
                1 => 1.2,
                _ => 1.5,
            },
        }
    }

    /// Cost modifiers for every template in the current regime/bucket.
    pub fn cost_modifiers(&self, tod: &str) -> BTreeMap<TemplateId, f64> {
        TemplateId::ALL
            .iter()
            .map(|&t| (t, self.euc_cost_modifier(t, tod)))
            .collect()
    }

    /// Full per-trade pass: reliability update, freeze checks, then the
    /// bounded real-time parameter update.
    pub fn on_trade_closed(
        &mut self,
        attribution: &TradeAttribution,
        equity_usd: f64,
        now: DateTime<Utc>,
    ) -> LearningResult {
        self.update_reliability(attribution);
        self.pending_batch.push(attribution.clone());
        self.meta.update_performance(equity_usd, now);

        let (may_learn, block_reason) = self.meta.should_learn(now);
        if !may_learn {
            self.meta.record_trade_outcome(attribution.pnl_usd, &[]);
            return LearningResult {
                applied: false,
                parameters_updated: 0,
                reason: block_reason,
                touched_params: Vec::new(),
                new_version: self.params.load().version,
            };
        }

        if attribution.learning_weight < MIN_LEARNING_WEIGHT {
            self.meta.record_trade_outcome(attribution.pnl_usd, &[]);
            return LearningResult {
                applied: false,
                parameters_updated: 0,
                reason: "LOW_LEARNING_WEIGHT".to_string(),
                touched_params: Vec::new(),
                new_version: self.params.load().version,
            };
        }

        let result = self.apply_update(attribution, REALTIME_SCALE, "REALTIME", now);
        self.meta
            .record_trade_outcome(attribution.pnl_usd, &result.touched_params);
        result
    }

    /// Weekly batch: the same update rule at full budget over the
    /// accumulated trades. Requires at least [`MIN_TRADES_FOR_BATCH`].
    pub fn run_weekly_batch(&mut self, now: DateTime<Utc>) -> LearningResult {
        let (may_learn, block_reason) = self.meta.should_learn(now);
        if !may_learn {
            return LearningResult {
                applied: false,
                parameters_updated: 0,
                reason: block_reason,
                touched_params: Vec::new(),
                new_version: self.params.load().version,
            };
        }
        if self.pending_batch.len() < MIN_TRADES_FOR_BATCH {
            return LearningResult {
                applied: false,
                parameters_updated: 0,
                reason: format!(
                    "INSUFFICIENT_TRADES ({} < {})",
                    self.pending_batch.len(),
                    MIN_TRADES_FOR_BATCH
                ),
                touched_params: Vec::new(),
                new_version: self.params.load().version,
            };
        }

        let trades = std::mem::take(&mut self.pending_batch);
        let mut touched = Vec::new();
        let mut updates = 0usize;
        for trade in trades
            .iter()
            .filter(|t| t.learning_weight >= MIN_LEARNING_WEIGHT)
        {
            let result = self.apply_update(trade, 1.0 / MIN_TRADES_FOR_BATCH as f64, "BATCH", now);
            updates += result.parameters_updated;
            touched.extend(result.touched_params);
        }
        touched.sort();
        touched.dedup();
        LearningResult {
            applied: updates > 0,
            parameters_updated: updates,
            reason: "BATCH".to_string(),
            touched_params: touched,
            new_version: self.params.load().version,
        }
    }

    fn update_reliability(&mut self, attribution: &TradeAttribution) {
        let key = Self::strategy_key(
            attribution.template_id,
            self.meta.regime().vol_regime,
            &attribution.time_of_day,
        );
        let metrics = self
            .metrics
            .entry(key.clone())
            .or_insert_with(|| ReliabilityMetrics::new(key.clone(), attribution.template_id));
        metrics.update_from_trade(attribution.pnl_usd, attribution.data_quality_weight);

        match metrics.state {
            StrategyState::Active => {
                if let Some(reason) = metrics.should_quarantine() {
                    metrics.state = StrategyState::Quarantined;
                    metrics.state_change_reason = Some(reason.to_string());
                    metrics.trades_since_quarantine = 0;
                    metrics.pnl_since_quarantine = 0.0;
                    info!(strategy = %metrics.strategy_key, reason, "strategy quarantined");
                }
            }
            StrategyState::Quarantined => {
                if let Some(reason) = metrics.should_re_enable() {
                    metrics.state = StrategyState::Active;
                    metrics.state_change_reason = Some(reason.to_string());
                    metrics.consecutive_wins = 0;
                    metrics.consecutive_losses = 0;
                    info!(strategy = %metrics.strategy_key, reason, "strategy re-enabled");
                }
            }
        }
        metrics.throttle_level = metrics.compute_throttle_level();
    }

    /// The shared bounded update rule. `scale` is the fraction of the
    /// weekly change budget available to this pass.
    fn apply_update(
        &mut self,
        trade: &TradeAttribution,
        scale: f64,
        mode: &str,
        now: DateTime<Utc>,
    ) -> LearningResult {
        let current = self.params.load();
        let mut next = (*current).clone();

        let direction = if trade.pnl_usd > 0.0 { 1.0 } else { -1.0 };
        let magnitude = (trade.pnl_usd.abs() / PNL_MAGNITUDE_SCALE).min(1.0);
        let lw = trade.learning_weight;
        let rate_mult = self.meta.rate_multiplier();

        let mut touched = Vec::new();

        for (constraint_id, belief_val) in &trade.beliefs_at_entry {
            if let Some(row) = next.signal_weights.get_mut(constraint_id) {
                for (signal_name, weight) in row.iter_mut() {
                    let Some(signal_val) = trade.signals_at_entry.get(signal_name) else {
                        continue;
                    };
                    if *signal_val == 0.0 {
                        continue;
                    }
                    let base_delta =
                        direction * magnitude * signal_val * lw * 0.1 * rate_mult;
                    let max_change = self.bounds.signal_weights.max_change * scale;
                    let delta = base_delta.clamp(-max_change, max_change);
                    let new_val = self.bounds.signal_weights.clip(*weight + delta);
                    if (new_val - *weight).abs() > 1e-9 {
                        *weight = new_val;
                        touched.push(format!(
                            "signal_weights.{}.{}",
                            constraint_id, signal_name
                        ));
                    }
                }
            }

            if let Some(threshold) = next.belief_thresholds.get_mut(constraint_id) {
                // Scaled by how far below certainty the entry belief sat;
                // same slope for wins and losses.
                let base_delta =
                    direction * (1.0 - belief_val) * magnitude * lw * 0.01 * rate_mult;
                let max_change = self.bounds.belief_thresholds.max_change * scale;
                let delta = base_delta.clamp(-max_change, max_change);
                let new_val = self.bounds.belief_thresholds.clip(*threshold + delta);
                if (new_val - *threshold).abs() > 1e-9 {
                    *threshold = new_val;
                    touched.push(format!("belief_thresholds.{}", constraint_id));
                }
            }
        }

        if touched.is_empty() {
            return LearningResult {
                applied: false,
                parameters_updated: 0,
                reason: "NO_CHANGES_NEEDED".to_string(),
                touched_params: touched,
                new_version: current.version,
            };
        }

        next.enforce_bounds(&self.bounds);
        next.version += 1;
        next.last_updated = Some(now);
        next.update_reason = Some(format!("{}_LEARN_V{}", mode, next.version));
        let version = next.version;
        for key in &touched {
            self.meta.record_param_change(key);
        }
        info!(
            mode,
            pnl = trade.pnl_usd,
            updated = touched.len(),
            version,
            "parameters updated from trade"
        );
        self.params.publish(next);

        LearningResult {
            applied: true,
            parameters_updated: touched.len(),
            reason: format!("{}_LEARNED", mode),
            touched_params: touched,
            new_version: version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 16, 5, 0).unwrap()
    }

    fn attribution(pnl: f64, lw: f64) -> TradeAttribution {
        TradeAttribution {
            trade_id: "t".to_string(),
            template_id: TemplateId::K1,
            pnl_usd: pnl,
            beliefs_at_entry: BTreeMap::from([(ConstraintId::F1, 0.7)]),
            signals_at_entry: BTreeMap::from([
                ("vwap_stretch".to_string(), 1.5),
                ("range_compression".to_string(), 0.8),
            ]),
            learning_weight: lw,
            data_quality_weight: 1.0,
            timestamp: now(),
            time_of_day: "mid_morning".to_string(),
        }
    }

    fn learning_loop() -> LearningLoop {
        LearningLoop::new(
            Arc::new(ParamsHandle::default()),
            ParamBounds::default(),
        )
    }

    #[test]
    fn test_low_learning_weight_skipped() {
        let mut lp = learning_loop();
        let result = lp.on_trade_closed(&attribution(25.0, 0.05), 1000.0, now());
        assert!(!result.applied);
        assert_eq!(result.reason, "LOW_LEARNING_WEIGHT");
    }

    #[test]
    fn test_realtime_update_bounded() {
        let mut lp = learning_loop();
        let before = lp.params.load();
        let before_w = before.signal_weights[&ConstraintId::F1]["vwap_stretch"];
        let result = lp.on_trade_closed(&attribution(25.0, 1.0), 1000.0, now());
        assert!(result.applied);
        let after = lp.params.load();
        let after_w = after.signal_weights[&ConstraintId::F1]["vwap_stretch"];
        // Realtime increment is at most 5% of the weekly budget.
        let max_step = ParamBounds::default().signal_weights.max_change * REALTIME_SCALE;
        assert!((after_w - before_w).abs() <= max_step + 1e-12);
        assert!(after.version > before.version);
    }

    #[test]
    fn test_weights_stay_in_bounds_over_many_trades() {
        let mut lp = learning_loop();
        for i in 0..200 {
            let pnl = if i % 3 == 0 { -25.0 } else { 40.0 };
            lp.on_trade_closed(&attribution(pnl, 1.0), 1000.0, now());
        }
        let params = lp.params.load();
        let bounds = ParamBounds::default();
        for row in params.signal_weights.values() {
            for w in row.values() {
                assert!(*w >= bounds.signal_weights.min && *w <= bounds.signal_weights.max);
            }
        }
        for t in params.belief_thresholds.values() {
            assert!(*t >= 0.50 && *t <= 0.95);
        }
    }

    #[test]
    fn test_symmetric_updates() {
        // A win and an equal loss move the weight by the same magnitude in
        // opposite directions (from the same starting point).
        let mut lp_win = learning_loop();
        lp_win.on_trade_closed(&attribution(25.0, 1.0), 1000.0, now());
        let w_win = lp_win.params.load().signal_weights[&ConstraintId::F1]["vwap_stretch"];

        let mut lp_loss = learning_loop();
        lp_loss.on_trade_closed(&attribution(-25.0, 1.0), 1000.0, now());
        let w_loss = lp_loss.params.load().signal_weights[&ConstraintId::F1]["vwap_stretch"];

        let base = ParameterState::defaults().signal_weights[&ConstraintId::F1]["vwap_stretch"];
        assert!(((w_win - base) + (w_loss - base)).abs() < 1e-9, "asymmetric update");
    }

    #[test]
    fn test_freeze_blocks_learning() {
        let mut lp = learning_loop();
        lp.meta_mut().update_performance(1000.0, now());
        lp.meta_mut().update_performance(800.0, now());
        let result = lp.on_trade_closed(&attribution(25.0, 1.0), 800.0, now());
        assert!(!result.applied);
        assert!(result.reason.starts_with("DRAWDOWN_"));
    }

    #[test]
    fn test_quarantine_after_two_losses_and_recovery() {
        let mut lp = learning_loop();
        lp.on_trade_closed(&attribution(-25.0, 1.0), 1000.0, now());
        lp.on_trade_closed(&attribution(-25.0, 1.0), 1000.0, now());
        assert_eq!(lp.euc_cost_modifier(TemplateId::K1, "mid_morning"), 10.0);

        // Two consecutive wins re-enable.
        lp.on_trade_closed(&attribution(30.0, 1.0), 1000.0, now());
        assert_eq!(lp.euc_cost_modifier(TemplateId::K1, "mid_morning"), 10.0);
        lp.on_trade_closed(&attribution(30.0, 1.0), 1000.0, now());
        let modifier = lp.euc_cost_modifier(TemplateId::K1, "mid_morning");
        assert!(modifier < 10.0, "re-enabled strategy unblocked, got {modifier}");
    }

    #[test]
    fn test_throttle_levels_from_win_rate() {
        let mut m = ReliabilityMetrics::new("k".to_string(), TemplateId::K1);
        // 3 wins, 5 losses → win rate 0.375 → level 1.
        for _ in 0..3 {
            m.update_from_trade(10.0, 1.0);
        }
        for _ in 0..5 {
            m.update_from_trade(-10.0, 1.0);
        }
        assert_eq!(m.compute_throttle_level(), 1);
        // Drive win rate into the 0.20-0.30 band → level 2.
        for _ in 0..4 {
            m.update_from_trade(-10.0, 1.0);
        }
        assert_eq!(m.compute_throttle_level(), 2);
    }

    #[test]
    fn test_weekly_batch_requires_min_trades() {
        let mut lp = learning_loop();
        for _ in 0..3 {
            lp.on_trade_closed(&attribution(25.0, 1.0), 1000.0, now());
        }
        let result = lp.run_weekly_batch(now());
        assert!(!result.applied);
        assert!(result.reason.starts_with("INSUFFICIENT_TRADES"));

        for _ in 0..10 {
            lp.on_trade_closed(&attribution(25.0, 1.0), 1000.0, now());
        }
        let result = lp.run_weekly_batch(now());
        assert!(result.applied);
    }

    #[test]
    fn test_modifier_neutral_for_unknown_strategy() {
        let lp = learning_loop();
        assert_eq!(lp.euc_cost_modifier(TemplateId::K4, "open"), 1.0);
    }
}
