//! Data Validity and Execution Quality Scores
//!
//! Both scores are rule-list folds: a normalized config carries an ordered
//! list of degradation rules, each rule a conjunction of atomic comparisons
//! over a metrics snapshot. Matching rules subtract penalties; a linear
//! recovery is added after all rules; the result is clamped to [0, 1].
//!
//! Conditions fail closed: a missing metric or an unknown condition shape
//! never matches.

use crate::engine::numeric::clamp01;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Comparison operator, keyed in config by suffix (`_gte`, `_gt`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Gte,
    Gt,
    Lte,
    Lt,
    Eq,
}

/// A metric value in the snapshot handed to the scorers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Num(f64),
    Bool(bool),
    Text(String),
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Num(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

/// One atomic comparison: `metric <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicCondition {
    pub metric: String,
    pub op: CmpOp,
    pub value: MetricValue,
}

impl AtomicCondition {
    fn matches(&self, metrics: &MetricsSnapshot) -> bool {
        let Some(observed) = metrics.get(&self.metric) else {
            return false;
        };
        match self.op {
            CmpOp::Eq => observed == &self.value,
            op => {
                let (MetricValue::Num(obs), MetricValue::Num(thr)) = (observed, &self.value) else {
                    return false;
                };
                match op {
                    CmpOp::Gte => obs >= thr,
                    CmpOp::Gt => obs > thr,
                    CmpOp::Lte => obs <= thr,
                    CmpOp::Lt => obs < thr,
                    CmpOp::Eq => unreachable!(),
                }
            }
        }
    }
}

/// A degradation rule: unique id, conjunction of atoms, penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationRule {
    pub id: String,
    /// All atoms must match. An empty conjunction never matches.
    pub condition: Vec<AtomicCondition>,
    /// Subtracted from the running score when the rule matches.
    pub penalty: f64,
}

impl DegradationRule {
    pub fn matches(&self, metrics: &MetricsSnapshot) -> bool {
        !self.condition.is_empty() && self.condition.iter().all(|c| c.matches(metrics))
    }
}

/// Normalized scorer configuration. Shared shape for DVS and EQS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreConfig {
    pub initial_value: f64,
    /// Evaluated in list order; order is authoritative.
    pub degradation_events: Vec<DegradationRule>,
    /// Linear recovery added once per evaluation step.
    pub recovery_per_bar: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            initial_value: 1.0,
            degradation_events: Vec::new(),
            recovery_per_bar: 0.0,
        }
    }
}

/// Metrics snapshot with deterministic iteration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot(BTreeMap<String, MetricValue>);

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<MetricValue>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        self.0.get(key)
    }
}

/// Result of one scorer evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub value: f64,
    /// Ids of the rules that matched, in evaluation order.
    pub triggered: Vec<String>,
}

/// Fold one evaluation step: penalties for matching rules, then recovery,
/// then clamp.
pub fn evaluate_score(prior: f64, metrics: &MetricsSnapshot, cfg: &ScoreConfig) -> ScoreResult {
    let mut value = prior;
    let mut triggered = Vec::new();
    for rule in &cfg.degradation_events {
        if rule.matches(metrics) {
            value = clamp01(value - rule.penalty);
            triggered.push(rule.id.clone());
        }
    }
    value = clamp01(value + cfg.recovery_per_bar);
    ScoreResult { value, triggered }
}

/// Stateful DVS tracker for the decision loop.
#[derive(Debug, Clone)]
pub struct DvsState {
    cfg: ScoreConfig,
    value: f64,
}

impl DvsState {
    pub fn new(cfg: ScoreConfig) -> Self {
        let value = cfg.initial_value;
        Self { cfg, value }
    }

    /// Evaluate this bar's data quality. `bar_invalid` forces 0 for the
    /// interval without consuming the running value.
    pub fn on_bar(&mut self, metrics: &MetricsSnapshot, bar_invalid: bool) -> ScoreResult {
        if bar_invalid {
            return ScoreResult {
                value: 0.0,
                triggered: vec!["bar_structural_invalid".to_string()],
            };
        }
        let result = evaluate_score(self.value, metrics, &self.cfg);
        self.value = result.value;
        result
    }

    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Stateful EQS tracker for the execution path.
#[derive(Debug, Clone)]
pub struct EqsState {
    cfg: ScoreConfig,
    value: f64,
}

impl EqsState {
    pub fn new(cfg: ScoreConfig) -> Self {
        let value = cfg.initial_value;
        Self { cfg, value }
    }

    pub fn on_bar(&mut self, metrics: &MetricsSnapshot) -> ScoreResult {
        let result = evaluate_score(self.value, metrics, &self.cfg);
        self.value = result.value;
        result
    }

    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Slippage-versus-expected ratio used by the EQS metric set.
pub fn slippage_vs_expected(fill_price: f64, limit_price: f64, expected_slippage: f64) -> f64 {
    let denom = expected_slippage.max(1e-9);
    (fill_price - limit_price).abs() / denom
}

// =============================================================================
// Default rule sets (normalized form of the data/execution contracts)
// =============================================================================

fn atom(metric: &str, op: CmpOp, value: impl Into<MetricValue>) -> AtomicCondition {
    AtomicCondition {
        metric: metric.to_string(),
        op,
        value: value.into(),
    }
}

fn rule(id: &str, condition: Vec<AtomicCondition>, penalty: f64) -> DegradationRule {
    DegradationRule {
        id: id.to_string(),
        condition,
        penalty,
    }
}

/// Default DVS contract: stale bars, gaps, missing fields, outliers, wide
/// synthetic spreads.
pub fn default_dvs_config() -> ScoreConfig {
    ScoreConfig {
        initial_value: 1.0,
        degradation_events: vec![
            rule("bar_lag_high", vec![atom("bar_lag_seconds", CmpOp::Gte, 30.0)], 0.20),
            rule("bar_lag_extreme", vec![atom("bar_lag_seconds", CmpOp::Gte, 120.0)], 0.40),
            rule("gap_detected", vec![atom("gap_detected", CmpOp::Eq, true)], 0.25),
            rule("missing_fields", vec![atom("missing_fields", CmpOp::Gte, 1.0)], 0.15),
            rule("outlier_price", vec![atom("outlier_score", CmpOp::Gte, 3.0)], 0.30),
            rule("price_jump", vec![atom("price_jump_pct", CmpOp::Gte, 0.5)], 0.30),
            rule("volume_spike", vec![atom("volume_spike_ratio", CmpOp::Gte, 10.0)], 0.10),
            rule("trading_halt", vec![atom("trading_halt", CmpOp::Eq, true)], 0.60),
        ],
        recovery_per_bar: 0.05,
    }
}

/// Default EQS contract: rejects, slow or partial fills, degraded
/// connection, slippage beyond expectation.
pub fn default_eqs_config() -> ScoreConfig {
    ScoreConfig {
        initial_value: 1.0,
        degradation_events: vec![
            rule("order_rejected", vec![atom("order_rejected", CmpOp::Eq, true)], 0.30),
            rule(
                "slow_fill",
                vec![atom("fill_time_minus_order_time_seconds", CmpOp::Gte, 10.0)],
                0.15,
            ),
            rule("partial_fill", vec![atom("partial_fill", CmpOp::Eq, true)], 0.10),
            rule(
                "connection_degraded",
                vec![atom("connection_state", CmpOp::Eq, "DEGRADED")],
                0.35,
            ),
            rule(
                "connection_down",
                vec![atom("connection_state", CmpOp::Eq, "DOWN")],
                0.70,
            ),
            rule("slippage_high", vec![atom("slippage_ticks", CmpOp::Gte, 2.0)], 0.15),
            rule(
                "slippage_vs_expected_high",
                vec![atom("slippage_vs_expected", CmpOp::Gte, 2.0)],
                0.20,
            ),
        ],
        recovery_per_bar: 0.04,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetricsSnapshot {
        let mut m = MetricsSnapshot::new();
        m.set("bar_lag_seconds", 0.0)
            .set("gap_detected", false)
            .set("missing_fields", 0.0);
        m
    }

    #[test]
    fn test_clean_metrics_keep_score() {
        let mut dvs = DvsState::new(default_dvs_config());
        let r = dvs.on_bar(&snapshot(), false);
        assert_eq!(r.value, 1.0);
        assert!(r.triggered.is_empty());
    }

    #[test]
    fn test_penalty_and_recovery() {
        let mut dvs = DvsState::new(default_dvs_config());
        let mut m = snapshot();
        m.set("gap_detected", true);
        let degraded = dvs.on_bar(&m, false);
        // -0.25 gap, +0.05 recovery
        assert!((degraded.value - 0.80).abs() < 1e-12);
        assert_eq!(degraded.triggered, vec!["gap_detected"]);

        // Clean bar recovers linearly.
        let recovered = dvs.on_bar(&snapshot(), false);
        assert!((recovered.value - 0.85).abs() < 1e-12);
    }

    #[test]
    fn test_stacked_penalties_clamped() {
        let mut dvs = DvsState::new(default_dvs_config());
        let mut m = snapshot();
        m.set("bar_lag_seconds", 200.0)
            .set("gap_detected", true)
            .set("trading_halt", true)
            .set("outlier_score", 5.0)
            .set("price_jump_pct", 1.0);
        let r = dvs.on_bar(&m, false);
        assert!(r.value >= 0.0 && r.value <= 1.0);
        assert!(r.triggered.len() >= 4);
    }

    #[test]
    fn test_bar_invalid_forces_zero() {
        let mut dvs = DvsState::new(default_dvs_config());
        let r = dvs.on_bar(&snapshot(), true);
        assert_eq!(r.value, 0.0);
        // The running value is untouched; the next clean bar is unaffected.
        assert_eq!(dvs.value(), 1.0);
    }

    #[test]
    fn test_missing_metric_fails_closed() {
        let cfg = ScoreConfig {
            initial_value: 1.0,
            degradation_events: vec![rule(
                "needs_metric",
                vec![atom("not_present", CmpOp::Gte, 1.0)],
                0.5,
            )],
            recovery_per_bar: 0.0,
        };
        let r = evaluate_score(1.0, &MetricsSnapshot::new(), &cfg);
        assert_eq!(r.value, 1.0);
        assert!(r.triggered.is_empty());
    }

    #[test]
    fn test_empty_conjunction_never_matches() {
        let cfg = ScoreConfig {
            initial_value: 1.0,
            degradation_events: vec![rule("empty", vec![], 0.5)],
            recovery_per_bar: 0.0,
        };
        let r = evaluate_score(1.0, &snapshot(), &cfg);
        assert_eq!(r.value, 1.0);
    }

    #[test]
    fn test_type_mismatch_fails_closed() {
        let mut m = MetricsSnapshot::new();
        m.set("connection_state", "OK");
        // Numeric comparison against a string metric never matches.
        let cond = atom("connection_state", CmpOp::Gte, 1.0);
        assert!(!cond.matches(&m));
    }

    #[test]
    fn test_eqs_connection_down() {
        let mut eqs = EqsState::new(default_eqs_config());
        let mut m = MetricsSnapshot::new();
        m.set("connection_state", "DOWN");
        let r = eqs.on_bar(&m);
        assert!((r.value - 0.34).abs() < 1e-12); // 1.0 - 0.70 + 0.04
        assert_eq!(r.triggered, vec!["connection_down"]);
    }

    #[test]
    fn test_slippage_vs_expected_floor() {
        let ratio = slippage_vs_expected(5600.50, 5600.25, 0.0);
        assert!(ratio.is_finite());
        assert!(ratio > 0.0);
    }
}
