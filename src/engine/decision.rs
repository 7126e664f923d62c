//! Decision Engine
//!
//! Hierarchical gates over the belief set, then Edge-Uncertainty-Cost
//! scoring across the surviving templates. Gate order is normative: the
//! first failing gate names the no-trade reason, and threshold modifiers
//! only ever influence template acceptance after the constitutional layers
//! have passed.

use crate::engine::beliefs::BeliefSet;
use crate::engine::price::Px;
use crate::engine::reasons::NoTradeReason;
use crate::engine::risk::RiskTracker;
use crate::engine::signals::SignalOutput;
use crate::engine::templates::{all_templates, CapitalTier, TemplateId, TradeTemplate};
use crate::engine::params::ParameterState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Constitutional hard caps. Modifiers and learning never relax these.
pub const CONSTITUTIONAL_MAX_STOP_TICKS: i64 = 12;
pub const CONSTITUTIONAL_MAX_RISK_USD: f64 = 15.0;

const MIN_EDGE: f64 = 0.10;
const MAX_UNCERTAINTY: f64 = 0.40;
const MAX_COST: f64 = 0.30;

const DVS_ENTRY_MIN: f64 = 0.80;
const EQS_ENTRY_MIN: f64 = 0.75;

// Pessimistic round-trip friction. Calibrated so the cost gate is
// satisfiable by every template at clean spreads but fails when the
// spread/slippage proxies degrade.
const FRICTION_BASE_USD: f64 = 4.50;
const FRICTION_DEGRADED_EXTRA_USD: f64 = 3.0;

const STABILITY_MAX: f64 = 0.30;

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    #[inline]
    pub fn sign(self) -> i64 {
        match self {
            Direction::Long => 1,
            Direction::Short => -1,
        }
    }
}

/// Entry order types permitted by the execution contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Limit,
    StopLimit,
}

/// EUC score breakdown, kept for diagnostics and events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EucScore {
    pub edge: f64,
    pub uncertainty: f64,
    pub cost: f64,
    pub total: f64,
}

/// An accepted order intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Deterministic idempotency key, assigned by the orchestrator.
    pub intent_id: String,
    pub direction: Direction,
    pub contracts: i64,
    pub entry_type: EntryType,
    pub entry_price: Px,
    pub stop_ticks: i64,
    pub target_ticks: i64,
    pub template_id: TemplateId,
    pub euc: EucScore,
    pub time_stop_minutes: i64,
    pub tier: CapitalTier,
    pub belief: f64,
    pub stability: f64,
    pub timestamp: DateTime<Utc>,
}

/// Decision output: either a structured no-trade or an order intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecisionResult {
    NoTrade {
        reason: NoTradeReason,
        metadata: BTreeMap<String, String>,
    },
    Intent(Box<OrderIntent>),
}

impl DecisionResult {
    fn no_trade(reason: NoTradeReason) -> Self {
        DecisionResult::NoTrade {
            reason,
            metadata: BTreeMap::new(),
        }
    }

    fn no_trade_with(reason: NoTradeReason, metadata: BTreeMap<String, String>) -> Self {
        DecisionResult::NoTrade { reason, metadata }
    }

    pub fn reason(&self) -> Option<NoTradeReason> {
        match self {
            DecisionResult::NoTrade { reason, .. } => Some(*reason),
            DecisionResult::Intent(_) => None,
        }
    }
}

/// Everything the gate hierarchy looks at, assembled by the orchestrator.
#[derive(Debug, Clone)]
pub struct DecisionContext<'a> {
    pub timestamp: DateTime<Utc>,
    pub equity_usd: f64,
    pub account_ready: bool,
    pub kill_switch_active: bool,
    pub net_position: i64,
    pub dvs: f64,
    pub eqs: f64,
    pub tick_value: f64,
    /// Additive acceptance-threshold shift from the modifier registry.
    pub threshold_adjustment: f64,
    /// Per-template multiplicative EUC cost modifier from the learning loop.
    pub euc_cost_modifiers: &'a BTreeMap<TemplateId, f64>,
    pub risk: &'a RiskTracker,
    pub params: &'a ParameterState,
}

/// Stateless gate evaluator; all persistence lives in its inputs.
#[derive(Debug, Default)]
pub struct DecisionEngine;

impl DecisionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run the full hierarchy for one bar.
    pub fn decide(
        &self,
        ctx: &DecisionContext<'_>,
        beliefs: &BeliefSet,
        signals: &SignalOutput,
        close: Px,
    ) -> DecisionResult {
        // Layer 1: kill switch.
        if ctx.kill_switch_active {
            return DecisionResult::no_trade(NoTradeReason::KillSwitchActive);
        }

        // Account data must be present before quality claims mean anything.
        if !ctx.account_ready {
            return DecisionResult::no_trade(NoTradeReason::AccountDataMissing);
        }

        // Layers 2-3: quality gates.
        if ctx.dvs < DVS_ENTRY_MIN {
            return DecisionResult::no_trade_with(
                NoTradeReason::DvsTooLow,
                BTreeMap::from([("dvs".to_string(), format!("{:.3}", ctx.dvs))]),
            );
        }
        if ctx.eqs < EQS_ENTRY_MIN {
            return DecisionResult::no_trade_with(
                NoTradeReason::EqsTooLow,
                BTreeMap::from([("eqs".to_string(), format!("{:.3}", ctx.eqs))]),
            );
        }

        // Layer 4: session gates. The lunch void is a hard window block.
        if signals.lunch_void_gate == 0.0 {
            return DecisionResult::no_trade(NoTradeReason::SessionWindowBlock);
        }
        if !signals.session_phase.is_tradable() {
            return DecisionResult::no_trade(NoTradeReason::SessionNotTradable);
        }

        // Layer 5: one position at a time.
        if ctx.net_position != 0 {
            return DecisionResult::no_trade(NoTradeReason::InPosition);
        }

        // Layer 6: daily limits.
        if ctx.risk.max_trades_reached() {
            return DecisionResult::no_trade(NoTradeReason::MaxTradesReached);
        }
        if ctx.risk.in_loss_pause(ctx.timestamp) {
            return DecisionResult::no_trade(NoTradeReason::ConsecutiveLossLockout);
        }
        if ctx.risk.daily_loss_limit_hit() {
            return DecisionResult::no_trade(NoTradeReason::DailyLossLimit);
        }

        // Layer 7: cooldown since the last entry.
        if ctx.risk.in_cooldown(ctx.timestamp) {
            return DecisionResult::no_trade(NoTradeReason::CooldownActive);
        }

        // Layer 8: capital tier.
        let tier = CapitalTier::of_equity(ctx.equity_usd);
        let tier_allowed: Vec<TradeTemplate> = all_templates()
            .into_iter()
            .filter(|t| t.allowed_in(tier))
            .collect();
        if tier_allowed.is_empty() {
            return DecisionResult::no_trade(NoTradeReason::TemplateNotAllowedByTier);
        }

        // Layer 9: belief and stability gates.
        let mut viable = Vec::new();
        let mut any_belief_passed = false;
        for template in &tier_allowed {
            let Some(belief) = beliefs.get(&template.constraint_id) else {
                continue;
            };
            let threshold = ctx
                .params
                .belief_thresholds
                .get(&template.constraint_id)
                .copied()
                .unwrap_or(template.min_belief)
                .max(template.min_belief);
            if belief.effective_likelihood < threshold {
                continue;
            }
            any_belief_passed = true;
            if belief.stability > STABILITY_MAX {
                continue;
            }
            viable.push((template.clone(), belief.clone()));
        }
        if viable.is_empty() {
            let reason = if any_belief_passed {
                NoTradeReason::StabilityTooLow
            } else {
                NoTradeReason::BeliefTooLow
            };
            let meta = beliefs
                .iter()
                .map(|(cid, b)| (cid.to_string(), format!("{:.3}", b.effective_likelihood)))
                .collect();
            return DecisionResult::no_trade_with(reason, meta);
        }

        // Layer 10: EUC scoring with the friction estimate.
        // The slippage proxy's neutral point is 0.5 (risk ratio of 1); only
        // genuinely worse-than-neutral conditions count as degraded.
        let spread_proxy = signals.spread_proxy_tickiness.unwrap_or(1.0);
        let slippage_proxy = signals.slippage_risk_proxy.unwrap_or(0.5);
        let friction_usd = if spread_proxy < 0.8 || slippage_proxy < 0.4 {
            FRICTION_BASE_USD + FRICTION_DEGRADED_EXTRA_USD
        } else {
            FRICTION_BASE_USD
        };

        let mut scored = Vec::new();
        let mut all_failed_on_cost = true;
        for (template, belief) in &viable {
            let cost_modifier = ctx
                .euc_cost_modifiers
                .get(&template.id)
                .copied()
                .unwrap_or(1.0);
            let euc = Self::euc_score(
                template,
                belief.effective_likelihood,
                belief.stability,
                ctx.dvs,
                ctx.eqs,
                friction_usd * cost_modifier,
                ctx.tick_value,
            );
            if euc.edge < MIN_EDGE
                || euc.uncertainty > MAX_UNCERTAINTY
                || euc.total < ctx.threshold_adjustment
            {
                if euc.cost <= MAX_COST {
                    all_failed_on_cost = false;
                }
                continue;
            }
            if euc.cost > MAX_COST {
                continue;
            }
            all_failed_on_cost = false;
            scored.push((template.clone(), belief.clone(), euc));
        }
        if scored.is_empty() {
            let reason = if all_failed_on_cost {
                NoTradeReason::FrictionTooHigh
            } else {
                NoTradeReason::EdgeScoreBelowTheta
            };
            return DecisionResult::no_trade_with(
                reason,
                BTreeMap::from([
                    ("friction_usd".to_string(), format!("{:.2}", friction_usd)),
                    ("tier".to_string(), format!("{:?}", tier)),
                ]),
            );
        }

        // Best score wins; ties break toward the earlier template id for
        // determinism.
        scored.sort_by(|a, b| {
            b.2.total
                .partial_cmp(&a.2.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });
        let (best_template, best_belief, best_euc) = scored.remove(0);

        // Direction is bound per template.
        let Some(direction) = Self::template_direction(&best_template, signals) else {
            return DecisionResult::no_trade_with(
                NoTradeReason::MissingRequiredSignal,
                BTreeMap::from([("template".to_string(), best_template.id.to_string())]),
            );
        };

        let stop_ticks = Self::effective_stop_ticks(&best_template, tier, ctx);

        DecisionResult::Intent(Box::new(OrderIntent {
            intent_id: String::new(),
            direction,
            contracts: 1,
            entry_type: EntryType::Limit,
            entry_price: close,
            stop_ticks,
            target_ticks: best_template.target_ticks,
            template_id: best_template.id,
            euc: best_euc,
            time_stop_minutes: ctx
                .params
                .template_time_stops
                .get(&best_template.id)
                .copied()
                .unwrap_or(best_template.time_stop_minutes),
            tier,
            belief: best_belief.effective_likelihood,
            stability: best_belief.stability,
            timestamp: ctx.timestamp,
        }))
    }

    /// `effective_stop = min(constitutional, tier, template+buffer,
    /// floor(max_risk / tick_value))`. Hard invariant: never exceeded.
    pub fn effective_stop_ticks(
        template: &TradeTemplate,
        tier: CapitalTier,
        ctx: &DecisionContext<'_>,
    ) -> i64 {
        let tier_constraints = tier.constraints();
        let buffer = ctx
            .params
            .template_stop_buffers
            .get(&template.id)
            .copied()
            .unwrap_or(0);
        let template_stop = (template.stop_ticks + buffer).max(1);
        let max_risk = CONSTITUTIONAL_MAX_RISK_USD.min(tier_constraints.max_risk_usd);
        let risk_derived = (max_risk / ctx.tick_value).floor() as i64;
        CONSTITUTIONAL_MAX_STOP_TICKS
            .min(tier_constraints.max_stop_ticks)
            .min(template_stop)
            .min(risk_derived)
    }

    fn euc_score(
        template: &TradeTemplate,
        belief: f64,
        stability: f64,
        dvs: f64,
        eqs: f64,
        friction_usd: f64,
        tick_value: f64,
    ) -> EucScore {
        // Outcome-neutral haircut on belief; never let learning remove it.
        let p_lb = belief.clamp(0.0, 1.0) * 0.8;
        let edge = (template.expected_return_ticks as f64 * p_lb / 10.0).min(1.0);

        let uncertainty = (0.30 * (1.0 - dvs)
            + 0.25 * (1.0 - eqs)
            + 0.25 * stability
            + 0.20 * (1.0 - belief))
            .min(1.0);

        let expected_move_usd = template.target_ticks as f64 * tick_value;
        let cost = if expected_move_usd <= 0.0 {
            1.0
        } else {
            (friction_usd / expected_move_usd).min(1.0)
        };

        EucScore {
            edge,
            uncertainty,
            cost,
            total: edge - uncertainty - cost,
        }
    }

    /// Per-template direction binding. The mean-reversion and fade
    /// templates trade against their trigger; momentum follows it.
    fn template_direction(template: &TradeTemplate, signals: &SignalOutput) -> Option<Direction> {
        match template.id {
            TemplateId::K1 => {
                let vwap_z = signals.vwap_z?;
                Some(if vwap_z > 0.0 {
                    Direction::Short
                } else {
                    Direction::Long
                })
            }
            TemplateId::K2 => {
                // Fade the break: prefer the opening-range break direction,
                // fall back to the raw breakout distance.
                let break_dir = match signals.opening_range_break {
                    Some(b) if b != 0.0 => b,
                    _ => signals.breakout_distance_n.filter(|d| *d != 0.0)?,
                };
                Some(if break_dir > 0.0 {
                    Direction::Short
                } else {
                    Direction::Long
                })
            }
            TemplateId::K3 => {
                // Reverse the sweep: against short-term momentum.
                let micro = signals.micro_trend_5?;
                Some(if micro > 0.0 {
                    Direction::Short
                } else {
                    Direction::Long
                })
            }
            TemplateId::K4 => {
                // Follow the trend.
                let trend = signals
                    .hhll_trend_strength
                    .filter(|t| *t != 0.0)
                    .or(signals.micro_trend_5)?;
                Some(if trend >= 0.0 {
                    Direction::Long
                } else {
                    Direction::Short
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::beliefs::{BeliefSet, ConstraintId, ConstraintLikelihood};
    use crate::engine::price::{DEFAULT_TICK_SIZE, DEFAULT_TICK_VALUE};
    use crate::engine::risk::{RiskLimits, RiskTracker};
    use crate::engine::session::SessionPhase;
    use crate::engine::signals::{SignalOutput, SignalReliability};
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn ts() -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(2025, 3, 11, 10, 35, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn signals(phase: SessionPhase, vwap_z: f64) -> SignalOutput {
        SignalOutput {
            vwap_z: Some(vwap_z),
            vwap_slope: Some(0.0),
            atr_14_n: Some(1.0),
            range_compression: Some(1.0),
            hhll_trend_strength: Some(0.0),
            breakout_distance_n: Some(0.0),
            rejection_wick_n: Some(0.0),
            close_location_value: Some(0.5),
            gap_from_prev_close_n: Some(0.0),
            distance_from_poc_proxy: Some(0.0),
            micro_trend_5: Some(0.0),
            real_body_impulse_n: Some(1.0),
            vol_z: Some(0.0),
            vol_slope_20: Some(0.0),
            effort_vs_result: Some(0.0),
            range_expansion_on_volume: Some(0.0),
            climax_bar_flag: Some(0.0),
            quiet_bar_flag: Some(0.0),
            consecutive_high_vol_bars: Some(0.0),
            participation_expansion_index: Some(0.0),
            session_phase: phase,
            opening_range_break: Some(0.0),
            lunch_void_gate: if phase == SessionPhase::Lunch { 0.0 } else { 1.0 },
            close_magnet_index: Some(0.0),
            spread_proxy_tickiness: Some(1.0),
            slippage_risk_proxy: Some(0.9),
            friction_regime_index: Some(0.8),
            dvs: 0.95,
            reliability: SignalReliability {
                dvs_ok: true,
                eqs_ok: true,
                session_ok: true,
                overall_score: 0.9,
            },
            timestamp: ts(),
        }
    }

    fn belief(cid: ConstraintId, effective: f64, stability: f64) -> ConstraintLikelihood {
        ConstraintLikelihood {
            constraint_id: cid,
            evidence: 0.0,
            likelihood: effective,
            applicability: 1.0,
            effective_likelihood: effective,
            stability,
            decay_lambda: 0.96,
            bias_adjustment: 0.0,
            strategy_adjustment: 0.0,
            conflict_penalty: 0.0,
            meta_cognition_gate: 1.0,
            raw_likelihood: effective,
        }
    }

    fn beliefs_with(f1: f64, stability: f64) -> BeliefSet {
        let mut set = BeliefSet::new();
        set.insert(ConstraintId::F1, belief(ConstraintId::F1, f1, stability));
        set.insert(ConstraintId::F3, belief(ConstraintId::F3, 0.3, 0.05));
        set.insert(ConstraintId::F4, belief(ConstraintId::F4, 0.3, 0.05));
        set.insert(ConstraintId::F5, belief(ConstraintId::F5, 0.3, 0.05));
        set.insert(ConstraintId::F6, belief(ConstraintId::F6, 0.8, 0.05));
        set
    }

    struct Fixture {
        risk: RiskTracker,
        params: ParameterState,
        modifiers: BTreeMap<TemplateId, f64>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                risk: RiskTracker::new(RiskLimits::default()),
                params: ParameterState::defaults(),
                modifiers: BTreeMap::new(),
            }
        }

        fn ctx(&self) -> DecisionContext<'_> {
            DecisionContext {
                timestamp: ts(),
                equity_usd: 1000.0,
                account_ready: true,
                kill_switch_active: false,
                net_position: 0,
                dvs: 0.95,
                eqs: 0.90,
                tick_value: DEFAULT_TICK_VALUE,
                threshold_adjustment: 0.0,
                euc_cost_modifiers: &self.modifiers,
                risk: &self.risk,
                params: &self.params,
            }
        }
    }

    fn close() -> Px {
        Px::from_f64(5598.25, DEFAULT_TICK_SIZE)
    }

    #[test]
    fn test_gate_order_kill_switch_first() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.kill_switch_active = true;
        ctx.dvs = 0.0; // would also fail, but the kill switch wins
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &ctx,
            &beliefs_with(0.9, 0.05),
            &signals(SessionPhase::Lunch, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::KillSwitchActive));
    }

    #[test]
    fn test_gate_order_quality_before_session() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.dvs = 0.5;
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &ctx,
            &beliefs_with(0.9, 0.05),
            &signals(SessionPhase::Lunch, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::DvsTooLow));
    }

    #[test]
    fn test_lunch_window_block() {
        let fixture = Fixture::new();
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &fixture.ctx(),
            &beliefs_with(0.9, 0.05),
            &signals(SessionPhase::Lunch, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::SessionWindowBlock));
    }

    #[test]
    fn test_in_position_gate() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.net_position = 1;
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &ctx,
            &beliefs_with(0.9, 0.05),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::InPosition));
    }

    #[test]
    fn test_belief_too_low() {
        let fixture = Fixture::new();
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &fixture.ctx(),
            &beliefs_with(0.40, 0.05),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::BeliefTooLow));
    }

    #[test]
    fn test_stability_gate_distinct_reason() {
        let fixture = Fixture::new();
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &fixture.ctx(),
            &beliefs_with(0.80, 0.50),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::StabilityTooLow));
    }

    #[test]
    fn test_tier_s_mean_reversion_entry() {
        // Scenario: equity $1000 (tier S), F1 belief strong and stable,
        // price below VWAP.
        let fixture = Fixture::new();
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &fixture.ctx(),
            &beliefs_with(0.70, 0.10),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        let DecisionResult::Intent(intent) = result else {
            panic!("expected intent, got {:?}", result);
        };
        assert_eq!(intent.direction, Direction::Long);
        assert_eq!(intent.contracts, 1);
        assert_eq!(intent.entry_type, EntryType::Limit);
        assert_eq!(intent.template_id, TemplateId::K1);
        // min(12 constitutional, 10 tier S, 8 template, floor(12/1.25)=9) = 8
        assert_eq!(intent.stop_ticks, 8);
        assert_eq!(intent.tier, CapitalTier::S);
    }

    #[test]
    fn test_direction_follows_template_binding() {
        let fixture = Fixture::new();
        let engine = DecisionEngine::new();
        // Price above VWAP: K1 goes short.
        let result = engine.decide(
            &fixture.ctx(),
            &beliefs_with(0.70, 0.10),
            &signals(SessionPhase::MidMorning, 2.0),
            close(),
        );
        let DecisionResult::Intent(intent) = result else {
            panic!("expected intent");
        };
        assert_eq!(intent.direction, Direction::Short);
    }

    #[test]
    fn test_effective_stop_caps_property() {
        let fixture = Fixture::new();
        let ctx = fixture.ctx();
        for template in all_templates() {
            for tier in [CapitalTier::S, CapitalTier::A, CapitalTier::B] {
                let stop = DecisionEngine::effective_stop_ticks(&template, tier, &ctx);
                let tc = tier.constraints();
                assert!(stop <= CONSTITUTIONAL_MAX_STOP_TICKS);
                assert!(stop <= tc.max_stop_ticks);
                assert!(stop <= template.stop_ticks);
                let max_risk = CONSTITUTIONAL_MAX_RISK_USD.min(tc.max_risk_usd);
                assert!(stop <= (max_risk / DEFAULT_TICK_VALUE).floor() as i64);
            }
        }
    }

    #[test]
    fn test_quarantine_modifier_blocks_via_cost() {
        let mut fixture = Fixture::new();
        fixture.modifiers.insert(TemplateId::K1, 10.0);
        fixture.modifiers.insert(TemplateId::K2, 10.0);
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &fixture.ctx(),
            &beliefs_with(0.70, 0.10),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::FrictionTooHigh));
    }

    #[test]
    fn test_threshold_adjustment_rejects_marginal_scores() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.threshold_adjustment = 0.5; // impossible bar to clear
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &ctx,
            &beliefs_with(0.70, 0.10),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::EdgeScoreBelowTheta));
    }

    #[test]
    fn test_max_trades_and_cooldown_gates() {
        let mut fixture = Fixture::new();
        for _ in 0..10 {
            fixture.risk.record_entry(ts() - chrono::Duration::hours(2));
        }
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &fixture.ctx(),
            &beliefs_with(0.70, 0.10),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::MaxTradesReached));

        let mut fixture = Fixture::new();
        fixture.risk.record_entry(ts() - chrono::Duration::minutes(2));
        let result = engine.decide(
            &fixture.ctx(),
            &beliefs_with(0.70, 0.10),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::CooldownActive));
    }

    #[test]
    fn test_account_data_missing() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.account_ready = false;
        let engine = DecisionEngine::new();
        let result = engine.decide(
            &ctx,
            &beliefs_with(0.70, 0.10),
            &signals(SessionPhase::MidMorning, -2.0),
            close(),
        );
        assert_eq!(result.reason(), Some(NoTradeReason::AccountDataMissing));
    }
}
