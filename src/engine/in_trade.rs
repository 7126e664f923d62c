//! In-Trade Manager
//!
//! Drives a single trade from entry to flat. Parameters are frozen at
//! entry; evidence updates every bar. The stop only ever moves in the
//! position's favor; an adverse update is a programming error surfaced to
//! the caller.
//!
//! State machine: ENTERED → PROTECTED → SCALED_1 → SCALED_2 → RUNNER → FLAT,
//! with WATCHING as the idle state. Transitions are throttled by
//! `min_bars_between_transitions`.

use crate::engine::beliefs::{BeliefSet, ConstraintId};
use crate::engine::numeric::{clamp, sigmoid, RingBuf};
use crate::engine::templates::TemplateId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Trade lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    Watching,
    Entered,
    Protected,
    Scaled1,
    Scaled2,
    Runner,
    Flat,
}

/// Why a trade closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Stop,
    Target,
    RunnerStop,
    KillSwitch,
    TimeStop,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stop => "STOP",
            ExitReason::Target => "TARGET",
            ExitReason::RunnerStop => "RUNNER_STOP",
            ExitReason::KillSwitch => "KILL_SWITCH",
            ExitReason::TimeStop => "TIME_STOP",
            ExitReason::Manual => "MANUAL",
        }
    }
}

/// In-trade management parameters, frozen into the context at entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InTradeParams {
    // Protection
    pub k_protect: f64,
    pub k_lock: f64,
    pub min_bars_before_protect: u32,
    pub theta_protect: f64,

    // Scaling in R multiples
    pub k_t1: f64,
    pub k_t2: f64,
    pub k_scale1_lock: f64,
    pub k_scale2_lock: f64,

    // Runner
    pub k_trail: f64,
    pub theta_runner_entry: f64,
    pub sigma_norm_max: f64,
    pub stale_bars_max: u32,

    // Kill switch on reversal evidence
    pub theta_kill: f64,

    // Evidence smoothing
    pub beta_smooth: f64,

    pub min_bars_between_transitions: u32,

    /// Estimated round-trip friction per contract, for the breakeven lock.
    pub friction_per_contract_usd: f64,
    /// Dollars per point for the instrument.
    pub point_value_usd: f64,
}

impl Default for InTradeParams {
    fn default() -> Self {
        Self {
            k_protect: 1.0,
            k_lock: 0.25,
            min_bars_before_protect: 3,
            theta_protect: 0.20,
            k_t1: 1.0,
            k_t2: 2.0,
            k_scale1_lock: 0.5,
            k_scale2_lock: 1.0,
            k_trail: 0.75,
            theta_runner_entry: 0.40,
            sigma_norm_max: 1.5,
            stale_bars_max: 15,
            theta_kill: 0.70,
            beta_smooth: 0.30,
            min_bars_between_transitions: 2,
            friction_per_contract_usd: 4.0,
            point_value_usd: 5.0,
        }
    }
}

/// A confirmed swing extreme.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub price: f64,
    pub bar_index: usize,
}

/// One bar in instrument points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Everything frozen at entry, handed to attribution at exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeContext {
    pub trade_id: String,
    pub direction: i64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub initial_stop: f64,
    pub qty_total: i64,
    pub qty_a: i64,
    pub qty_b: i64,
    pub qty_c: i64,
    pub template_id: TemplateId,
    pub beliefs_at_entry: BTreeMap<ConstraintId, f64>,
    pub signals_at_entry: BTreeMap<String, f64>,
    pub dvs_at_entry: f64,
    pub eqs_at_entry: f64,
    pub euc_at_entry: f64,
    pub params: InTradeParams,
    /// |entry − initial_stop|, floored at one tick.
    pub r_points: f64,
    pub time_stop_minutes: i64,
}

/// Mutable per-trade state; evidence updates every bar, parameters do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRuntime {
    pub state: TradeState,

    pub qty_remaining: i64,
    pub qty_a_remaining: i64,
    pub qty_b_remaining: i64,
    pub qty_c_remaining: i64,

    pub stop_current: f64,
    pub t1: f64,
    pub t2: f64,
    pub t1_hit: bool,
    pub t2_hit: bool,

    // Evidence components
    pub e_structure: f64,
    pub e_pullback: f64,
    pub e_momentum: f64,
    pub e_signal: f64,
    pub e_cont: f64,
    pub e_break: f64,
    pub e_mom_rev: f64,
    pub e_vol_against: f64,
    pub e_rev: f64,
    pub e_net: f64,
    pub e_net_smooth: f64,

    // Counters
    pub bars_in_trade: u32,
    pub bars_in_state: u32,
    pub bars_since_transition: u32,
    pub bars_since_new_extreme: u32,

    // Excursions in points
    pub mfe_points: f64,
    pub mae_points: f64,
    pub best_price: f64,
    pub worst_price: f64,

    pub swing_highs: Vec<SwingPoint>,
    pub swing_lows: Vec<SwingPoint>,

    pub atr: f64,
    pub sigma_norm: f64,

    pub exit_reason: Option<ExitReason>,
    pub exit_price: Option<f64>,
}

impl Default for TradeRuntime {
    fn default() -> Self {
        Self {
            state: TradeState::Watching,
            qty_remaining: 0,
            qty_a_remaining: 0,
            qty_b_remaining: 0,
            qty_c_remaining: 0,
            stop_current: 0.0,
            t1: 0.0,
            t2: 0.0,
            t1_hit: false,
            t2_hit: false,
            e_structure: 0.5,
            e_pullback: 0.5,
            e_momentum: 0.5,
            e_signal: 0.5,
            e_cont: 0.5,
            e_break: 0.0,
            e_mom_rev: 0.0,
            e_vol_against: 0.0,
            e_rev: 0.0,
            e_net: 0.0,
            e_net_smooth: 0.0,
            bars_in_trade: 0,
            bars_in_state: 0,
            bars_since_transition: 999,
            bars_since_new_extreme: 0,
            mfe_points: 0.0,
            mae_points: 0.0,
            best_price: 0.0,
            worst_price: 0.0,
            swing_highs: Vec::new(),
            swing_lows: Vec::new(),
            atr: 0.0,
            sigma_norm: 1.0,
            exit_reason: None,
            exit_price: None,
        }
    }
}

/// Instruction to the execution supervisor for this bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TradeAction {
    None,
    ModifyStop {
        new_stop: f64,
    },
    ScaleExit {
        qty: i64,
        price: f64,
        new_stop: f64,
    },
    FullExit {
        qty: i64,
        price: f64,
        reason: ExitReason,
    },
}

/// Per-bar record retained for post-trade learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeBarLog {
    pub timestamp: DateTime<Utc>,
    pub state: TradeState,
    pub close: f64,
    pub stop_current: f64,
    pub qty_remaining: i64,
    pub e_cont: f64,
    pub e_rev: f64,
    pub e_net_smooth: f64,
    pub mfe_points: f64,
    pub mae_points: f64,
    pub sigma_norm: f64,
}

// Continuation evidence weights (sum to 1).
const W_STRUCTURE: f64 = 0.30;
const W_PULLBACK: f64 = 0.25;
const W_MOMENTUM: f64 = 0.25;
const W_SIGNAL: f64 = 0.20;

// Reversal evidence weights (sum to 1).
const W_BREAK: f64 = 0.50;
const W_MOM_REV: f64 = 0.30;
const W_VOL_AGAINST: f64 = 0.20;

const SWING_CONFIRM_BARS: usize = 2;
const MIN_TICK_POINTS: f64 = 0.25;

/// Manages one trade at a time.
#[derive(Debug)]
pub struct InTradeManager {
    ctx: Option<TradeContext>,
    rt: TradeRuntime,
    atr_history: RingBuf,
    bar_highs: Vec<f64>,
    bar_lows: Vec<f64>,
    bar_logs: Vec<TradeBarLog>,
}

impl InTradeManager {
    pub fn new() -> Self {
        Self {
            ctx: None,
            rt: TradeRuntime::default(),
            atr_history: RingBuf::new(50),
            bar_highs: Vec::new(),
            bar_lows: Vec::new(),
            bar_logs: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.ctx.is_some()
            && !matches!(self.rt.state, TradeState::Watching | TradeState::Flat)
    }

    pub fn context(&self) -> Option<&TradeContext> {
        self.ctx.as_ref()
    }

    pub fn runtime(&self) -> &TradeRuntime {
        &self.rt
    }

    pub fn bar_logs(&self) -> &[TradeBarLog] {
        &self.bar_logs
    }

    /// Begin managing a new trade.
    pub fn start_trade(&mut self, mut ctx: TradeContext) {
        let r = (ctx.entry_price - ctx.initial_stop).abs().max(MIN_TICK_POINTS);
        ctx.r_points = r;
        let dir = ctx.direction as f64;

        self.rt = TradeRuntime {
            state: TradeState::Entered,
            qty_remaining: ctx.qty_total,
            qty_a_remaining: ctx.qty_a,
            qty_b_remaining: ctx.qty_b,
            qty_c_remaining: ctx.qty_c,
            stop_current: ctx.initial_stop,
            t1: ctx.entry_price + dir * ctx.params.k_t1 * r,
            t2: ctx.entry_price + dir * ctx.params.k_t2 * r,
            best_price: ctx.entry_price,
            worst_price: ctx.entry_price,
            ..TradeRuntime::default()
        };
        self.atr_history.clear();
        self.bar_highs.clear();
        self.bar_lows.clear();
        self.bar_logs.clear();

        info!(
            trade = %ctx.trade_id,
            dir = ctx.direction,
            entry = ctx.entry_price,
            stop = ctx.initial_stop,
            t1 = self.rt.t1,
            t2 = self.rt.t2,
            "trade started"
        );
        self.ctx = Some(ctx);
    }

    /// Per-bar evaluation. Actions are returned in the normative order:
    /// stop, reversal kill, time stop, scaling, transitions.
    pub fn on_bar(
        &mut self,
        bar: &TradeBar,
        beliefs: &BeliefSet,
        signals: &BTreeMap<&'static str, f64>,
        atr: f64,
    ) -> TradeAction {
        if !self.is_active() {
            return TradeAction::None;
        }
        let ctx = self.ctx.clone().expect("active trade has context");
        let params = ctx.params;

        // 1. Volatility state.
        self.rt.atr = atr.max(0.5);
        self.atr_history.push(self.rt.atr);
        if self.atr_history.is_full() {
            if let Some(mean) = self.atr_history.mean() {
                if mean > 0.0 {
                    self.rt.sigma_norm = self.rt.atr / mean;
                }
            }
        }

        // 2. Swing detection on the growing bar history.
        self.bar_highs.push(bar.high);
        self.bar_lows.push(bar.low);
        self.detect_swings();

        // 3. Excursions and staleness counters.
        self.update_excursions(&ctx, bar);
        self.rt.bars_in_trade += 1;
        self.rt.bars_in_state += 1;
        self.rt.bars_since_transition = self.rt.bars_since_transition.saturating_add(1);

        // 4-8. Evidence.
        self.compute_evidence(&ctx, bar, beliefs, signals);

        let log = TradeBarLog {
            timestamp: bar.timestamp,
            state: self.rt.state,
            close: bar.close,
            stop_current: self.rt.stop_current,
            qty_remaining: self.rt.qty_remaining,
            e_cont: self.rt.e_cont,
            e_rev: self.rt.e_rev,
            e_net_smooth: self.rt.e_net_smooth,
            mfe_points: self.rt.mfe_points,
            mae_points: self.rt.mae_points,
            sigma_norm: self.rt.sigma_norm,
        };
        self.bar_logs.push(log);

        // Action ladder.
        if self.stop_hit(&ctx, bar) {
            return self.exit_trade(ExitReason::Stop, self.rt.stop_current);
        }
        if self.rt.e_rev > params.theta_kill {
            return self.exit_trade(ExitReason::KillSwitch, bar.close);
        }
        if ctx.time_stop_minutes > 0 && self.rt.bars_in_trade as i64 >= ctx.time_stop_minutes {
            return self.exit_trade(ExitReason::TimeStop, bar.close);
        }

        let scale = self.handle_scaling(&ctx, bar);
        if !matches!(scale, TradeAction::None) {
            return scale;
        }

        self.handle_transitions(&ctx, bar)
    }

    fn compute_evidence(
        &mut self,
        ctx: &TradeContext,
        bar: &TradeBar,
        beliefs: &BeliefSet,
        signals: &BTreeMap<&'static str, f64>,
    ) {
        let dir = ctx.direction as f64;
        let params = ctx.params;

        // Structure from the reversion and fade constraints.
        let f1 = beliefs.get(&ConstraintId::F1).map(|b| b.effective_likelihood);
        let f3 = beliefs.get(&ConstraintId::F3).map(|b| b.effective_likelihood);
        self.rt.e_structure = match (f1, f3) {
            (Some(a), Some(b)) => 0.6 * a + 0.4 * b,
            (Some(a), None) => a,
            _ => 0.5,
        };

        // Pullback quality from the excursion ratio.
        self.rt.e_pullback = if self.rt.mfe_points > MIN_TICK_POINTS {
            (1.0 - 2.0 * self.rt.mae_points / self.rt.mfe_points).max(0.0)
        } else {
            0.5
        };

        // Momentum from F4, with an ATR-drift fallback.
        self.rt.e_momentum = match beliefs.get(&ConstraintId::F4) {
            Some(b) => b.effective_likelihood,
            None if self.rt.atr > 0.0 => {
                let drift = dir * (bar.close - ctx.entry_price) / self.rt.atr;
                sigmoid(2.0 * drift)
            }
            None => 0.5,
        };

        // Direction-aligned mean of the current signal record.
        self.rt.e_signal = if signals.is_empty() {
            0.5
        } else {
            let mean = signals.values().sum::<f64>() / signals.len() as f64;
            sigmoid(1.5 * dir * mean)
        };

        self.rt.e_cont = clamp(
            W_STRUCTURE * self.rt.e_structure
                + W_PULLBACK * self.rt.e_pullback
                + W_MOMENTUM * self.rt.e_momentum
                + W_SIGNAL * self.rt.e_signal,
            0.0,
            1.0,
        );

        // Reversal: close beyond the last confirmed adverse swing.
        self.rt.e_break = 0.0;
        if ctx.direction == 1 {
            if let Some(swing) = self.rt.swing_lows.last() {
                if bar.close < swing.price {
                    self.rt.e_break = 1.0;
                }
            }
        } else if let Some(swing) = self.rt.swing_highs.last() {
            if bar.close > swing.price {
                self.rt.e_break = 1.0;
            }
        }

        self.rt.e_mom_rev = if self.rt.atr > 0.0 {
            let drift = dir * (bar.close - ctx.entry_price) / self.rt.atr;
            sigmoid(-2.0 * drift)
        } else {
            0.5
        };

        let delta_p = dir * (bar.close - bar.open);
        self.rt.e_vol_against = if delta_p < 0.0 && self.rt.sigma_norm > 1.3 {
            (delta_p.abs() / self.rt.atr.max(0.5)).min(1.0)
        } else {
            0.0
        };

        self.rt.e_rev = clamp(
            W_BREAK * self.rt.e_break
                + W_MOM_REV * self.rt.e_mom_rev
                + W_VOL_AGAINST * self.rt.e_vol_against,
            0.0,
            1.0,
        );

        // Staleness decay on continuation only.
        let stale = 1.0
            - self.rt.bars_since_new_extreme as f64 / params.stale_bars_max.max(1) as f64;
        let e_cont_adj = self.rt.e_cont * stale.max(0.0);
        self.rt.e_net = clamp(e_cont_adj - self.rt.e_rev, -1.0, 1.0);
        self.rt.e_net_smooth = clamp(
            params.beta_smooth * self.rt.e_net + (1.0 - params.beta_smooth) * self.rt.e_net_smooth,
            -1.0,
            1.0,
        );
    }

    /// A local extreme confirmed `SWING_CONFIRM_BARS` later, strictly beyond
    /// its neighbors on both sides.
    fn detect_swings(&mut self) {
        let n = SWING_CONFIRM_BARS;
        let len = self.bar_highs.len();
        if len < 2 * n + 1 {
            return;
        }
        let mid = len - 1 - n;

        let mid_high = self.bar_highs[mid];
        let is_swing_high = (mid - n..=mid + n)
            .filter(|&i| i != mid)
            .all(|i| self.bar_highs[i] < mid_high);
        if is_swing_high {
            self.rt.swing_highs.push(SwingPoint {
                price: mid_high,
                bar_index: mid,
            });
        }

        let mid_low = self.bar_lows[mid];
        let is_swing_low = (mid - n..=mid + n)
            .filter(|&i| i != mid)
            .all(|i| self.bar_lows[i] > mid_low);
        if is_swing_low {
            self.rt.swing_lows.push(SwingPoint {
                price: mid_low,
                bar_index: mid,
            });
        }
    }

    fn update_excursions(&mut self, ctx: &TradeContext, bar: &TradeBar) {
        if ctx.direction == 1 {
            if bar.high > self.rt.best_price {
                self.rt.best_price = bar.high;
                self.rt.bars_since_new_extreme = 0;
            } else {
                self.rt.bars_since_new_extreme += 1;
            }
            self.rt.worst_price = self.rt.worst_price.min(bar.low);
        } else {
            if bar.low < self.rt.best_price {
                self.rt.best_price = bar.low;
                self.rt.bars_since_new_extreme = 0;
            } else {
                self.rt.bars_since_new_extreme += 1;
            }
            self.rt.worst_price = self.rt.worst_price.max(bar.high);
        }
        let dir = ctx.direction as f64;
        self.rt.mfe_points = (dir * (self.rt.best_price - ctx.entry_price)).max(0.0);
        self.rt.mae_points = (-dir * (self.rt.worst_price - ctx.entry_price)).max(0.0);
    }

    fn stop_hit(&self, ctx: &TradeContext, bar: &TradeBar) -> bool {
        if ctx.direction == 1 {
            bar.low <= self.rt.stop_current || bar.open <= self.rt.stop_current
        } else {
            bar.high >= self.rt.stop_current || bar.open >= self.rt.stop_current
        }
    }

    fn handle_scaling(&mut self, ctx: &TradeContext, bar: &TradeBar) -> TradeAction {
        let params = ctx.params;

        if !self.rt.t1_hit && self.rt.qty_a_remaining > 0 {
            let hit = if ctx.direction == 1 {
                bar.high >= self.rt.t1
            } else {
                bar.low <= self.rt.t1
            };
            if hit {
                self.rt.t1_hit = true;
                let qty = self.rt.qty_a_remaining;
                self.rt.qty_a_remaining = 0;
                self.rt.qty_remaining -= qty;
                let new_stop = self.lock_stop(ctx, params.k_scale1_lock);
                if matches!(self.rt.state, TradeState::Entered | TradeState::Protected) {
                    self.transition_to(TradeState::Scaled1);
                }
                return TradeAction::ScaleExit {
                    qty,
                    price: self.rt.t1,
                    new_stop,
                };
            }
        }

        if self.rt.t1_hit && !self.rt.t2_hit && self.rt.qty_b_remaining > 0 {
            let hit = if ctx.direction == 1 {
                bar.high >= self.rt.t2
            } else {
                bar.low <= self.rt.t2
            };
            if hit {
                self.rt.t2_hit = true;
                let qty = self.rt.qty_b_remaining;
                self.rt.qty_b_remaining = 0;
                self.rt.qty_remaining -= qty;
                let new_stop = self.lock_stop(ctx, params.k_scale2_lock);
                self.transition_to(TradeState::Scaled2);
                return TradeAction::ScaleExit {
                    qty,
                    price: self.rt.t2,
                    new_stop,
                };
            }
        }

        TradeAction::None
    }

    /// Tighten the stop to lock `k_lock` R. Monotone: never retreats.
    fn lock_stop(&mut self, ctx: &TradeContext, k_lock: f64) -> f64 {
        let dir = ctx.direction as f64;
        let lock = ctx.entry_price + dir * k_lock * ctx.r_points;
        let new_stop = if ctx.direction == 1 {
            self.rt.stop_current.max(lock)
        } else {
            self.rt.stop_current.min(lock)
        };
        debug_assert!(self.stop_not_worse(ctx, new_stop));
        self.rt.stop_current = new_stop;
        new_stop
    }

    fn handle_transitions(&mut self, ctx: &TradeContext, bar: &TradeBar) -> TradeAction {
        let params = ctx.params;
        let can_transition =
            self.rt.bars_since_transition >= params.min_bars_between_transitions;

        if self.rt.state == TradeState::Entered && can_transition && self.should_protect(ctx, bar)
        {
            let new_stop = self.protection_stop(ctx);
            self.transition_to(TradeState::Protected);
            return TradeAction::ModifyStop { new_stop };
        }

        if self.rt.state == TradeState::Scaled2 && can_transition {
            if self.runner_eligible(ctx) {
                self.transition_to(TradeState::Runner);
            } else {
                return self.exit_trade(ExitReason::Target, bar.close);
            }
        }

        if self.rt.state == TradeState::Runner {
            let trail = self.runner_trail(ctx);
            if self.stop_strictly_better(ctx, trail) {
                self.rt.stop_current = trail;
                return TradeAction::ModifyStop { new_stop: trail };
            }
        }

        TradeAction::None
    }

    fn should_protect(&self, ctx: &TradeContext, bar: &TradeBar) -> bool {
        let params = ctx.params;
        if self.rt.bars_in_trade < params.min_bars_before_protect {
            return false;
        }
        let dir = ctx.direction as f64;
        let r_progress = dir * (bar.close - ctx.entry_price) / ctx.r_points;
        r_progress >= params.k_protect && self.rt.e_net_smooth >= params.theta_protect
    }

    /// Protection stop: max(current, breakeven + friction, k_lock · R).
    fn protection_stop(&mut self, ctx: &TradeContext) -> f64 {
        let params = ctx.params;
        let dir = ctx.direction as f64;
        let qty = self.rt.qty_remaining.max(1) as f64;
        let friction_points =
            params.friction_per_contract_usd / (qty * params.point_value_usd);
        let breakeven = ctx.entry_price + dir * friction_points;
        let lock = ctx.entry_price + dir * params.k_lock * ctx.r_points;
        let new_stop = if ctx.direction == 1 {
            self.rt.stop_current.max(breakeven).max(lock)
        } else {
            self.rt.stop_current.min(breakeven).min(lock)
        };
        debug_assert!(self.stop_not_worse(ctx, new_stop));
        self.rt.stop_current = new_stop;
        new_stop
    }

    fn runner_eligible(&self, ctx: &TradeContext) -> bool {
        let params = ctx.params;
        self.rt.sigma_norm <= params.sigma_norm_max
            && self.rt.e_net_smooth >= params.theta_runner_entry
            && self.rt.qty_remaining > 0
    }

    /// Trail off the best confirmed adverse swing with an evidence-adaptive
    /// ATR buffer.
    fn runner_trail(&self, ctx: &TradeContext) -> f64 {
        let params = ctx.params;
        let e01 = (self.rt.e_net_smooth + 1.0) / 2.0;
        let buffer = params.k_trail * (0.5 + 0.5 * e01) * self.rt.atr;
        if ctx.direction == 1 {
            let base = self
                .rt
                .swing_lows
                .iter()
                .map(|s| s.price)
                .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.max(p))))
                .unwrap_or(self.rt.best_price - self.rt.atr);
            base - buffer
        } else {
            let base = self
                .rt
                .swing_highs
                .iter()
                .map(|s| s.price)
                .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.min(p))))
                .unwrap_or(self.rt.best_price + self.rt.atr);
            base + buffer
        }
    }

    fn stop_strictly_better(&self, ctx: &TradeContext, new_stop: f64) -> bool {
        if ctx.direction == 1 {
            new_stop > self.rt.stop_current
        } else {
            new_stop < self.rt.stop_current
        }
    }

    fn stop_not_worse(&self, ctx: &TradeContext, new_stop: f64) -> bool {
        if ctx.direction == 1 {
            new_stop >= self.rt.stop_current
        } else {
            new_stop <= self.rt.stop_current
        }
    }

    fn transition_to(&mut self, state: TradeState) {
        self.rt.state = state;
        self.rt.bars_in_state = 0;
        self.rt.bars_since_transition = 0;
    }

    fn exit_trade(&mut self, reason: ExitReason, price: f64) -> TradeAction {
        let qty = self.rt.qty_remaining;
        self.rt.qty_remaining = 0;
        self.rt.qty_a_remaining = 0;
        self.rt.qty_b_remaining = 0;
        self.rt.qty_c_remaining = 0;
        self.rt.exit_reason = Some(reason);
        self.rt.exit_price = Some(price);
        self.rt.state = TradeState::Flat;
        info!(reason = reason.as_str(), price, qty, "trade exited");
        TradeAction::FullExit { qty, price, reason }
    }

    /// Drop the trade after the learning loop has consumed the history.
    pub fn finish(&mut self) -> Option<(TradeContext, TradeRuntime, Vec<TradeBarLog>)> {
        let ctx = self.ctx.take()?;
        let rt = std::mem::take(&mut self.rt);
        let logs = std::mem::take(&mut self.bar_logs);
        self.rt.state = TradeState::Watching;
        Some((ctx, rt, logs))
    }
}

impl Default for InTradeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for TradeState {
    fn default() -> Self {
        TradeState::Watching
    }
}
