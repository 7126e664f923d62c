//! Orchestrator
//!
//! Drives the bar → signals → beliefs → decision → execution → learning
//! cycle. Owns the signal, bias, belief, and decision engines, the in-trade
//! manager, and the risk tracker; the execution supervisor owns orders and
//! the position; the learning loop owns parameters.
//!
//! Per (stream, bar): exactly one BAR, one SIGNALS, one BELIEFS, and one
//! DECISION event, in that order, with at most one ORDER_INTENT.

use crate::engine::bars::Bar;
use crate::engine::beliefs::{BeliefEngine, BeliefSet, StrategyContext};
use crate::engine::bias::{BiasInputs, BiasSignalEngine};
use crate::engine::broker::BrokerAdapter;
use crate::engine::config::EngineConfig;
use crate::engine::decision::{DecisionContext, DecisionEngine, DecisionResult, OrderIntent};
use crate::engine::events::{Event, EventSink, EventType};
use crate::engine::execution::{ExecutionSupervisor, SubmitError, SupervisorEvent};
use crate::engine::in_trade::{
    ExitReason, InTradeManager, InTradeParams, TradeAction, TradeBar, TradeContext,
};
use crate::engine::learning::{LearningLoop, TradeAttribution};
use crate::engine::modifiers::{ModifierInputs, ModifierRegistry};
use crate::engine::numeric::RingBuf;
use crate::engine::params::{ParamBounds, ParamsHandle};
use crate::engine::quality::{DvsState, EqsState, MetricsSnapshot};
use crate::engine::risk::{KillSwitch, RiskTracker};
use crate::engine::session::{self, SessionPhase};
use crate::engine::signals::{SignalEngine, SignalOutput};
use crate::engine::templates::template;
use crate::engine::attribution::{
    score_post_trade, ExecutionSnapshot, ForecastSnapshot, PathSnapshot, PlanSnapshot,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one orchestrator cycle, for callers that want to inspect it.
#[derive(Debug)]
pub struct CycleResult {
    pub decision: DecisionResult,
    pub trade_closed: bool,
}

/// The engine core. Single-threaded: one bar at a time, deterministic.
pub struct Orchestrator<B: BrokerAdapter, S: EventSink> {
    config: EngineConfig,
    signal_engine: SignalEngine,
    bias_engine: BiasSignalEngine,
    belief_engine: BeliefEngine,
    decision_engine: DecisionEngine,
    modifiers: ModifierRegistry,
    in_trade: InTradeManager,
    risk: RiskTracker,
    dvs: DvsState,
    eqs: EqsState,
    params: Arc<ParamsHandle>,
    learning: LearningLoop,
    supervisor: ExecutionSupervisor<B>,
    kill_switch: Arc<KillSwitch>,
    sink: S,

    last_session_date: Option<NaiveDate>,
    last_batch_date: Option<NaiveDate>,
    last_bar_ts: Option<DateTime<Utc>>,
    last_close: Option<f64>,
    atr_window: RingBuf,
    sigma_norm: f64,
    trade_seq: u64,
    /// Open-trade bookkeeping for realized PnL.
    open_trade_pnl_usd: f64,
    execution_enabled: bool,
}

impl<B: BrokerAdapter, S: EventSink> Orchestrator<B, S> {
    pub fn new(
        config: EngineConfig,
        supervisor: ExecutionSupervisor<B>,
        kill_switch: Arc<KillSwitch>,
        sink: S,
    ) -> Self {
        let params = Arc::new(ParamsHandle::default());
        let learning = LearningLoop::new(Arc::clone(&params), ParamBounds::default());
        let tick_size = config.instrument.tick_size;
        Self {
            signal_engine: SignalEngine::new(tick_size),
            bias_engine: BiasSignalEngine::new(),
            belief_engine: BeliefEngine::new(),
            decision_engine: DecisionEngine::new(),
            modifiers: ModifierRegistry::new(0.0),
            in_trade: InTradeManager::new(),
            risk: RiskTracker::new(config.risk),
            dvs: DvsState::new(config.dvs.clone()),
            eqs: EqsState::new(config.eqs.clone()),
            params,
            learning,
            supervisor,
            kill_switch,
            sink,
            config,
            last_session_date: None,
            last_batch_date: None,
            last_bar_ts: None,
            last_close: None,
            atr_window: RingBuf::new(50),
            sigma_norm: 1.0,
            trade_seq: 0,
            open_trade_pnl_usd: 0.0,
            execution_enabled: true,
        }
    }

    #[inline]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[inline]
    pub fn supervisor_mut(&mut self) -> &mut ExecutionSupervisor<B> {
        &mut self.supervisor
    }

    #[inline]
    pub fn learning(&self) -> &LearningLoop {
        &self.learning
    }

    #[inline]
    pub fn risk(&self) -> &RiskTracker {
        &self.risk
    }

    /// Control surface: toggle order submission without touching the
    /// pipeline.
    pub fn set_execution_enabled(&mut self, enabled: bool) {
        self.execution_enabled = enabled;
    }

    /// Control surface: operator kill. Sticky until released.
    pub fn kill(&mut self, reason: &str, now: DateTime<Utc>) {
        self.kill_switch.activate(reason, now);
        self.supervisor.cancel_all();
        if let Err(e) = self.supervisor.flatten() {
            warn!(error = %e, "flatten after operator kill failed");
        }
    }

    /// Control surface: release a learning freeze.
    pub fn unfreeze_learning(&mut self) {
        self.learning.meta_mut().unfreeze();
    }

    /// Control surface: switch delayed vs real-time quality expectations.
    pub fn set_data_mode(&mut self, mode: crate::engine::config::DataMode) {
        self.config.data_mode = mode;
    }

    /// One full cycle for one completed bar.
    pub fn process_bar(&mut self, bar: &Bar) -> CycleResult {
        let ts = bar.timestamp;
        let tick_size = self.config.instrument.tick_size;
        let phase = SessionPhase::of(ts);

        self.maybe_reset_session(bar, phase);

        // Drain broker events first: fills from resting legs belong to the
        // prior interval and must be booked before this bar's decisions.
        for event in self.supervisor.on_broker_events(ts) {
            self.emit_supervisor_event(ts, &event);
        }

        // Data quality first: a structurally invalid bar forces DVS to 0
        // and no decision is made this cycle.
        let rejected_checks = bar.validate();
        let bar_invalid = !rejected_checks.is_empty();
        let dvs_metrics = self.dvs_metrics(bar);
        let dvs_result = self.dvs.on_bar(&dvs_metrics, bar_invalid);
        let eqs_metrics = self.eqs_metrics();
        let eqs_result = self.eqs.on_bar(&eqs_metrics);
        let dvs = dvs_result.value;
        let eqs = eqs_result.value;

        self.emit(
            ts,
            EventType::Bar1m,
            json!({
                "o": bar.open.to_f64(tick_size),
                "h": bar.high.to_f64(tick_size),
                "l": bar.low.to_f64(tick_size),
                "c": bar.close.to_f64(tick_size),
                "v": bar.volume,
                "tick_count": bar.tick_count,
                "dvs": dvs,
                "eqs": eqs,
                "rejected_checks": rejected_checks,
            }),
        );

        if bar_invalid {
            warn!(ts = %ts, ?rejected_checks, "bar rejected; cycle aborted");
            let decision = DecisionResult::NoTrade {
                reason: crate::engine::reasons::NoTradeReason::ConditionNotMet,
                metadata: BTreeMap::from([(
                    "rejected_checks".to_string(),
                    rejected_checks.join(","),
                )]),
            };
            self.emit_decision(ts, &decision);
            return CycleResult {
                decision,
                trade_closed: false,
            };
        }

        // Stage 1-2: signals.
        let signals = self.signal_engine.compute(bar, dvs, eqs);
        let bias = self.bias_engine.compute(
            ts,
            &BiasInputs {
                close: bar.close.to_f64(tick_size),
                high: bar.high.to_f64(tick_size),
                low: bar.low.to_f64(tick_size),
                volume: bar.volume as f64,
                vol_z: signals.vol_z,
                micro_trend_5: signals.micro_trend_5,
                hhll_trend_strength: signals.hhll_trend_strength,
                range_compression: signals.range_compression,
                climax_bar_flag: signals.climax_bar_flag,
                session_phase: phase,
                net_position: self.supervisor.position().net_qty,
            },
        );
        self.emit(
            ts,
            EventType::Signals1m,
            serde_json::to_value(&signals).expect("signals serialize"),
        );

        // Volatility state for regimes and the runner.
        if let Some(atr) = self.signal_engine.atr_14() {
            self.atr_window.push(atr);
            if self.atr_window.is_full() {
                if let Some(mean) = self.atr_window.mean() {
                    if mean > 0.0 {
                        self.sigma_norm = atr / mean;
                    }
                }
            }
        }
        self.learning
            .meta_mut()
            .update_regime(self.sigma_norm, signals.hhll_trend_strength.unwrap_or(0.0));

        // Stage 3: beliefs (enhanced path; one belief per constraint).
        let params_snapshot = self.params.load();
        let strategy_ctx = StrategyContext::default();
        let beliefs = self.belief_engine.compute_enhanced(
            &signals.as_map(),
            &bias.as_map(),
            &strategy_ctx,
            phase,
            dvs,
            eqs,
            &params_snapshot,
        );
        self.emit(
            ts,
            EventType::Beliefs1m,
            json!(beliefs
                .iter()
                .map(|(cid, b)| (cid.to_string(), json!({
                    "likelihood": b.likelihood,
                    "effective": b.effective_likelihood,
                    "applicability": b.applicability,
                    "stability": b.stability,
                })))
                .collect::<BTreeMap<_, _>>()),
        );

        // Stage 4: in-trade management before any new decision.
        let trade_closed = self.manage_open_trade(bar, &beliefs, &signals, ts);

        // Stage 5: threshold modifiers.
        let (threshold, modifier_result) = self.modifiers.effective_threshold(&ModifierInputs {
            signals: &signals,
            bias: &bias,
            strategy: &strategy_ctx,
            sigma_norm: self.sigma_norm,
        });
        debug!(threshold, active = ?modifier_result.active_modifiers, "modifiers evaluated");

        // Stage 6: the decision.
        let account = self.supervisor.broker_mut().account_snapshot();
        let (account_ready, equity_usd) = match &account {
            Ok(snapshot) => (true, snapshot.equity_usd),
            Err(_) => (false, 0.0),
        };
        let tod = Self::tod_bucket(phase);
        let cost_modifiers = self.learning.cost_modifiers(tod);
        let decision = if !self.execution_enabled {
            DecisionResult::NoTrade {
                reason: crate::engine::reasons::NoTradeReason::ExecutionDisabled,
                metadata: BTreeMap::new(),
            }
        } else if !self.config.calendar.is_market_open(ts) {
            DecisionResult::NoTrade {
                reason: crate::engine::reasons::NoTradeReason::MarketClosed,
                metadata: BTreeMap::new(),
            }
        } else if self
            .config
            .no_trade_windows
            .iter()
            .any(|w| w.contains(ts))
        {
            DecisionResult::NoTrade {
                reason: crate::engine::reasons::NoTradeReason::SessionWindowBlock,
                metadata: BTreeMap::new(),
            }
        } else {
            let ctx = DecisionContext {
                timestamp: ts,
                equity_usd,
                account_ready,
                kill_switch_active: self.kill_switch.is_active(ts),
                net_position: self.supervisor.position().net_qty,
                dvs,
                eqs,
                tick_value: self.config.instrument.tick_value_usd,
                threshold_adjustment: threshold,
                euc_cost_modifiers: &cost_modifiers,
                risk: &self.risk,
                params: &params_snapshot,
            };
            self.decision_engine.decide(&ctx, &beliefs, &signals, bar.close)
        };

        self.emit_decision(ts, &decision);

        // Stage 7: route an accepted intent to execution.
        if let DecisionResult::Intent(intent) = &decision {
            let mut intent = (**intent).clone();
            self.trade_seq += 1;
            intent.intent_id = format!(
                "{}-{}-{}",
                self.config.stream_id,
                ts.timestamp(),
                self.trade_seq
            );
            self.submit_intent(&intent, bar, &beliefs, &signals, ts, phase);
        }

        // Execution housekeeping runs every cycle.
        for event in self.supervisor.housekeeping(ts) {
            self.emit_supervisor_event(ts, &event);
        }
        if let Some(event) = self.supervisor.reconcile(ts) {
            self.emit(
                ts,
                EventType::Reconciliation,
                serde_json::to_value(&event).expect("event serializes"),
            );
        }
        let position = self.supervisor.position();
        self.emit(
            ts,
            EventType::PositionSnapshot,
            json!({
                "net_qty": position.net_qty,
                "avg_entry_price": position.avg_entry_price.map(|p| p.to_f64(tick_size)),
            }),
        );

        self.maybe_run_weekly_batch(ts);

        self.last_bar_ts = Some(ts);
        self.last_close = Some(bar.close.to_f64(tick_size));
        CycleResult {
            decision,
            trade_closed,
        }
    }

    /// The larger-budget batch runs once after the Friday close.
    fn maybe_run_weekly_batch(&mut self, ts: DateTime<Utc>) {
        use chrono::{Datelike, Timelike, Weekday};
        let local = ts.with_timezone(&chrono_tz::America::New_York);
        if local.weekday() != Weekday::Fri {
            return;
        }
        if local.hour() < 16 || (local.hour() == 16 && local.minute() < 5) {
            return;
        }
        let date = local.date_naive();
        if self.last_batch_date == Some(date) {
            return;
        }
        self.last_batch_date = Some(date);
        let result = self.learning.run_weekly_batch(ts);
        if result.applied {
            let payload = serde_json::to_value(&result).expect("result serializes");
            self.emit(ts, EventType::LearningUpdate, payload);
        }
    }

    fn maybe_reset_session(&mut self, bar: &Bar, phase: SessionPhase) {
        if !phase.in_rth() {
            return;
        }
        let date = session::session_date(bar.timestamp);
        if self.last_session_date == Some(date) {
            return;
        }
        info!(%date, "session reset");
        if let Some(close) = self.last_close {
            self.bias_engine.set_prev_close(close);
        }
        self.signal_engine.reset_session_state();
        self.belief_engine.reset_state();
        self.bias_engine.reset_session();
        self.risk.reset_daily();
        self.last_session_date = Some(date);
    }

    fn dvs_metrics(&self, bar: &Bar) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::new();
        let gap_detected = match self.last_bar_ts {
            Some(last) => (bar.timestamp - last).num_seconds() > 120,
            None => false,
        };
        metrics.set("gap_detected", gap_detected);
        metrics.set("bar_lag_seconds", 0.0);
        let missing = [bar.bid.is_none(), bar.ask.is_none()]
            .iter()
            .filter(|m| **m)
            .count() as f64;
        metrics.set("missing_fields", missing);
        if let Some(prev) = self.last_close {
            let tick_size = self.config.instrument.tick_size;
            let close = bar.close.to_f64(tick_size);
            if prev > 0.0 {
                metrics.set("price_jump_pct", ((close - prev) / prev).abs() * 100.0);
            }
        }
        metrics
    }

    fn eqs_metrics(&self) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::new();
        metrics.set("connection_state", "OK");
        metrics
    }

    fn tod_bucket(phase: SessionPhase) -> &'static str {
        match phase {
            SessionPhase::PreMarket => "premarket",
            SessionPhase::Opening => "open",
            SessionPhase::MidMorning => "mid_morning",
            SessionPhase::Lunch => "lunch",
            SessionPhase::Afternoon => "afternoon",
            SessionPhase::Close => "close",
            SessionPhase::PostRth => "post_rth",
        }
    }

    fn submit_intent(
        &mut self,
        intent: &OrderIntent,
        bar: &Bar,
        beliefs: &BeliefSet,
        signals: &SignalOutput,
        ts: DateTime<Utc>,
        phase: SessionPhase,
    ) {
        let tick_size = self.config.instrument.tick_size;
        self.emit(
            ts,
            EventType::OrderIntent,
            serde_json::to_value(intent).expect("intent serializes"),
        );

        match self.supervisor.submit(intent, ts, phase.is_tradable()) {
            Ok(outcome) => {
                self.emit(
                    ts,
                    EventType::OrderEvent,
                    serde_json::to_value(&outcome).expect("outcome serializes"),
                );
                self.risk.record_entry(ts);
                // Process immediate fills (sim and fast live paths).
                let events = self.supervisor.on_broker_events(ts);
                let mut entry_price = None;
                for event in &events {
                    self.emit_supervisor_event(ts, event);
                    if let SupervisorEvent::EntryFill { price, .. } = event {
                        entry_price = Some(price.to_f64(tick_size));
                    }
                }
                let entry_price =
                    entry_price.unwrap_or_else(|| intent.entry_price.to_f64(tick_size));
                self.start_trade(intent, entry_price, bar, beliefs, signals, ts);
            }
            Err(SubmitError::KillSwitchActive) => {
                warn!("submission refused: kill switch active");
            }
            Err(e) => {
                warn!(error = %e, "submission refused");
                self.emit(
                    ts,
                    EventType::OrderEvent,
                    json!({"rejected": e.to_string()}),
                );
            }
        }
    }

    fn start_trade(
        &mut self,
        intent: &OrderIntent,
        entry_price: f64,
        _bar: &Bar,
        beliefs: &BeliefSet,
        signals: &SignalOutput,
        ts: DateTime<Utc>,
    ) {
        let tick_size = self.config.instrument.tick_size;
        let dir = intent.direction.sign();
        let initial_stop = entry_price - dir as f64 * intent.stop_ticks as f64 * tick_size;
        let qty_total = intent.contracts;
        // Lot split: one for T1, one for T2, remainder runs. A single
        // contract exits entirely at T1.
        let (qty_a, qty_b, qty_c) = match qty_total {
            1 => (1, 0, 0),
            2 => (1, 1, 0),
            n => (1, 1, n - 2),
        };

        let params = InTradeParams {
            point_value_usd: self.config.instrument.point_value_usd,
            ..InTradeParams::default()
        };

        let ctx = TradeContext {
            trade_id: intent.intent_id.clone(),
            direction: dir,
            entry_price,
            entry_time: ts,
            initial_stop,
            qty_total,
            qty_a,
            qty_b,
            qty_c,
            template_id: intent.template_id,
            beliefs_at_entry: beliefs
                .iter()
                .map(|(cid, b)| (*cid, b.effective_likelihood))
                .collect(),
            signals_at_entry: signals
                .as_map()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            dvs_at_entry: signals.dvs,
            eqs_at_entry: signals.reliability.overall_score,
            euc_at_entry: intent.euc.total,
            params,
            r_points: 0.0,
            time_stop_minutes: intent.time_stop_minutes,
        };
        self.open_trade_pnl_usd = 0.0;
        self.in_trade.start_trade(ctx);
    }

    /// Run the in-trade state machine for this bar and route its actions.
    /// Returns true when the trade finished this cycle.
    fn manage_open_trade(
        &mut self,
        bar: &Bar,
        beliefs: &BeliefSet,
        signals: &SignalOutput,
        ts: DateTime<Utc>,
    ) -> bool {
        if !self.in_trade.is_active() {
            return false;
        }
        let tick_size = self.config.instrument.tick_size;
        let trade_bar = TradeBar {
            timestamp: ts,
            open: bar.open.to_f64(tick_size),
            high: bar.high.to_f64(tick_size),
            low: bar.low.to_f64(tick_size),
            close: bar.close.to_f64(tick_size),
        };
        let atr = self.signal_engine.atr_14().unwrap_or(1.0);
        let action = self
            .in_trade
            .on_bar(&trade_bar, beliefs, &signals.as_map(), atr);

        let ctx = self
            .in_trade
            .context()
            .cloned()
            .expect("active trade has context");
        let trade_id = ctx.trade_id.clone();
        let dir = ctx.direction as f64;
        let tick_value_usd = self.config.instrument.tick_value_usd;
        let to_usd = |points: f64, qty: i64| points / tick_size * tick_value_usd * qty as f64;

        match action {
            TradeAction::None => false,
            TradeAction::ModifyStop { new_stop } => {
                let stop_px = crate::engine::price::Px::from_f64(new_stop, tick_size);
                self.supervisor.modify_stop(&trade_id, stop_px, ts);
                for event in self.supervisor.on_broker_events(ts) {
                    self.emit_supervisor_event(ts, &event);
                }
                false
            }
            TradeAction::ScaleExit {
                qty,
                price,
                new_stop,
            } => {
                let price_px = crate::engine::price::Px::from_f64(price, tick_size);
                self.supervisor.scale_out(&trade_id, qty, price_px);
                let stop_px = crate::engine::price::Px::from_f64(new_stop, tick_size);
                self.supervisor.modify_stop(&trade_id, stop_px, ts);
                for event in self.supervisor.on_broker_events(ts) {
                    self.emit_supervisor_event(ts, &event);
                }
                self.open_trade_pnl_usd += to_usd(dir * (price - ctx.entry_price), qty);
                false
            }
            TradeAction::FullExit { qty, price, reason } => {
                if qty > 0 {
                    // The broker-side stop child may already have closed the
                    // position this interval; only exit what remains.
                    if self.supervisor.position().net_qty != 0 {
                        let price_px = crate::engine::price::Px::from_f64(price, tick_size);
                        self.supervisor.scale_out(&trade_id, qty, price_px);
                        for event in self.supervisor.on_broker_events(ts) {
                            self.emit_supervisor_event(ts, &event);
                        }
                    }
                    self.supervisor.cancel_all();
                    self.open_trade_pnl_usd += to_usd(dir * (price - ctx.entry_price), qty);
                }
                self.close_trade(reason, price, ts);
                true
            }
        }
    }

    fn close_trade(&mut self, reason: ExitReason, exit_price: f64, ts: DateTime<Utc>) {
        let Some((ctx, rt, _logs)) = self.in_trade.finish() else {
            return;
        };
        let tick_size = self.config.instrument.tick_size;
        let pnl_usd = self.open_trade_pnl_usd;

        // Attribution scores.
        let tmpl = template(ctx.template_id);
        let scores = score_post_trade(
            pnl_usd,
            &ForecastSnapshot {
                expected_return_ticks: tmpl.expected_return_ticks as f64,
                belief_probability: ctx
                    .beliefs_at_entry
                    .get(&tmpl.constraint_id)
                    .copied()
                    .unwrap_or(0.5),
                friction_usd: 4.5,
                tick_value: self.config.instrument.tick_value_usd,
            },
            &PathSnapshot {
                mae_ticks: rt.mae_points / tick_size,
                mfe_ticks: rt.mfe_points / tick_size,
                exit_reason: reason,
                time_to_exit_s: rt.bars_in_trade as f64 * 60.0,
            },
            &PlanSnapshot {
                stop_ticks: (ctx.entry_price - ctx.initial_stop).abs() / tick_size,
                target_ticks: tmpl.target_ticks as f64,
                expected_time_to_target_s: tmpl.time_stop_minutes as f64 * 60.0 / 2.0,
            },
            &ExecutionSnapshot {
                slippage_ticks: 0.5,
                expected_slippage_ticks: 0.5,
                partial_fill: false,
            },
        );

        self.emit(
            ts,
            EventType::Attribution,
            json!({
                "trade_id": ctx.trade_id,
                "template_id": ctx.template_id.to_string(),
                "pnl_usd": pnl_usd,
                "exit_reason": reason.as_str(),
                "exit_price": exit_price,
                "classification": scores.classification.as_str(),
                "edge_score": scores.edge_score,
                "luck_score": scores.luck_score,
                "execution_score": scores.execution_score,
                "learning_weight": scores.learning_weight,
                "mfe_points": rt.mfe_points,
                "mae_points": rt.mae_points,
                "bars_in_trade": rt.bars_in_trade,
            }),
        );

        // Risk counters; hard triggers engage the kill switch.
        if let Some(trigger) = self.risk.record_trade_close(pnl_usd, ts) {
            self.kill_switch.activate(trigger, ts);
            self.supervisor.cancel_all();
            if let Err(e) = self.supervisor.flatten() {
                warn!(error = %e, "flatten after risk trigger failed");
            }
        }
        self.bias_engine.record_trade_outcome(pnl_usd);

        // Learning.
        let equity = self
            .supervisor
            .broker_mut()
            .account_snapshot()
            .map(|a| a.equity_usd)
            .unwrap_or(0.0);
        let phase = SessionPhase::of(ts);
        // Delayed feeds down-weight learning contribution.
        let mode_weight = match self.config.data_mode {
            crate::engine::config::DataMode::RealTime => 1.0,
            crate::engine::config::DataMode::Delayed => 0.4,
        };
        let attribution = TradeAttribution {
            trade_id: ctx.trade_id.clone(),
            template_id: ctx.template_id,
            pnl_usd,
            beliefs_at_entry: ctx.beliefs_at_entry.clone(),
            signals_at_entry: ctx.signals_at_entry.clone(),
            learning_weight: scores.learning_weight,
            data_quality_weight: ctx.dvs_at_entry * mode_weight,
            timestamp: ts,
            time_of_day: Self::tod_bucket(phase).to_string(),
        };
        let result = self.learning.on_trade_closed(&attribution, equity, ts);
        self.emit(
            ts,
            EventType::LearningUpdate,
            serde_json::to_value(&result).expect("result serializes"),
        );
        let freeze = self.learning.meta().freeze_state().clone();
        if freeze.frozen {
            let payload = serde_json::to_value(&freeze).expect("freeze serializes");
            self.emit(ts, EventType::LearningFreeze, payload);
        }
        self.open_trade_pnl_usd = 0.0;
    }

    fn emit_decision(&mut self, ts: DateTime<Utc>, decision: &DecisionResult) {
        // One decision artifact with machine and human projections.
        let (machine, human) = match decision {
            DecisionResult::NoTrade { reason, metadata } => (
                json!({"action": "NO_TRADE", "reason": reason.as_str(), "metadata": metadata}),
                format!("no trade: {}", reason.as_str()),
            ),
            DecisionResult::Intent(intent) => (
                serde_json::to_value(intent).expect("intent serializes"),
                format!(
                    "{} {:?} x{} via {} (euc {:.3})",
                    intent.template_id, intent.direction, intent.contracts,
                    intent.entry_type_label(), intent.euc.total
                ),
            ),
        };
        self.emit(ts, EventType::Decision, json!({"machine": machine, "human": human}));
    }

    fn emit_supervisor_event(&mut self, ts: DateTime<Utc>, event: &SupervisorEvent) {
        let event_type = match event {
            SupervisorEvent::EntryFill { .. } | SupervisorEvent::ExitFill { .. } => {
                EventType::FillEvent
            }
            _ => EventType::OrderEvent,
        };
        self.emit(
            ts,
            event_type,
            serde_json::to_value(event).expect("event serializes"),
        );
    }

    fn emit(&mut self, ts: DateTime<Utc>, event_type: EventType, payload: serde_json::Value) {
        let event = Event::make(
            &self.config.stream_id,
            &ts.to_rfc3339(),
            event_type,
            payload,
            &self.config.config_hash,
        );
        self.sink.append(event);
    }
}

impl OrderIntent {
    fn entry_type_label(&self) -> &'static str {
        match self.entry_type {
            crate::engine::decision::EntryType::Limit => "LIMIT",
            crate::engine::decision::EntryType::StopLimit => "STOP_LIMIT",
        }
    }
}
