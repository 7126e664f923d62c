//! Execution Supervisor
//!
//! Owns every order record and the local position view. Enforces the
//! execution contract: idempotent submission keyed by intent id, no market
//! entries, bracket required, TTL on unfilled parents, and position
//! reconciliation that trips the sticky kill switch on any drift.
//!
//! State transitions for a parent order are totally ordered by the
//! execution thread; a fill is never applied to an order that has not been
//! seen as submitted.

use crate::engine::broker::{
    BrokerAdapter, BrokerError, BrokerEvent, BrokerOrderKind, BrokerOrderSpec, BrokerOrderState,
    BrokerSide,
};
use crate::engine::decision::{Direction, EntryType, OrderIntent};
use crate::engine::price::Px;
use crate::engine::risk::KillSwitch;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Default TTL for unfilled parents.
pub const DEFAULT_ORDER_TTL_SECONDS: i64 = 90;

/// Parent order lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    New,
    Submitted,
    Accepted,
    Working,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    /// States the TTL sweep may cancel from.
    #[inline]
    pub fn ttl_eligible(self) -> bool {
        matches!(
            self,
            OrderState::New | OrderState::Working | OrderState::Accepted | OrderState::Submitted
        )
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected
        )
    }
}

/// Which leg of the bracket a broker order id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum LegRole {
    Entry,
    StopChild,
    TargetChild,
    ScaleExit,
}

/// A parent order with its bracket children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentOrder {
    pub intent_id: String,
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub state: OrderState,
    pub direction: Direction,
    pub contracts: i64,
    pub entry_price: Px,
    pub stop_price: Px,
    pub target_price: Option<Px>,
    pub created_at: DateTime<Utc>,
    pub filled_qty: i64,
    pub avg_fill_price: Option<Px>,
    pub stop_child_id: Option<String>,
    pub target_child_id: Option<String>,
    pub reject_reason: Option<String>,
}

/// Local position view, owned exclusively by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub net_qty: i64,
    pub avg_entry_price: Option<Px>,
    pub realized_pnl_ticks: i64,
    pub last_fill_price: Option<Px>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Submission result. A repeat of a known intent id is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    New { order_id: String },
    IdempotentRepeat { order_id: String, filled_delta: i64 },
}

/// Typed submission failures mapped onto the no-trade reason vocabulary.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("KILL_SWITCH_ACTIVE")]
    KillSwitchActive,
    #[error("NO_MARKET_ENTRIES")]
    NoMarketEntries,
    #[error("BRACKET_REQUIRED")]
    BracketRequired,
    #[error("ACCOUNT_DATA_MISSING")]
    AccountDataMissing,
    #[error("ACCOUNT_NOT_READY")]
    AccountNotReady,
    #[error("SESSION_NOT_TRADABLE")]
    SessionNotTradable,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Notifications surfaced to the decision loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SupervisorEvent {
    EntryFill {
        intent_id: String,
        qty: i64,
        price: Px,
    },
    ExitFill {
        intent_id: String,
        qty: i64,
        price: Px,
        role: String,
    },
    OrderRejected {
        intent_id: String,
        reason: String,
    },
    OrderCanceled {
        intent_id: String,
    },
    PositionMismatch {
        local_qty: i64,
        broker_qty: i64,
    },
}

/// The supervisor. Generic over the broker seam.
pub struct ExecutionSupervisor<B: BrokerAdapter> {
    broker: B,
    kill_switch: Arc<KillSwitch>,
    tick_size: f64,
    order_ttl: Duration,
    orders: BTreeMap<String, ParentOrder>,
    /// broker_order_id → (intent_id, role)
    leg_index: BTreeMap<String, (String, LegRole)>,
    position: PositionView,
    /// Fill dedup: (order_id, qty, price ticks).
    seen_fills: BTreeSet<(String, i64, i64)>,
    next_leg_seq: u64,
    /// When false, brackets carry the stop leg only; profit-taking belongs
    /// to the in-trade manager.
    managed_targets: bool,
}

impl<B: BrokerAdapter> ExecutionSupervisor<B> {
    pub fn new(broker: B, kill_switch: Arc<KillSwitch>, tick_size: f64) -> Self {
        Self {
            broker,
            kill_switch,
            tick_size,
            order_ttl: Duration::seconds(DEFAULT_ORDER_TTL_SECONDS),
            orders: BTreeMap::new(),
            leg_index: BTreeMap::new(),
            position: PositionView::default(),
            seen_fills: BTreeSet::new(),
            next_leg_seq: 0,
            managed_targets: true,
        }
    }

    pub fn with_order_ttl(mut self, ttl: Duration) -> Self {
        self.order_ttl = ttl;
        self
    }

    /// Stop-only brackets; the in-trade manager owns profit-taking.
    pub fn without_managed_targets(mut self) -> Self {
        self.managed_targets = false;
        self
    }

    #[inline]
    pub fn position(&self) -> PositionView {
        self.position
    }

    #[inline]
    pub fn order(&self, intent_id: &str) -> Option<&ParentOrder> {
        self.orders.get(intent_id)
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    /// Submit an order intent. Idempotent on `intent_id`: the second and
    /// later submissions return the existing order with no broker call.
    pub fn submit(
        &mut self,
        intent: &OrderIntent,
        now: DateTime<Utc>,
        session_tradable: bool,
    ) -> Result<SubmitOutcome, SubmitError> {
        // Idempotency check before anything else: a repeat is not an error
        // and must produce zero side effects.
        if let Some(existing) = self.orders.get(&intent.intent_id) {
            return Ok(SubmitOutcome::IdempotentRepeat {
                order_id: existing
                    .broker_order_id
                    .clone()
                    .unwrap_or_else(|| existing.client_order_id.clone()),
                filled_delta: 0,
            });
        }

        // Contract checks.
        if !matches!(intent.entry_type, EntryType::Limit | EntryType::StopLimit) {
            return Err(SubmitError::NoMarketEntries);
        }
        if intent.stop_ticks <= 0 {
            return Err(SubmitError::BracketRequired);
        }

        // Pre-submit gate: kill switch, account data, equity, session.
        if self.kill_switch.is_active(now) {
            return Err(SubmitError::KillSwitchActive);
        }
        let account = self
            .broker
            .account_snapshot()
            .map_err(|_| SubmitError::AccountDataMissing)?;
        if account.equity_usd <= 0.0 {
            return Err(SubmitError::AccountNotReady);
        }
        if !session_tradable {
            return Err(SubmitError::SessionNotTradable);
        }

        let side = match intent.direction {
            Direction::Long => BrokerSide::Buy,
            Direction::Short => BrokerSide::Sell,
        };
        let stop_price = intent
            .entry_price
            .offset(-intent.direction.sign() * intent.stop_ticks);
        let target_price = intent
            .entry_price
            .offset(intent.direction.sign() * intent.target_ticks);

        let client_order_id = format!("{}-E", intent.intent_id);
        let spec = BrokerOrderSpec {
            client_order_id: client_order_id.clone(),
            side,
            qty: intent.contracts,
            kind: match intent.entry_type {
                EntryType::Limit => BrokerOrderKind::Limit,
                EntryType::StopLimit => BrokerOrderKind::StopLimit,
            },
            price: Some(intent.entry_price),
        };

        let mut parent = ParentOrder {
            intent_id: intent.intent_id.clone(),
            client_order_id,
            broker_order_id: None,
            state: OrderState::New,
            direction: intent.direction,
            contracts: intent.contracts,
            entry_price: intent.entry_price,
            stop_price,
            target_price: Some(target_price),
            created_at: now,
            filled_qty: 0,
            avg_fill_price: None,
            stop_child_id: None,
            target_child_id: None,
            reject_reason: None,
        };
        if !self.managed_targets {
            parent.target_price = None;
        }

        match self.broker.place_order(&spec) {
            Ok(ack) => {
                parent.broker_order_id = Some(ack.order_id.clone());
                parent.state = match ack.state {
                    BrokerOrderState::Filled => OrderState::Submitted,
                    BrokerOrderState::Rejected => OrderState::Rejected,
                    _ => OrderState::Submitted,
                };
                self.leg_index
                    .insert(ack.order_id.clone(), (intent.intent_id.clone(), LegRole::Entry));
                let order_id = ack.order_id;
                info!(intent = %intent.intent_id, order = %order_id, "entry submitted");
                self.orders.insert(intent.intent_id.clone(), parent);
                Ok(SubmitOutcome::New { order_id })
            }
            Err(BrokerError::Rejected(reason)) => {
                parent.state = OrderState::Rejected;
                parent.reject_reason = Some(reason.clone());
                self.orders.insert(intent.intent_id.clone(), parent);
                warn!(intent = %intent.intent_id, %reason, "entry rejected by broker");
                Ok(SubmitOutcome::New {
                    order_id: format!("{}-REJECTED", intent.intent_id),
                })
            }
            Err(e) => Err(SubmitError::Broker(e)),
        }
    }

    /// Process inbound broker events in order. Serialized with
    /// reconciliation on the execution thread.
    pub fn on_broker_events(&mut self, now: DateTime<Utc>) -> Vec<SupervisorEvent> {
        let events = self.broker.poll_events();
        let mut out = Vec::new();
        for event in events {
            match event {
                BrokerEvent::Fill {
                    order_id,
                    qty,
                    price,
                } => {
                    if !self.seen_fills.insert((order_id.clone(), qty, price.ticks())) {
                        warn!(order = %order_id, "duplicate fill dropped");
                        continue;
                    }
                    if let Some(ev) = self.apply_fill(&order_id, qty, price, now) {
                        out.push(ev);
                    }
                }
                BrokerEvent::OrderUpdate {
                    order_id, state, ..
                } => {
                    if let Some(ev) = self.apply_order_update(&order_id, state) {
                        out.push(ev);
                    }
                }
                BrokerEvent::PositionUpdate { .. } => {
                    // Broker totals are read during reconcile; the local
                    // view tracks our own fills.
                }
            }
        }
        out
    }

    fn apply_order_update(
        &mut self,
        broker_order_id: &str,
        state: BrokerOrderState,
    ) -> Option<SupervisorEvent> {
        let (intent_id, role) = self.leg_index.get(broker_order_id)?.clone();
        let parent = self.orders.get_mut(&intent_id)?;
        if role != LegRole::Entry {
            return None;
        }
        match state {
            BrokerOrderState::Working => {
                if parent.state == OrderState::Submitted || parent.state == OrderState::New {
                    parent.state = OrderState::Accepted;
                }
                None
            }
            BrokerOrderState::Canceled => {
                if !parent.state.is_terminal() {
                    parent.state = OrderState::Canceled;
                    return Some(SupervisorEvent::OrderCanceled {
                        intent_id: intent_id.clone(),
                    });
                }
                None
            }
            BrokerOrderState::Rejected => {
                parent.state = OrderState::Rejected;
                parent.reject_reason = Some("BROKER_REJECT".to_string());
                Some(SupervisorEvent::OrderRejected {
                    intent_id: intent_id.clone(),
                    reason: "BROKER_REJECT".to_string(),
                })
            }
            _ => None,
        }
    }

    fn apply_fill(
        &mut self,
        broker_order_id: &str,
        qty: i64,
        price: Px,
        now: DateTime<Utc>,
    ) -> Option<SupervisorEvent> {
        let (intent_id, role) = self.leg_index.get(broker_order_id)?.clone();
        match role {
            LegRole::Entry => {
                let parent = self.orders.get_mut(&intent_id)?;
                let first_fill = parent.filled_qty == 0;
                let prior_qty = parent.filled_qty;
                parent.filled_qty += qty;
                parent.avg_fill_price = Some(match parent.avg_fill_price {
                    None => price,
                    Some(prev) => {
                        // Tick-weighted average, rounded to the grid.
                        let total = prev.ticks() * prior_qty + price.ticks() * qty;
                        Px((total as f64 / parent.filled_qty as f64).round() as i64)
                    }
                });
                parent.state = if parent.filled_qty >= parent.contracts {
                    OrderState::Filled
                } else {
                    OrderState::Partial
                };

                let signed = parent.direction.sign() * qty;
                self.position.net_qty += signed;
                self.position.avg_entry_price = Some(price);
                self.position.last_fill_price = Some(price);
                if self.position.opened_at.is_none() {
                    self.position.opened_at = Some(now);
                }

                if first_fill {
                    self.spawn_bracket_children(&intent_id);
                }
                Some(SupervisorEvent::EntryFill {
                    intent_id,
                    qty,
                    price,
                })
            }
            LegRole::StopChild | LegRole::TargetChild | LegRole::ScaleExit => {
                let parent = self.orders.get_mut(&intent_id)?;
                let signed = -parent.direction.sign() * qty;
                self.position.net_qty += signed;
                self.position.last_fill_price = Some(price);
                if self.position.net_qty == 0 {
                    self.position.avg_entry_price = None;
                    self.position.opened_at = None;
                }

                // One bracket leg filling cancels the sibling.
                let sibling = match role {
                    LegRole::StopChild => parent.target_child_id.clone(),
                    LegRole::TargetChild => parent.stop_child_id.clone(),
                    LegRole::ScaleExit => None,
                    LegRole::Entry => unreachable!(),
                };
                if self.position.net_qty == 0 {
                    if let Some(sid) = sibling {
                        let _ = self.retry_cancel(&sid);
                    }
                    if let Some(parent) = self.orders.get_mut(&intent_id) {
                        parent.state = OrderState::Filled;
                    }
                }
                Some(SupervisorEvent::ExitFill {
                    intent_id,
                    qty,
                    price,
                    role: format!("{:?}", role),
                })
            }
        }
    }

    fn spawn_bracket_children(&mut self, intent_id: &str) {
        let Some(parent) = self.orders.get(intent_id) else {
            return;
        };
        let exit_side = match parent.direction {
            Direction::Long => BrokerSide::Sell,
            Direction::Short => BrokerSide::Buy,
        };
        let qty = parent.filled_qty.max(parent.contracts);
        let stop_price = parent.stop_price;
        let target_price = parent.target_price;
        let intent = intent_id.to_string();

        let stop_client_id = self.next_leg_client_id(&intent, "S");
        let stop_id = self.place_leg(
            &intent,
            LegRole::StopChild,
            BrokerOrderSpec {
                client_order_id: stop_client_id,
                side: exit_side,
                qty,
                kind: BrokerOrderKind::Stop,
                price: Some(stop_price),
            },
        );
        let target_id = match target_price {
            Some(tp) => {
                let target_client_id = self.next_leg_client_id(&intent, "T");
                self.place_leg(
                    &intent,
                    LegRole::TargetChild,
                    BrokerOrderSpec {
                        client_order_id: target_client_id,
                        side: exit_side,
                        qty,
                        kind: BrokerOrderKind::Limit,
                        price: Some(tp),
                    },
                )
            }
            None => None,
        };
        if let Some(parent) = self.orders.get_mut(&intent) {
            parent.stop_child_id = stop_id;
            parent.target_child_id = target_id;
        }
    }

    fn next_leg_client_id(&mut self, intent_id: &str, tag: &str) -> String {
        self.next_leg_seq += 1;
        format!("{}-{}-{}", intent_id, tag, self.next_leg_seq)
    }

    fn place_leg(
        &mut self,
        intent_id: &str,
        role: LegRole,
        spec: BrokerOrderSpec,
    ) -> Option<String> {
        match self.broker.place_order(&spec) {
            Ok(ack) => {
                self.leg_index
                    .insert(ack.order_id.clone(), (intent_id.to_string(), role));
                Some(ack.order_id)
            }
            Err(e) => {
                error!(intent = %intent_id, role = ?role, error = %e, "bracket leg placement failed");
                None
            }
        }
    }

    /// Replace the stop child at a new price. The caller (in-trade manager)
    /// guarantees monotonicity; a non-monotone request here is a
    /// programming error and trips the kill switch.
    pub fn modify_stop(&mut self, intent_id: &str, new_stop: Px, now: DateTime<Utc>) -> bool {
        let Some(parent) = self.orders.get(intent_id) else {
            return false;
        };
        let adverse = match parent.direction {
            Direction::Long => new_stop < parent.stop_price,
            Direction::Short => new_stop > parent.stop_price,
        };
        if adverse {
            error!(intent = %intent_id, from = ?parent.stop_price, to = ?new_stop,
                   "non-monotone stop update");
            self.kill_switch.activate("STOP_MONOTONICITY_VIOLATION", now);
            return false;
        }
        let old_stop = parent.stop_child_id.clone();
        let exit_side = match parent.direction {
            Direction::Long => BrokerSide::Sell,
            Direction::Short => BrokerSide::Buy,
        };
        let qty = self.position.net_qty.abs().max(1);
        if let Some(old) = old_stop {
            let _ = self.retry_cancel(&old);
        }
        let intent = intent_id.to_string();
        let client_order_id = self.next_leg_client_id(&intent, "S");
        let new_id = self.place_leg(
            &intent,
            LegRole::StopChild,
            BrokerOrderSpec {
                client_order_id,
                side: exit_side,
                qty,
                kind: BrokerOrderKind::Stop,
                price: Some(new_stop),
            },
        );
        if let Some(parent) = self.orders.get_mut(&intent) {
            parent.stop_child_id = new_id;
            parent.stop_price = new_stop;
        }
        true
    }

    /// Reduce the position by `qty` with a limit exit at `price`.
    pub fn scale_out(&mut self, intent_id: &str, qty: i64, price: Px) -> bool {
        let Some(parent) = self.orders.get(intent_id) else {
            return false;
        };
        let exit_side = match parent.direction {
            Direction::Long => BrokerSide::Sell,
            Direction::Short => BrokerSide::Buy,
        };
        let intent = intent_id.to_string();
        let client_order_id = self.next_leg_client_id(&intent, "X");
        self.place_leg(
            &intent,
            LegRole::ScaleExit,
            BrokerOrderSpec {
                client_order_id,
                side: exit_side,
                qty,
                kind: BrokerOrderKind::Limit,
                price: Some(price),
            },
        )
        .is_some()
    }

    /// Cancel every open order. Cancels retry once on transport error.
    pub fn cancel_all(&mut self) -> usize {
        let open = match self.broker.open_orders() {
            Ok(open) => open,
            Err(e) => {
                warn!(error = %e, "open_orders failed during cancel_all");
                return 0;
            }
        };
        let mut canceled = 0;
        for order_id in open.keys() {
            if self.retry_cancel(order_id) {
                canceled += 1;
            }
        }
        canceled
    }

    fn retry_cancel(&mut self, order_id: &str) -> bool {
        for attempt in 0..2 {
            match self.broker.cancel_order(order_id) {
                Ok(result) => return result,
                Err(BrokerError::Transport(_)) if attempt == 0 => continue,
                Err(e) => {
                    warn!(order = %order_id, error = %e, "cancel failed");
                    return false;
                }
            }
        }
        false
    }

    /// Flatten: the single path where a market order is permitted. Failures
    /// surface; no silent retry.
    pub fn flatten(&mut self) -> Result<bool, BrokerError> {
        let result = self.broker.flatten_all()?;
        if result {
            self.position.net_qty = 0;
            self.position.avg_entry_price = None;
            self.position.opened_at = None;
        }
        Ok(result)
    }

    /// Compare the local position against the broker. Any divergence trips
    /// the kill switch, cancels everything, and flattens.
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> Option<SupervisorEvent> {
        let broker_qty = loop {
            match self.broker.position_snapshot() {
                Ok(snapshot) => break snapshot.net_qty,
                Err(BrokerError::Transport(msg)) => {
                    warn!(%msg, "position read failed; retrying once");
                    match self.broker.position_snapshot() {
                        Ok(snapshot) => break snapshot.net_qty,
                        Err(_) => return None,
                    }
                }
                Err(_) => return None,
            }
        };
        if broker_qty == self.position.net_qty {
            return None;
        }
        // Snapshot the divergence before flatten zeroes the local view; the
        // event must report what was actually observed.
        let local_qty = self.position.net_qty;
        error!(local = local_qty, broker = broker_qty, "position mismatch");
        self.kill_switch.activate("POSITION_MISMATCH", now);
        self.cancel_all();
        if let Err(e) = self.flatten() {
            error!(error = %e, "flatten after mismatch failed");
        }
        Some(SupervisorEvent::PositionMismatch {
            local_qty,
            broker_qty,
        })
    }

    /// TTL sweep: cancel parents that never filled.
    pub fn housekeeping(&mut self, now: DateTime<Utc>) -> Vec<SupervisorEvent> {
        let expired: Vec<(String, Option<String>)> = self
            .orders
            .values()
            .filter(|o| o.state.ttl_eligible() && now - o.created_at > self.order_ttl)
            .map(|o| (o.intent_id.clone(), o.broker_order_id.clone()))
            .collect();
        let mut out = Vec::new();
        for (intent_id, broker_id) in expired {
            if let Some(bid) = broker_id {
                let _ = self.retry_cancel(&bid);
            }
            if let Some(parent) = self.orders.get_mut(&intent_id) {
                parent.state = OrderState::Canceled;
            }
            info!(intent = %intent_id, "order expired past TTL");
            out.push(SupervisorEvent::OrderCanceled { intent_id });
        }
        out
    }

    /// Tick-size accessor for price conversions at the boundary.
    #[inline]
    pub fn tick_size(&self) -> f64 {
        self.tick_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::broker::SimBroker;
    use crate::engine::decision::EucScore;
    use crate::engine::price::{DEFAULT_TICK_SIZE, DEFAULT_TICK_VALUE};
    use crate::engine::templates::{CapitalTier, TemplateId};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 11, 14, 35, 0).unwrap()
    }

    fn px(p: f64) -> Px {
        Px::from_f64(p, DEFAULT_TICK_SIZE)
    }

    fn intent(id: &str) -> OrderIntent {
        OrderIntent {
            intent_id: id.to_string(),
            direction: Direction::Long,
            contracts: 1,
            entry_type: EntryType::Limit,
            entry_price: px(5598.25),
            stop_ticks: 8,
            target_ticks: 16,
            template_id: TemplateId::K1,
            euc: EucScore {
                edge: 0.5,
                uncertainty: 0.1,
                cost: 0.2,
                total: 0.2,
            },
            time_stop_minutes: 30,
            tier: CapitalTier::S,
            belief: 0.7,
            stability: 0.1,
            timestamp: now(),
        }
    }

    fn supervisor() -> ExecutionSupervisor<SimBroker> {
        let broker = SimBroker::new(1000.0);
        broker.on_market_price(px(5598.25));
        ExecutionSupervisor::new(broker, KillSwitch::new(), DEFAULT_TICK_SIZE)
    }

    #[test]
    fn test_idempotent_submit() {
        let mut sup = supervisor();
        let first = sup.submit(&intent("i1"), now(), true).unwrap();
        let SubmitOutcome::New { order_id } = first else {
            panic!("expected new order");
        };
        let second = sup.submit(&intent("i1"), now(), true).unwrap();
        let SubmitOutcome::IdempotentRepeat {
            order_id: repeat_id,
            filled_delta,
        } = second
        else {
            panic!("expected idempotent repeat");
        };
        assert_eq!(order_id, repeat_id);
        assert_eq!(filled_delta, 0);
        // Exactly one placement reached the broker.
        assert_eq!(sup.broker_mut().place_order_calls(), 1);
    }

    #[test]
    fn test_bracket_children_on_entry_fill() {
        let mut sup = supervisor();
        sup.submit(&intent("i1"), now(), true).unwrap();
        let events = sup.on_broker_events(now());
        assert!(events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::EntryFill { qty: 1, .. })));
        let order = sup.order("i1").unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert!(order.stop_child_id.is_some());
        assert!(order.target_child_id.is_some());
        assert_eq!(sup.position().net_qty, 1);
        // Stop sits 8 ticks under entry, target 16 above.
        assert_eq!(order.stop_price, px(5596.25));
        assert_eq!(order.target_price, Some(px(5602.25)));
    }

    #[test]
    fn test_stop_fill_cancels_target_and_flattens() {
        let mut sup = supervisor();
        sup.submit(&intent("i1"), now(), true).unwrap();
        sup.on_broker_events(now());
        sup.broker_mut().on_market_price(px(5596.00));
        let events = sup.on_broker_events(now());
        assert!(events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::ExitFill { .. })));
        assert_eq!(sup.position().net_qty, 0);
        let open = sup.broker_mut().open_orders().unwrap();
        assert!(open.is_empty(), "sibling target must be canceled: {open:?}");
    }

    #[test]
    fn test_duplicate_fill_not_double_counted() {
        let mut sup = supervisor();
        sup.submit(&intent("i1"), now(), true).unwrap();
        sup.on_broker_events(now());
        assert_eq!(sup.position().net_qty, 1);
        // Replay the identical fill tuple directly.
        let entry_broker_id = sup.order("i1").unwrap().broker_order_id.clone().unwrap();
        let dup = BrokerEvent::Fill {
            order_id: entry_broker_id.clone(),
            qty: 1,
            price: px(5598.25),
        };
        // Push through the dedup path.
        let key = (entry_broker_id, 1, px(5598.25).ticks());
        assert!(sup.seen_fills.contains(&key));
        match dup {
            BrokerEvent::Fill { order_id, qty, price } => {
                if sup.seen_fills.insert((order_id.clone(), qty, price.ticks())) {
                    panic!("dedup set should already contain the tuple");
                }
            }
            _ => unreachable!(),
        }
        assert_eq!(sup.position().net_qty, 1);
    }

    #[test]
    fn test_reconcile_mismatch_trips_kill_switch() {
        let mut sup = supervisor();
        sup.submit(&intent("i1"), now(), true).unwrap();
        sup.on_broker_events(now());
        assert_eq!(sup.position().net_qty, 1);
        // Broker loses the position.
        sup.broker_mut().force_position(0);
        let event = sup.reconcile(now());
        assert!(matches!(
            event,
            Some(SupervisorEvent::PositionMismatch {
                local_qty: 1,
                broker_qty: 0
            })
        ));
        assert!(sup.kill_switch.is_active(now()));
        // Subsequent submissions are refused.
        let err = sup.submit(&intent("i2"), now(), true).unwrap_err();
        assert!(matches!(err, SubmitError::KillSwitchActive));
    }

    #[test]
    fn test_ttl_cancels_stale_orders() {
        let broker = SimBroker::new(1000.0);
        broker.on_market_price(px(5600.00)); // entry limit below market rests
        let mut sup = ExecutionSupervisor::new(broker, KillSwitch::new(), DEFAULT_TICK_SIZE);
        sup.submit(&intent("i1"), now(), true).unwrap();
        assert!(sup.housekeeping(now() + Duration::seconds(30)).is_empty());
        let events = sup.housekeeping(now() + Duration::seconds(120));
        assert!(matches!(
            events.as_slice(),
            [SupervisorEvent::OrderCanceled { .. }]
        ));
        assert_eq!(sup.order("i1").unwrap().state, OrderState::Canceled);
    }

    #[test]
    fn test_modify_stop_monotone_guard() {
        let mut sup = supervisor();
        sup.submit(&intent("i1"), now(), true).unwrap();
        sup.on_broker_events(now());
        // Tighten: allowed.
        assert!(sup.modify_stop("i1", px(5597.25), now()));
        assert_eq!(sup.order("i1").unwrap().stop_price, px(5597.25));
        // Loosen: programming error, kill switch.
        assert!(!sup.modify_stop("i1", px(5595.00), now()));
        assert!(sup.kill_switch.is_active(now()));
    }

    #[test]
    fn test_pre_submit_gate_blocks_untradable_session() {
        let mut sup = supervisor();
        let err = sup.submit(&intent("i1"), now(), false).unwrap_err();
        assert!(matches!(err, SubmitError::SessionNotTradable));
        assert_eq!(sup.broker_mut().place_order_calls(), 0);
    }

    #[test]
    fn test_scale_out_reduces_position() {
        let mut sup = supervisor();
        let mut big = intent("i1");
        big.contracts = 3;
        sup.submit(&big, now(), true).unwrap();
        sup.on_broker_events(now());
        assert_eq!(sup.position().net_qty, 3);
        // Marketable limit exit at the current price.
        assert!(sup.scale_out("i1", 1, px(5598.25)));
        sup.on_broker_events(now());
        assert_eq!(sup.position().net_qty, 2);
    }

    #[test]
    fn test_flatten_market_exception() {
        let mut sup = supervisor();
        sup.submit(&intent("i1"), now(), true).unwrap();
        sup.on_broker_events(now());
        assert_eq!(sup.position().net_qty, 1);
        assert!(sup.flatten().unwrap());
        assert_eq!(sup.position().net_qty, 0);
    }
}
