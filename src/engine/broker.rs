//! Broker Adapter Seam
//!
//! The execution supervisor talks to brokers only through this trait. The
//! wire protocols, auth refresh, and reconnect plumbing live in adapter
//! crates outside the core; the in-process [`SimBroker`] provides a
//! deterministic implementation for replay and tests.

use crate::engine::price::Px;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Broker-side order states reported through snapshots and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderState {
    Submitted,
    Working,
    Filled,
    Canceled,
    Rejected,
}

/// Order side at the broker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerSide {
    Buy,
    Sell,
}

impl BrokerSide {
    #[inline]
    pub fn opposite(self) -> BrokerSide {
        match self {
            BrokerSide::Buy => BrokerSide::Sell,
            BrokerSide::Sell => BrokerSide::Buy,
        }
    }

    #[inline]
    pub fn sign(self) -> i64 {
        match self {
            BrokerSide::Buy => 1,
            BrokerSide::Sell => -1,
        }
    }
}

/// Order kind at the broker boundary. Market is reserved for flatten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderKind {
    Limit,
    Stop,
    StopLimit,
    Market,
}

/// Specification sent to the broker for one order leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderSpec {
    pub client_order_id: String,
    pub side: BrokerSide,
    pub qty: i64,
    pub kind: BrokerOrderKind,
    pub price: Option<Px>,
}

/// Result of a placement call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderAck {
    pub order_id: String,
    pub state: BrokerOrderState,
}

/// Account snapshot used by the pre-submit gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity_usd: f64,
    pub buying_power_usd: f64,
    pub realized_pnl_usd: f64,
    pub unrealized_pnl_usd: f64,
}

/// Position snapshot as the broker sees it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub net_qty: i64,
    pub avg_price: Option<Px>,
}

/// Inbound broker events consumed by the execution thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerEvent {
    OrderUpdate {
        order_id: String,
        state: BrokerOrderState,
        filled_qty: i64,
        avg_fill_price: Option<Px>,
    },
    Fill {
        order_id: String,
        qty: i64,
        price: Px,
    },
    PositionUpdate {
        net_qty: i64,
    },
}

/// Transport-level failures. Retried only for cancels and position reads.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("account data unavailable")]
    AccountUnavailable,
}

/// The adapter surface. One instance per broker session; order ids are
/// unique within a session and idempotent re-submission is keyed by
/// `client_order_id`.
pub trait BrokerAdapter: Send {
    fn place_order(&mut self, spec: &BrokerOrderSpec) -> Result<PlaceOrderAck, BrokerError>;
    fn cancel_order(&mut self, order_id: &str) -> Result<bool, BrokerError>;
    /// The one permitted market action: close whatever is open.
    fn flatten_all(&mut self) -> Result<bool, BrokerError>;
    fn account_snapshot(&mut self) -> Result<AccountSnapshot, BrokerError>;
    fn position_snapshot(&mut self) -> Result<PositionSnapshot, BrokerError>;
    fn open_orders(&mut self) -> Result<BTreeMap<String, BrokerOrderState>, BrokerError>;
    /// Drain events produced since the last poll, in order.
    fn poll_events(&mut self) -> Vec<BrokerEvent>;
}

// =============================================================================
// Deterministic in-process broker
// =============================================================================

#[derive(Debug, Clone)]
struct SimOrder {
    spec: BrokerOrderSpec,
    state: BrokerOrderState,
    filled_qty: i64,
}

/// Deterministic broker for replay and tests. Limit orders rest until a
/// price cross is injected via [`SimBroker::on_market_price`]; entry limits
/// placed at or through the current price fill immediately at the limit.
#[derive(Debug, Default)]
pub struct SimBroker {
    inner: Mutex<SimInner>,
}

#[derive(Debug, Default)]
struct SimInner {
    next_order_seq: u64,
    orders: BTreeMap<String, SimOrder>,
    by_client_id: BTreeMap<String, String>,
    net_qty: i64,
    avg_price: Option<Px>,
    equity_usd: f64,
    events: Vec<BrokerEvent>,
    last_price: Option<Px>,
    pub place_order_calls: u64,
}

impl SimBroker {
    pub fn new(equity_usd: f64) -> Self {
        let broker = Self::default();
        broker.inner.lock().equity_usd = equity_usd;
        broker
    }

    /// Number of placement round-trips observed; used by the idempotency
    /// tests.
    pub fn place_order_calls(&self) -> u64 {
        self.inner.lock().place_order_calls
    }

    /// Override the broker-side position, e.g. to simulate drift.
    pub fn force_position(&self, net_qty: i64) {
        self.inner.lock().net_qty = net_qty;
    }

    /// Inject a traded price: resting orders whose trigger crosses fill.
    pub fn on_market_price(&self, price: Px) {
        let mut inner = self.inner.lock();
        inner.last_price = Some(price);
        let ids: Vec<String> = inner
            .orders
            .iter()
            .filter(|(_, o)| {
                matches!(o.state, BrokerOrderState::Working | BrokerOrderState::Submitted)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let order = inner.orders.get(&id).cloned().expect("order exists");
            let crossed = match (order.spec.kind, order.spec.price) {
                (BrokerOrderKind::Limit, Some(limit)) => match order.spec.side {
                    BrokerSide::Buy => price <= limit,
                    BrokerSide::Sell => price >= limit,
                },
                (BrokerOrderKind::Stop | BrokerOrderKind::StopLimit, Some(stop)) => {
                    match order.spec.side {
                        BrokerSide::Buy => price >= stop,
                        BrokerSide::Sell => price <= stop,
                    }
                }
                (BrokerOrderKind::Market, _) => true,
                _ => false,
            };
            if crossed {
                let fill_price = order.spec.price.unwrap_or(price);
                Self::fill_locked(&mut inner, &id, fill_price);
            }
        }
    }

    fn fill_locked(inner: &mut SimInner, order_id: &str, price: Px) {
        let order = inner.orders.get_mut(order_id).expect("order exists");
        let qty = order.spec.qty - order.filled_qty;
        if qty <= 0 {
            return;
        }
        order.filled_qty = order.spec.qty;
        order.state = BrokerOrderState::Filled;
        let signed = order.spec.side.sign() * qty;
        inner.net_qty += signed;
        inner.avg_price = Some(price);
        inner.events.push(BrokerEvent::Fill {
            order_id: order_id.to_string(),
            qty,
            price,
        });
        inner.events.push(BrokerEvent::OrderUpdate {
            order_id: order_id.to_string(),
            state: BrokerOrderState::Filled,
            filled_qty: qty,
            avg_fill_price: Some(price),
        });
        inner.events.push(BrokerEvent::PositionUpdate {
            net_qty: inner.net_qty,
        });
    }
}

impl SimBroker {
    fn place_order_impl(&self, spec: &BrokerOrderSpec) -> Result<PlaceOrderAck, BrokerError> {
        let mut inner = self.inner.lock();
        inner.place_order_calls += 1;

        // Client-side idempotency: a repeated client_order_id returns the
        // original order without a new booking.
        if let Some(existing) = inner.by_client_id.get(&spec.client_order_id) {
            let state = inner.orders[existing].state;
            return Ok(PlaceOrderAck {
                order_id: existing.clone(),
                state,
            });
        }

        inner.next_order_seq += 1;
        let order_id = format!("SIM-{:06}", inner.next_order_seq);
        inner.orders.insert(
            order_id.clone(),
            SimOrder {
                spec: spec.clone(),
                state: BrokerOrderState::Working,
                filled_qty: 0,
            },
        );
        inner
            .by_client_id
            .insert(spec.client_order_id.clone(), order_id.clone());
        inner.events.push(BrokerEvent::OrderUpdate {
            order_id: order_id.clone(),
            state: BrokerOrderState::Working,
            filled_qty: 0,
            avg_fill_price: None,
        });

        // Marketable orders execute immediately against the last price.
        let marketable = match (spec.kind, spec.price, inner.last_price) {
            (BrokerOrderKind::Market, _, Some(_)) => true,
            (BrokerOrderKind::Limit, Some(limit), Some(last)) => match spec.side {
                BrokerSide::Buy => last <= limit,
                BrokerSide::Sell => last >= limit,
            },
            _ => false,
        };
        if marketable {
            let price = match spec.kind {
                BrokerOrderKind::Market => inner.last_price.expect("marketable checked"),
                _ => spec.price.expect("limit has price"),
            };
            Self::fill_locked(&mut inner, &order_id, price);
        }

        let state = inner.orders[&order_id].state;
        Ok(PlaceOrderAck { order_id, state })
    }

    fn cancel_order_impl(&self, order_id: &str) -> Result<bool, BrokerError> {
        let mut inner = self.inner.lock();
        match inner.orders.get_mut(order_id) {
            Some(order)
                if matches!(
                    order.state,
                    BrokerOrderState::Working | BrokerOrderState::Submitted
                ) =>
            {
                order.state = BrokerOrderState::Canceled;
                inner.events.push(BrokerEvent::OrderUpdate {
                    order_id: order_id.to_string(),
                    state: BrokerOrderState::Canceled,
                    filled_qty: 0,
                    avg_fill_price: None,
                });
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    fn flatten_all_impl(&self) -> Result<bool, BrokerError> {
        let mut inner = self.inner.lock();
        let qty = inner.net_qty;
        if qty == 0 {
            return Ok(true);
        }
        let price = inner.last_price.unwrap_or(Px(0));
        inner.net_qty = 0;
        inner.avg_price = None;
        inner.events.push(BrokerEvent::PositionUpdate { net_qty: 0 });
        inner.events.push(BrokerEvent::Fill {
            order_id: "FLATTEN".to_string(),
            qty: qty.abs(),
            price,
        });
        Ok(true)
    }

    fn account_snapshot_impl(&self) -> Result<AccountSnapshot, BrokerError> {
        let inner = self.inner.lock();
        Ok(AccountSnapshot {
            equity_usd: inner.equity_usd,
            buying_power_usd: inner.equity_usd,
            realized_pnl_usd: 0.0,
            unrealized_pnl_usd: 0.0,
        })
    }

    fn position_snapshot_impl(&self) -> Result<PositionSnapshot, BrokerError> {
        let inner = self.inner.lock();
        Ok(PositionSnapshot {
            net_qty: inner.net_qty,
            avg_price: inner.avg_price,
        })
    }

    fn open_orders_impl(&self) -> Result<BTreeMap<String, BrokerOrderState>, BrokerError> {
        let inner = self.inner.lock();
        Ok(inner
            .orders
            .iter()
            .filter(|(_, o)| {
                matches!(
                    o.state,
                    BrokerOrderState::Working | BrokerOrderState::Submitted
                )
            })
            .map(|(id, o)| (id.clone(), o.state))
            .collect())
    }

    fn poll_events_impl(&self) -> Vec<BrokerEvent> {
        std::mem::take(&mut self.inner.lock().events)
    }
}

impl BrokerAdapter for SimBroker {
    fn place_order(&mut self, spec: &BrokerOrderSpec) -> Result<PlaceOrderAck, BrokerError> {
        self.place_order_impl(spec)
    }

    fn cancel_order(&mut self, order_id: &str) -> Result<bool, BrokerError> {
        self.cancel_order_impl(order_id)
    }

    fn flatten_all(&mut self) -> Result<bool, BrokerError> {
        self.flatten_all_impl()
    }

    fn account_snapshot(&mut self) -> Result<AccountSnapshot, BrokerError> {
        self.account_snapshot_impl()
    }

    fn position_snapshot(&mut self) -> Result<PositionSnapshot, BrokerError> {
        self.position_snapshot_impl()
    }

    fn open_orders(&mut self) -> Result<BTreeMap<String, BrokerOrderState>, BrokerError> {
        self.open_orders_impl()
    }

    fn poll_events(&mut self) -> Vec<BrokerEvent> {
        self.poll_events_impl()
    }
}

/// Shared handle to one sim broker: the supervisor owns one clone, the
/// replay feed drives prices through another.
impl BrokerAdapter for std::sync::Arc<SimBroker> {
    fn place_order(&mut self, spec: &BrokerOrderSpec) -> Result<PlaceOrderAck, BrokerError> {
        self.place_order_impl(spec)
    }

    fn cancel_order(&mut self, order_id: &str) -> Result<bool, BrokerError> {
        self.cancel_order_impl(order_id)
    }

    fn flatten_all(&mut self) -> Result<bool, BrokerError> {
        self.flatten_all_impl()
    }

    fn account_snapshot(&mut self) -> Result<AccountSnapshot, BrokerError> {
        self.account_snapshot_impl()
    }

    fn position_snapshot(&mut self) -> Result<PositionSnapshot, BrokerError> {
        self.position_snapshot_impl()
    }

    fn open_orders(&mut self) -> Result<BTreeMap<String, BrokerOrderState>, BrokerError> {
        self.open_orders_impl()
    }

    fn poll_events(&mut self) -> Vec<BrokerEvent> {
        self.poll_events_impl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::price::DEFAULT_TICK_SIZE;

    fn px(p: f64) -> Px {
        Px::from_f64(p, DEFAULT_TICK_SIZE)
    }

    fn limit_buy(client_id: &str, price: f64) -> BrokerOrderSpec {
        BrokerOrderSpec {
            client_order_id: client_id.to_string(),
            side: BrokerSide::Buy,
            qty: 1,
            kind: BrokerOrderKind::Limit,
            price: Some(px(price)),
        }
    }

    #[test]
    fn test_marketable_limit_fills_immediately() {
        let mut broker = SimBroker::new(1000.0);
        broker.on_market_price(px(5598.25));
        let ack = broker.place_order(&limit_buy("c1", 5598.25)).unwrap();
        assert_eq!(ack.state, BrokerOrderState::Filled);
        let pos = broker.position_snapshot().unwrap();
        assert_eq!(pos.net_qty, 1);
        assert_eq!(pos.avg_price, Some(px(5598.25)));
    }

    #[test]
    fn test_resting_limit_fills_on_cross() {
        let mut broker = SimBroker::new(1000.0);
        broker.on_market_price(px(5600.00));
        let ack = broker.place_order(&limit_buy("c1", 5598.00)).unwrap();
        assert_eq!(ack.state, BrokerOrderState::Working);
        broker.on_market_price(px(5597.75));
        let events = broker.poll_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, BrokerEvent::Fill { price, .. } if *price == px(5598.00))));
    }

    #[test]
    fn test_client_id_idempotency() {
        let mut broker = SimBroker::new(1000.0);
        broker.on_market_price(px(5600.00));
        let a = broker.place_order(&limit_buy("same", 5598.00)).unwrap();
        let b = broker.place_order(&limit_buy("same", 5598.00)).unwrap();
        assert_eq!(a.order_id, b.order_id);
        assert_eq!(broker.position_snapshot().unwrap().net_qty, 0);
    }

    #[test]
    fn test_stop_sell_triggers_below() {
        let mut broker = SimBroker::new(1000.0);
        broker.on_market_price(px(5600.00));
        broker.place_order(&limit_buy("entry", 5600.00)).unwrap();
        let stop = BrokerOrderSpec {
            client_order_id: "stop".to_string(),
            side: BrokerSide::Sell,
            qty: 1,
            kind: BrokerOrderKind::Stop,
            price: Some(px(5598.00)),
        };
        broker.place_order(&stop).unwrap();
        broker.poll_events();

        broker.on_market_price(px(5599.00));
        assert!(broker.poll_events().is_empty(), "stop not yet touched");
        broker.on_market_price(px(5597.75));
        let events = broker.poll_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, BrokerEvent::PositionUpdate { net_qty: 0 })));
    }

    #[test]
    fn test_flatten_clears_position() {
        let mut broker = SimBroker::new(1000.0);
        broker.on_market_price(px(5600.00));
        broker.place_order(&limit_buy("entry", 5600.00)).unwrap();
        assert_eq!(broker.position_snapshot().unwrap().net_qty, 1);
        broker.flatten_all().unwrap();
        assert_eq!(broker.position_snapshot().unwrap().net_qty, 0);
    }

    #[test]
    fn test_cancel_only_working_orders() {
        let mut broker = SimBroker::new(1000.0);
        broker.on_market_price(px(5600.00));
        let resting = broker.place_order(&limit_buy("r", 5598.00)).unwrap();
        assert!(broker.cancel_order(&resting.order_id).unwrap());
        assert!(!broker.cancel_order(&resting.order_id).unwrap());
        assert!(!broker.cancel_order("missing").unwrap());
    }
}
