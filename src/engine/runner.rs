//! Runner
//!
//! Thread-per-role wiring. The market thread folds raw ticks and quotes
//! into bars and pushes completed bars over a bounded channel; the decision
//! thread is a single pump that runs the orchestrator one bar at a time.
//! Broker events are polled by the supervisor inside the decision cycle,
//! serialized with fill processing.
//!
//! Shutdown drains market → decision, then cancels all open orders and
//! flattens with a bounded deadline.

use crate::engine::bars::{Bar, BarAggregator, Quote, Tick};
use crate::engine::broker::SimBroker;
use crate::engine::config::EngineConfig;
use crate::engine::events::MemorySink;
use crate::engine::execution::ExecutionSupervisor;
use crate::engine::orchestrator::Orchestrator;
use crate::engine::risk::KillSwitch;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Capacity of the bar queue between threads M and D. Backpressure is
/// explicit: a stalled decision loop blocks aggregation rather than
/// growing memory.
const BAR_QUEUE_CAPACITY: usize = 256;

/// Inbound market events, as the data adapter delivers them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarketEvent {
    Tick(Tick),
    Quote(Quote),
    /// Pre-built bar, for historical replay.
    Bar(Bar),
}

/// Market thread: aggregate the raw stream into bars.
fn run_market_thread(
    events: Receiver<MarketEvent>,
    bars_out: Sender<Bar>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("market".to_string())
        .spawn(move || {
            let mut aggregator = BarAggregator::one_minute();
            for event in events.iter() {
                match event {
                    MarketEvent::Tick(tick) => {
                        if let Some(bar) = aggregator.on_tick(tick) {
                            if bars_out.send(bar).is_err() {
                                return;
                            }
                        }
                    }
                    MarketEvent::Quote(quote) => aggregator.on_quote(quote),
                    MarketEvent::Bar(bar) => {
                        if bars_out.send(bar).is_err() {
                            return;
                        }
                    }
                }
            }
            // Input exhausted: flush the building bar so the decision loop
            // sees the final interval.
            if let Some(bar) = aggregator.flush() {
                let _ = bars_out.send(bar);
            }
        })
        .expect("spawn market thread")
}

/// Deterministic replay harness over the in-process sim broker. The same
/// ordered event sequence with the same seed parameters reproduces
/// byte-identical event ids.
pub struct ReplayRunner {
    orchestrator: Orchestrator<Arc<SimBroker>, MemorySink>,
    broker: Arc<SimBroker>,
    tick_size: f64,
}

impl ReplayRunner {
    pub fn new(config: EngineConfig, equity_usd: f64) -> Self {
        let tick_size = config.instrument.tick_size;
        let broker = Arc::new(SimBroker::new(equity_usd));
        let kill_switch = KillSwitch::new();
        let supervisor =
            ExecutionSupervisor::new(Arc::clone(&broker), Arc::clone(&kill_switch), tick_size)
                .without_managed_targets();
        let orchestrator = Orchestrator::new(config, supervisor, kill_switch, MemorySink::new());
        Self {
            orchestrator,
            broker,
            tick_size,
        }
    }

    #[inline]
    pub fn orchestrator(&self) -> &Orchestrator<Arc<SimBroker>, MemorySink> {
        &self.orchestrator
    }

    #[inline]
    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator<Arc<SimBroker>, MemorySink> {
        &mut self.orchestrator
    }

    #[inline]
    pub fn broker(&self) -> &Arc<SimBroker> {
        &self.broker
    }

    /// One decision cycle for one completed bar.
    pub fn process_bar(&mut self, bar: &Bar) {
        // The close is the interval's marketable price in replay; resting
        // legs fill against it before the cycle runs.
        self.broker.on_market_price(bar.close);
        self.orchestrator.process_bar(bar);
    }

    /// Pump a full event stream through threads M and D, then shut down in
    /// order: drain market, drain decisions, cancel and flatten.
    pub fn run(&mut self, events: Vec<MarketEvent>) -> usize {
        let (event_tx, event_rx) = bounded::<MarketEvent>(BAR_QUEUE_CAPACITY);
        let (bar_tx, bar_rx) = bounded::<Bar>(BAR_QUEUE_CAPACITY);

        let market = run_market_thread(event_rx, bar_tx);

        let feeder = thread::Builder::new()
            .name("feed".to_string())
            .spawn(move || {
                for event in events {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
                // Dropping the sender closes the market thread's input.
            })
            .expect("spawn feed thread");

        let mut bars_processed = 0usize;
        for bar in bar_rx.iter() {
            self.process_bar(&bar);
            bars_processed += 1;
        }

        feeder.join().expect("feed thread");
        market.join().expect("market thread");
        self.shutdown();
        bars_processed
    }

    /// Cancel everything and flatten. Never exits with working orders if
    /// the broker round-trip completes.
    pub fn shutdown(&mut self) {
        let supervisor = self.orchestrator.supervisor_mut();
        let canceled = supervisor.cancel_all();
        match supervisor.flatten() {
            Ok(_) => info!(canceled, "shutdown complete"),
            Err(e) => warn!(error = %e, "flatten during shutdown failed"),
        }
    }

    #[inline]
    pub fn tick_size(&self) -> f64 {
        self.tick_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::broker::BrokerAdapter;
    use crate::engine::price::{Px, DEFAULT_TICK_SIZE};
    use chrono::{TimeZone, Utc};
    use chrono_tz::America::New_York;

    fn px(p: f64) -> Px {
        Px::from_f64(p, DEFAULT_TICK_SIZE)
    }

    fn tick(min_offset: i64, p: f64, size: u64) -> MarketEvent {
        let base = New_York
            .with_ymd_and_hms(2025, 3, 11, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        MarketEvent::Tick(Tick {
            timestamp: base + chrono::Duration::seconds(min_offset * 60 + 5),
            price: px(p),
            size,
        })
    }

    fn config() -> EngineConfig {
        EngineConfig::default().normalize().unwrap()
    }

    #[test]
    fn test_ticks_aggregate_through_pipeline() {
        let mut runner = ReplayRunner::new(config(), 1000.0);
        let mut events = Vec::new();
        for i in 0..10 {
            events.push(MarketEvent::Quote(Quote {
                bid: px(5599.75),
                ask: px(5600.00),
            }));
            events.push(tick(i, 5600.0 + (i % 3) as f64 * 0.25, 100));
        }
        let processed = runner.run(events);
        // 10 minutes of ticks: 9 boundary-crossing bars plus the flush.
        assert_eq!(processed, 10);
        let sink = runner.orchestrator().sink();
        assert!(!sink.is_empty());
    }

    #[test]
    fn test_replay_reproducibility() {
        let build_events = || {
            let mut events = Vec::new();
            for i in 0..30 {
                events.push(MarketEvent::Quote(Quote {
                    bid: px(5599.75),
                    ask: px(5600.00),
                }));
                events.push(tick(i, 5600.0 + ((i * 7) % 5) as f64 * 0.25, 100 + i as u64));
            }
            events
        };
        let mut a = ReplayRunner::new(config(), 1000.0);
        a.run(build_events());
        let mut b = ReplayRunner::new(config(), 1000.0);
        b.run(build_events());

        let ids_a: Vec<&str> = a
            .orchestrator()
            .sink()
            .events()
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        let ids_b: Vec<&str> = b
            .orchestrator()
            .sink()
            .events()
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        assert_eq!(ids_a, ids_b, "replay must be byte-identical");
    }

    #[test]
    fn test_shutdown_flattens() {
        let mut runner = ReplayRunner::new(config(), 1000.0);
        runner.broker().on_market_price(px(5600.0));
        runner.shutdown();
        let position = runner
            .orchestrator_mut()
            .supervisor_mut()
            .broker_mut()
            .position_snapshot()
            .unwrap();
        assert_eq!(position.net_qty, 0);
    }
}
