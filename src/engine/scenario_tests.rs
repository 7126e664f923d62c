//! End-to-End Scenario Tests
//!
//! Full-pipeline scenarios: bars in, events out, nothing mocked below the
//! broker seam.

use crate::engine::bars::Bar;
use crate::engine::broker::BrokerAdapter;
use crate::engine::config::EngineConfig;
use crate::engine::decision::DecisionResult;
use crate::engine::events::EventType;
use crate::engine::price::{Px, DEFAULT_TICK_SIZE};
use crate::engine::reasons::NoTradeReason;
use crate::engine::runner::ReplayRunner;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::New_York;

fn px(p: f64) -> Px {
    Px::from_f64(p, DEFAULT_TICK_SIZE)
}

fn ny(h: u32, m: u32) -> DateTime<Utc> {
    New_York
        .with_ymd_and_hms(2025, 3, 11, h, m, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn bar_at(ts: DateTime<Utc>, o: f64, h: f64, l: f64, c: f64, v: u64) -> Bar {
    Bar {
        timestamp: ts,
        open: px(o),
        high: px(h),
        low: px(l),
        close: px(c),
        volume: v,
        tick_count: (v / 10).max(1) as u32,
        bid: Some(px(c - 0.25)),
        ask: Some(px(c)),
    }
}

fn flat_bar(ts: DateTime<Utc>) -> Bar {
    bar_at(ts, 5600.00, 5600.00, 5600.00, 5600.00, 1000)
}

fn minutes_from_open(i: u32) -> DateTime<Utc> {
    let h = 9 + (30 + i) / 60;
    let m = (30 + i) % 60;
    ny(h, m)
}

fn runner() -> ReplayRunner {
    ReplayRunner::new(EngineConfig::default().normalize().unwrap(), 1000.0)
}

// =============================================================================
// Scenario: quiet open produces structured no-trades, never orders
// =============================================================================

#[test]
fn test_quiet_open_valid_no_trade() {
    let mut runner = runner();
    let mut reasons = Vec::new();
    for i in 0..30 {
        let bar = flat_bar(minutes_from_open(i));
        runner.broker().on_market_price(bar.close);
        let result = runner.orchestrator_mut().process_bar(&bar);
        if let DecisionResult::NoTrade { reason, .. } = result.decision {
            reasons.push(reason);
        } else {
            panic!("quiet tape must not produce an intent");
        }
    }
    // Steady-state reasons are belief- or score-level rejections, not
    // constitutional failures.
    for reason in reasons[5..].iter().copied() {
        assert!(
            matches!(
                reason,
                NoTradeReason::BeliefTooLow | NoTradeReason::EdgeScoreBelowTheta
            ),
            "unexpected reason {reason}"
        );
    }
    // No order traffic at all.
    let sink = runner.orchestrator().sink();
    assert!(sink.of_type(EventType::OrderIntent).is_empty());
    assert!(sink.of_type(EventType::FillEvent).is_empty());
    // Belief stability converged.
    let beliefs_events = sink.of_type(EventType::Beliefs1m);
    let last = beliefs_events.last().unwrap();
    let f1_stability = last.payload["F1"]["stability"].as_f64().unwrap();
    assert!(f1_stability < 0.05, "stability should converge, got {f1_stability}");
}

// =============================================================================
// Scenario: tier-S mean reversion entry
// =============================================================================

#[test]
fn test_tier_s_mean_reversion_entry_end_to_end() {
    let mut runner = runner();

    // Warm up with mildly varying bars so ATR and volume stats populate.
    for i in 0..30 {
        let wiggle = (i % 3) as f64 * 0.25;
        let bar = bar_at(
            minutes_from_open(i),
            5600.00 + wiggle,
            5600.50 + wiggle,
            5599.50,
            5600.00,
            1000,
        );
        runner.process_bar(&bar);
    }

    // Persistent weakness below VWAP through mid-morning: belief in the
    // reversion hypothesis accumulates under its slow decay.
    let mut intent_seen = None;
    for i in 30..110 {
        let drop = (i - 30) as f64 * 0.25;
        let close = 5599.75 - drop * 0.2;
        let bar = bar_at(
            minutes_from_open(i),
            close + 0.50,
            close + 0.75,
            close - 0.25,
            close,
            2500,
        );
        runner.broker().on_market_price(bar.close);
        let result = runner.orchestrator_mut().process_bar(&bar);
        if let DecisionResult::Intent(intent) = result.decision {
            intent_seen = Some(intent);
            break;
        }
    }

    let intent = intent_seen.expect("sustained weakness below VWAP must eventually trade");
    assert_eq!(intent.template_id, crate::engine::templates::TemplateId::K1);
    assert_eq!(intent.direction, crate::engine::decision::Direction::Long);
    assert_eq!(intent.contracts, 1);
    assert_eq!(intent.entry_type, crate::engine::decision::EntryType::Limit);
    // min(12 constitutional, 10 tier S, 8 template, floor($12/$1.25) = 9)
    assert_eq!(intent.stop_ticks, 8);
    assert!(intent.belief >= 0.65);
    assert!(intent.stability <= 0.30);
}

// =============================================================================
// Scenario: position mismatch trips the kill switch before the next decision
// =============================================================================

#[test]
fn test_kill_switch_on_position_mismatch() {
    let mut runner = runner();
    for i in 0..30 {
        runner.process_bar(&flat_bar(minutes_from_open(i)));
    }

    // Inject broker-side drift: the broker reports a contract we do not
    // hold locally.
    runner.broker().force_position(1);
    let bar = flat_bar(minutes_from_open(30));
    runner.process_bar(&bar);

    let sink = runner.orchestrator().sink();
    let reconciliations = sink.of_type(EventType::Reconciliation);
    assert_eq!(reconciliations.len(), 1, "one mismatch event expected");

    // Every subsequent decision is refused at the first gate.
    let bar = flat_bar(minutes_from_open(31));
    runner.broker().on_market_price(bar.close);
    let result = runner.orchestrator_mut().process_bar(&bar);
    assert_eq!(
        result.decision.reason(),
        Some(NoTradeReason::KillSwitchActive)
    );
    // Broker is flat after the forced flatten.
    let position = runner
        .orchestrator_mut()
        .supervisor_mut()
        .broker_mut()
        .position_snapshot()
        .unwrap();
    assert_eq!(position.net_qty, 0);
}

// =============================================================================
// Scenario: invalid bar forces DVS to zero and aborts the cycle
// =============================================================================

#[test]
fn test_invalid_bar_aborts_cycle() {
    let mut runner = runner();
    runner.process_bar(&flat_bar(minutes_from_open(0)));

    let broken = Bar {
        open: px(5601.00), // above the high
        ..flat_bar(minutes_from_open(1))
    };
    runner.broker().on_market_price(broken.close);
    let result = runner.orchestrator_mut().process_bar(&broken);
    assert_eq!(result.decision.reason(), Some(NoTradeReason::ConditionNotMet));

    let sink = runner.orchestrator().sink();
    let bars = sink.of_type(EventType::Bar1m);
    let last = bars.last().unwrap();
    assert_eq!(last.payload["dvs"].as_f64().unwrap(), 0.0);
}

// =============================================================================
// Ordering and idempotence properties over a full run
// =============================================================================

#[test]
fn test_one_decision_per_bar_in_order() {
    let mut runner = runner();
    let n = 20;
    for i in 0..n {
        runner.process_bar(&flat_bar(minutes_from_open(i)));
    }
    let sink = runner.orchestrator().sink();
    assert_eq!(sink.of_type(EventType::Bar1m).len(), n as usize);
    assert_eq!(sink.of_type(EventType::Signals1m).len(), n as usize);
    assert_eq!(sink.of_type(EventType::Beliefs1m).len(), n as usize);
    assert_eq!(sink.of_type(EventType::Decision).len(), n as usize);

    // Within each bar, the emission order is BAR → SIGNALS → BELIEFS →
    // DECISION.
    let order: Vec<EventType> = sink
        .events()
        .iter()
        .map(|e| e.event_type)
        .filter(|t| {
            matches!(
                t,
                EventType::Bar1m
                    | EventType::Signals1m
                    | EventType::Beliefs1m
                    | EventType::Decision
            )
        })
        .collect();
    for chunk in order.chunks(4) {
        assert_eq!(
            chunk,
            [
                EventType::Bar1m,
                EventType::Signals1m,
                EventType::Beliefs1m,
                EventType::Decision
            ]
        );
    }
}

#[test]
fn test_event_ids_verify_and_config_hash_stamped() {
    let mut runner = runner();
    for i in 0..5 {
        runner.process_bar(&flat_bar(minutes_from_open(i)));
    }
    let config_hash = EngineConfig::default().normalize().unwrap().config_hash;
    for event in runner.orchestrator().sink().events() {
        assert_eq!(event.event_id, event.recompute_id());
        assert_eq!(event.config_hash, config_hash);
    }
}

// =============================================================================
// Session boundary: VWAP resets on the new date
// =============================================================================

#[test]
fn test_session_reset_across_dates() {
    let mut runner = runner();
    for i in 0..20 {
        runner.process_bar(&flat_bar(minutes_from_open(i)));
    }
    // Next trading day, first RTH bar at a different price level.
    let next_day = New_York
        .with_ymd_and_hms(2025, 3, 12, 9, 30, 0)
        .unwrap()
        .with_timezone(&Utc);
    let bar = bar_at(next_day, 5620.00, 5620.00, 5620.00, 5620.00, 1000);
    runner.process_bar(&bar);

    let sink = runner.orchestrator().sink();
    let signals = sink.of_type(EventType::Signals1m);
    let last = signals.last().unwrap();
    // First bar of the session: VWAP equals its own typical price, so the
    // distance is zero despite the 20-point jump.
    assert_eq!(last.payload["vwap_z"].as_f64(), Some(0.0));
}
