//! Bar-Driven Trading Engine Core
//!
//! Deterministic decision pipeline and in-trade management for a single
//! futures instrument.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                            │
//! │   (owns engines, drives bar → decision cycle, emits events)      │
//! └──────────────────────────────────────────────────────────────────┘
//!        │                                                  ▲
//!        ▼                                                  │
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │ BarAggregtr │──▶│ SignalEngine│──▶│ BeliefEngine│──▶│ Decision │
//! │ (thread M)  │   │ + BiasSigs  │   │  (F1..F6)   │   │  Engine  │
//! └─────────────┘   └─────────────┘   └─────────────┘   └────┬─────┘
//!                          │                                 │
//!                    ┌─────▼─────┐                     ┌─────▼──────┐
//!                    │ DVS / EQS │                     │ Execution  │
//!                    │  scorers  │                     │ Supervisor │
//!                    └───────────┘                     └─────┬──────┘
//!                                                            │
//!                    ┌──────────────┐   ┌────────────┐ ┌─────▼──────┐
//!                    │ LearningLoop │◀──│ InTrade    │ │ Broker     │
//!                    │ + MetaLearner│   │ Manager    │ │ Adapter    │
//!                    └──────────────┘   └────────────┘ └────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - All prices are tick-aligned integers ([`price::Px`]); decimal only at
//!   the instrument boundary.
//! - Floating-point folds run in fixed order; replaying the same bar
//!   sequence with the same seed parameters reproduces identical event ids.
//! - Events are content-addressed (sha256 of canonical JSON) and the sink
//!   is idempotent under that id.
//! - Learned parameters are published as immutable snapshots; readers see
//!   a complete version or none.

pub mod attribution;
pub mod bars;
pub mod beliefs;
pub mod bias;
pub mod broker;
pub mod config;
pub mod decision;
pub mod events;
pub mod execution;
pub mod in_trade;
pub mod learning;
pub mod meta;
pub mod modifiers;
pub mod numeric;
pub mod orchestrator;
pub mod params;
pub mod price;
pub mod quality;
pub mod reasons;
pub mod risk;
pub mod runner;
pub mod session;
pub mod signals;
pub mod templates;

#[cfg(test)]
mod scenario_tests;
