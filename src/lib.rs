//! MES Bot Backend Library
//!
//! Exposes the engine core for use by the binary and tests. The engine is
//! broker-agnostic: live adapters implement [`engine::broker::BrokerAdapter`]
//! and persistence implements [`engine::events::EventSink`].

pub mod engine;

// Re-export the high-traffic types for downstream callers.
pub use engine::bars::{Bar, BarAggregator, Quote, Tick};
pub use engine::broker::{BrokerAdapter, SimBroker};
pub use engine::config::EngineConfig;
pub use engine::decision::{DecisionResult, Direction, OrderIntent};
pub use engine::events::{AppendResult, Event, EventSink, EventType, MemorySink};
pub use engine::orchestrator::Orchestrator;
pub use engine::price::Px;
pub use engine::runner::{MarketEvent, ReplayRunner};
