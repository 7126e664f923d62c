//! Event Model
//!
//! Every observable fact leaves the core as an [`Event`] whose id is the
//! SHA-256 of its canonical JSON. Canonical form: object keys sorted,
//! minimal separators, UTF-8. The id doubles as the idempotency key for the
//! downstream store; appending a duplicate is a no-op by contract.
//!
//! The core does not own persistence. Events are handed to an
//! [`EventSink`]; the in-memory sink here backs replay and tests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Closed event-type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Bar1m,
    Signals1m,
    Beliefs1m,
    Decision,
    Attribution,
    Reconciliation,
    OrderIntent,
    OrderEvent,
    FillEvent,
    PositionSnapshot,
    SystemEvent,
    LearningUpdate,
    LearningFreeze,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Bar1m => "BAR_1M",
            EventType::Signals1m => "SIGNALS_1M",
            EventType::Beliefs1m => "BELIEFS_1M",
            EventType::Decision => "DECISION",
            EventType::Attribution => "ATTRIBUTION",
            EventType::Reconciliation => "RECONCILIATION",
            EventType::OrderIntent => "ORDER_INTENT",
            EventType::OrderEvent => "ORDER_EVENT",
            EventType::FillEvent => "FILL_EVENT",
            EventType::PositionSnapshot => "POSITION_SNAPSHOT",
            EventType::SystemEvent => "SYSTEM_EVENT",
            EventType::LearningUpdate => "LEARNING_UPDATE",
            EventType::LearningFreeze => "LEARNING_FREEZE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content-addressed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub stream_id: String,
    /// ISO-8601 timestamp string; one timezone policy per stream.
    pub ts: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub config_hash: String,
}

impl Event {
    /// Construct an event, deriving its id from the canonical body.
    pub fn make(
        stream_id: &str,
        ts: &str,
        event_type: EventType,
        payload: Value,
        config_hash: &str,
    ) -> Event {
        let body = serde_json::json!({
            "stream_id": stream_id,
            "ts": ts,
            "type": event_type.as_str(),
            "payload": payload,
            "config_hash": config_hash,
        });
        let event_id = sha256_hex(&canonical_json(&body));
        Event {
            event_id,
            stream_id: stream_id.to_string(),
            ts: ts.to_string(),
            event_type,
            payload,
            config_hash: config_hash.to_string(),
        }
    }

    /// Recompute the id from current contents; must equal `event_id`.
    pub fn recompute_id(&self) -> String {
        let body = serde_json::json!({
            "stream_id": self.stream_id,
            "ts": self.ts,
            "type": self.event_type.as_str(),
            "payload": self.payload,
            "config_hash": self.config_hash,
        });
        sha256_hex(&canonical_json(&body))
    }
}

/// Deterministic JSON: sorted keys, minimal whitespace. `serde_json`'s
/// default map is ordered, so re-rooting through `Value` sorts objects.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).expect("canonical serialization")
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append result from the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Appended,
    Duplicate,
}

/// The persistence contract. Idempotent on `event_id`; out-of-order and
/// duplicate submissions are safe.
pub trait EventSink: Send {
    fn append(&mut self, event: Event) -> AppendResult;
}

/// In-memory sink for replay and tests. Preserves append order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Vec<Event>,
    ids: std::collections::BTreeSet<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventSink for MemorySink {
    fn append(&mut self, event: Event) -> AppendResult {
        if !self.ids.insert(event.event_id.clone()) {
            return AppendResult::Duplicate;
        }
        self.events.push(event);
        AppendResult::Appended
    }
}
