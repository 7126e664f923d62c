//! Engine Configuration
//!
//! The frozen, normalized tree of contracts the engine runs under.
//! Normalization happens exactly once at load: rule lists get validated for
//! unique non-empty ids, calendar date lists are deduplicated and sorted,
//! and the result is hashed into `config_hash`, which stamps every emitted
//! event. Normalization is idempotent.

use crate::engine::events::{canonical_json, sha256_hex};
use crate::engine::quality::{default_dvs_config, default_eqs_config, ScoreConfig};
use crate::engine::risk::RiskLimits;
use crate::engine::session::{NoTradeWindow, SessionCalendar};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Instrument identity and economics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub tick_size: f64,
    pub tick_value_usd: f64,
    pub point_value_usd: f64,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            symbol: "MES".to_string(),
            tick_size: 0.25,
            tick_value_usd: 1.25,
            point_value_usd: 5.0,
        }
    }
}

/// Data-quality expectations by feed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataMode {
    RealTime,
    Delayed,
}

/// The full normalized configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub stream_id: String,
    pub instrument: Instrument,
    pub dvs: ScoreConfig,
    pub eqs: ScoreConfig,
    pub risk: RiskLimits,
    pub no_trade_windows: Vec<NoTradeWindow>,
    pub calendar: SessionCalendar,
    pub data_mode: DataMode,
    /// SHA-256 of the canonical normalized tree; filled by `normalize`.
    #[serde(default)]
    pub config_hash: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_id: "MES_1M".to_string(),
            instrument: Instrument::default(),
            dvs: default_dvs_config(),
            eqs: default_eqs_config(),
            risk: RiskLimits::default(),
            no_trade_windows: Vec::new(),
            calendar: SessionCalendar::default(),
            data_mode: DataMode::RealTime,
            config_hash: String::new(),
        }
    }
}

/// Configuration rejection. Unknown shapes fail closed at load time.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("rule id empty in {list}")]
    EmptyRuleId { list: &'static str },
    #[error("duplicate rule id '{id}' in {list}")]
    DuplicateRuleId { list: &'static str, id: String },
    #[error("rule '{id}' in {list} has an empty condition")]
    EmptyCondition { list: &'static str, id: String },
    #[error("instrument tick economics must be positive")]
    BadInstrument,
}

impl EngineConfig {
    /// Validate and normalize in place, then compute the config hash.
    pub fn normalize(mut self) -> Result<EngineConfig, ConfigError> {
        if self.instrument.tick_size <= 0.0
            || self.instrument.tick_value_usd <= 0.0
            || self.instrument.point_value_usd <= 0.0
        {
            return Err(ConfigError::BadInstrument);
        }

        validate_rules("dvs.degradation_events", &self.dvs)?;
        validate_rules("eqs.degradation_events", &self.eqs)?;
        validate_window_ids(&self.no_trade_windows)?;

        // Calendar lists: deduplicate and sort.
        let holidays: BTreeSet<_> = self.calendar.holiday_dates.iter().copied().collect();
        self.calendar.holiday_dates = holidays.into_iter().collect();
        self.calendar
            .half_days
            .sort_by_key(|hd| (hd.date, hd.close_time));
        self.calendar.half_days.dedup();

        // Hash the normalized tree with the hash field cleared so the
        // operation is idempotent.
        self.config_hash = String::new();
        let value = serde_json::to_value(&self).expect("config serializes");
        self.config_hash = sha256_hex(&canonical_json(&value));
        Ok(self)
    }
}

fn validate_rules(list: &'static str, cfg: &ScoreConfig) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for rule in &cfg.degradation_events {
        if rule.id.trim().is_empty() {
            return Err(ConfigError::EmptyRuleId { list });
        }
        if !seen.insert(rule.id.clone()) {
            return Err(ConfigError::DuplicateRuleId {
                list,
                id: rule.id.clone(),
            });
        }
        if rule.condition.is_empty() {
            return Err(ConfigError::EmptyCondition {
                list,
                id: rule.id.clone(),
            });
        }
    }
    Ok(())
}

fn validate_window_ids(windows: &[NoTradeWindow]) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for window in windows {
        if window.id.trim().is_empty() {
            return Err(ConfigError::EmptyRuleId {
                list: "no_trade_windows",
            });
        }
        if !seen.insert(window.id.clone()) {
            return Err(ConfigError::DuplicateRuleId {
                list: "no_trade_windows",
                id: window.id.clone(),
            });
        }
    }
    Ok(())
}
