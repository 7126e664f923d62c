//! No-Trade Reasons
//!
//! The closed enumeration observable in decision events. The reason on any
//! no-trade always names the earliest failing gate in the normative order.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoTradeReason {
    KillSwitchActive,
    DvsTooLow,
    EqsTooLow,
    SessionWindowBlock,
    SessionNotTradable,
    InPosition,
    MaxTradesReached,
    CooldownActive,
    ConsecutiveLossLockout,
    DailyLossLimit,
    TemplateNotAllowedByTier,
    BeliefTooLow,
    StabilityTooLow,
    EdgeScoreBelowTheta,
    FrictionTooHigh,
    SpreadTooWide,
    MissingRequiredSignal,
    ConditionNotMet,
    NoMarketEntries,
    BracketRequired,
    AccountNotReady,
    AccountDataMissing,
    PositionMismatch,
    ExecutionDisabled,
    MarketClosed,
}

impl NoTradeReason {
    /// Wire/event representation, stable across releases.
    pub fn as_str(&self) -> &'static str {
        match self {
            NoTradeReason::KillSwitchActive => "KILL_SWITCH_ACTIVE",
            NoTradeReason::DvsTooLow => "DVS_TOO_LOW",
            NoTradeReason::EqsTooLow => "EQS_TOO_LOW",
            NoTradeReason::SessionWindowBlock => "SESSION_WINDOW_BLOCK",
            NoTradeReason::SessionNotTradable => "SESSION_NOT_TRADABLE",
            NoTradeReason::InPosition => "IN_POSITION",
            NoTradeReason::MaxTradesReached => "MAX_TRADES_REACHED",
            NoTradeReason::CooldownActive => "COOLDOWN_ACTIVE",
            NoTradeReason::ConsecutiveLossLockout => "CONSECUTIVE_LOSS_LOCKOUT",
            NoTradeReason::DailyLossLimit => "DAILY_LOSS_LIMIT",
            NoTradeReason::TemplateNotAllowedByTier => "TEMPLATE_NOT_ALLOWED_BY_TIER",
            NoTradeReason::BeliefTooLow => "BELIEF_TOO_LOW",
            NoTradeReason::StabilityTooLow => "STABILITY_TOO_LOW",
            NoTradeReason::EdgeScoreBelowTheta => "EDGE_SCORE_BELOW_THETA",
            NoTradeReason::FrictionTooHigh => "FRICTION_TOO_HIGH",
            NoTradeReason::SpreadTooWide => "SPREAD_TOO_WIDE",
            NoTradeReason::MissingRequiredSignal => "MISSING_REQUIRED_SIGNAL",
            NoTradeReason::ConditionNotMet => "CONDITION_NOT_MET",
            NoTradeReason::NoMarketEntries => "NO_MARKET_ENTRIES",
            NoTradeReason::BracketRequired => "BRACKET_REQUIRED",
            NoTradeReason::AccountNotReady => "ACCOUNT_NOT_READY",
            NoTradeReason::AccountDataMissing => "ACCOUNT_DATA_MISSING",
            NoTradeReason::PositionMismatch => "POSITION_MISMATCH",
            NoTradeReason::ExecutionDisabled => "EXECUTION_DISABLED",
            NoTradeReason::MarketClosed => "MARKET_CLOSED",
        }
    }
}

impl fmt::Display for NoTradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_stable() {
        assert_eq!(NoTradeReason::KillSwitchActive.to_string(), "KILL_SWITCH_ACTIVE");
        assert_eq!(NoTradeReason::EdgeScoreBelowTheta.to_string(), "EDGE_SCORE_BELOW_THETA");
        assert_eq!(NoTradeReason::PositionMismatch.to_string(), "POSITION_MISMATCH");
    }
}
