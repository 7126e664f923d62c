//! Trade Templates and Capital Tiers
//!
//! A template is a trade archetype bound to one constraint, with fixed
//! expected return, target, stop, time stop, minimum belief, and the set of
//! capital tiers allowed to run it. Tiers band account equity and cap both
//! stop size and dollar risk; the constitution caps everything.

use crate::engine::beliefs::ConstraintId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Template identifiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TemplateId {
    K1,
    K2,
    K3,
    K4,
}

impl TemplateId {
    pub const ALL: [TemplateId; 4] = [TemplateId::K1, TemplateId::K2, TemplateId::K3, TemplateId::K4];
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Capital tier classification by account equity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CapitalTier {
    /// Survival: under $2.5k.
    S,
    /// Advancement: $2.5k to $7.5k.
    A,
    /// Breakout: $7.5k and up.
    B,
}

impl CapitalTier {
    pub fn of_equity(equity_usd: f64) -> CapitalTier {
        if equity_usd < 2_500.0 {
            CapitalTier::S
        } else if equity_usd < 7_500.0 {
            CapitalTier::A
        } else {
            CapitalTier::B
        }
    }

    pub fn constraints(self) -> TierConstraints {
        match self {
            CapitalTier::S => TierConstraints {
                tier: self,
                max_stop_ticks: 10,
                max_risk_usd: 12.0,
            },
            CapitalTier::A => TierConstraints {
                tier: self,
                max_stop_ticks: 14,
                max_risk_usd: 15.0,
            },
            CapitalTier::B => TierConstraints {
                tier: self,
                max_stop_ticks: 18,
                max_risk_usd: 15.0,
            },
        }
    }
}

/// Per-tier risk caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierConstraints {
    pub tier: CapitalTier,
    pub max_stop_ticks: i64,
    pub max_risk_usd: f64,
}

/// A trade archetype definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeTemplate {
    pub id: TemplateId,
    pub name: &'static str,
    pub constraint_id: ConstraintId,
    pub expected_return_ticks: i64,
    pub target_ticks: i64,
    pub stop_ticks: i64,
    pub time_stop_minutes: i64,
    pub min_belief: f64,
    pub capital_tiers: &'static [CapitalTier],
}

impl TradeTemplate {
    #[inline]
    pub fn allowed_in(&self, tier: CapitalTier) -> bool {
        self.capital_tiers.contains(&tier)
    }
}

/// The shipped template table.
pub fn all_templates() -> [TradeTemplate; 4] {
    use CapitalTier::*;
    [
        TradeTemplate {
            id: TemplateId::K1,
            name: "VWAP Mean Reversion",
            constraint_id: ConstraintId::F1,
            expected_return_ticks: 12,
            target_ticks: 16,
            stop_ticks: 8,
            time_stop_minutes: 30,
            min_belief: 0.65,
            capital_tiers: &[S, A, B],
        },
        TradeTemplate {
            id: TemplateId::K2,
            name: "Failed Break Fade",
            constraint_id: ConstraintId::F3,
            expected_return_ticks: 10,
            target_ticks: 12,
            stop_ticks: 10,
            time_stop_minutes: 45,
            min_belief: 0.70,
            capital_tiers: &[S, A, B],
        },
        TradeTemplate {
            id: TemplateId::K3,
            name: "Sweep Reversal",
            constraint_id: ConstraintId::F4,
            expected_return_ticks: 12,
            target_ticks: 15,
            stop_ticks: 10,
            time_stop_minutes: 40,
            min_belief: 0.75,
            capital_tiers: &[A, B],
        },
        TradeTemplate {
            id: TemplateId::K4,
            name: "Momentum Continuation",
            constraint_id: ConstraintId::F5,
            expected_return_ticks: 15,
            target_ticks: 20,
            stop_ticks: 12,
            time_stop_minutes: 60,
            min_belief: 0.70,
            capital_tiers: &[B],
        },
    ]
}

pub fn template(id: TemplateId) -> TradeTemplate {
    all_templates()
        .into_iter()
        .find(|t| t.id == id)
        .expect("template table covers all ids")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(CapitalTier::of_equity(0.0), CapitalTier::S);
        assert_eq!(CapitalTier::of_equity(2_499.99), CapitalTier::S);
        assert_eq!(CapitalTier::of_equity(2_500.0), CapitalTier::A);
        assert_eq!(CapitalTier::of_equity(7_499.99), CapitalTier::A);
        assert_eq!(CapitalTier::of_equity(7_500.0), CapitalTier::B);
    }

    #[test]
    fn test_tier_template_access() {
        let allowed = |tier| {
            all_templates()
                .into_iter()
                .filter(|t| t.allowed_in(tier))
                .map(|t| t.id)
                .collect::<Vec<_>>()
        };
        assert_eq!(allowed(CapitalTier::S), vec![TemplateId::K1, TemplateId::K2]);
        assert_eq!(
            allowed(CapitalTier::A),
            vec![TemplateId::K1, TemplateId::K2, TemplateId::K3]
        );
        assert_eq!(allowed(CapitalTier::B), TemplateId::ALL.to_vec());
    }

    #[test]
    fn test_tier_caps_tighten_down_tiers() {
        let s = CapitalTier::S.constraints();
        let a = CapitalTier::A.constraints();
        let b = CapitalTier::B.constraints();
        assert!(s.max_stop_ticks < a.max_stop_ticks);
        assert!(a.max_stop_ticks < b.max_stop_ticks);
        assert!(s.max_risk_usd <= a.max_risk_usd);
    }

    #[test]
    fn test_template_constraint_binding() {
        assert_eq!(template(TemplateId::K1).constraint_id, ConstraintId::F1);
        assert_eq!(template(TemplateId::K2).constraint_id, ConstraintId::F3);
        assert_eq!(template(TemplateId::K3).constraint_id, ConstraintId::F4);
        assert_eq!(template(TemplateId::K4).constraint_id, ConstraintId::F5);
    }
}
