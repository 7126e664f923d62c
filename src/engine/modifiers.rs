//! Threshold Modifier Registry
//!
//! Context-aware additive adjustments to the EUC acceptance threshold.
//! Positive adjustments make entries harder, negative easier. Each category
//! has a stacking cap, and modifiers are registered once at startup; they
//! never touch the constitutional gate layers.

use crate::engine::bias::BiasSignalOutput;
use crate::engine::beliefs::StrategyContext;
use crate::engine::session::SessionPhase;
use crate::engine::signals::SignalOutput;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Modifier category with its own stacking cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModifierCategory {
    Time,
    Event,
    Regime,
    Psychological,
    Strategy,
    Quality,
}

impl ModifierCategory {
    /// Maximum absolute total adjustment contributed by the category.
    pub fn cap(self) -> f64 {
        match self {
            ModifierCategory::Time => 0.15,
            ModifierCategory::Event => 0.25,
            ModifierCategory::Regime => 0.20,
            ModifierCategory::Psychological => 0.15,
            ModifierCategory::Strategy => 0.20,
            ModifierCategory::Quality => 0.30,
        }
    }
}

/// Everything a modifier condition may look at.
pub struct ModifierInputs<'a> {
    pub signals: &'a SignalOutput,
    pub bias: &'a BiasSignalOutput,
    pub strategy: &'a StrategyContext,
    pub sigma_norm: f64,
}

/// One named modifier.
pub struct Modifier {
    pub id: &'static str,
    pub category: ModifierCategory,
    /// Added to the threshold when the condition holds.
    pub adjustment: f64,
    pub condition: fn(&ModifierInputs<'_>) -> bool,
}

/// Evaluation result for one bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifierResult {
    pub active_modifiers: Vec<&'static str>,
    pub total_adjustment: f64,
    pub by_category: BTreeMap<String, f64>,
}

/// The registry. Built once at startup; evaluation is a deterministic fold
/// in registration order.
pub struct ModifierRegistry {
    base_threshold: f64,
    modifiers: Vec<Modifier>,
}

impl ModifierRegistry {
    pub fn new(base_threshold: f64) -> Self {
        let mut registry = Self {
            base_threshold,
            modifiers: Vec::new(),
        };
        registry.register_builtin();
        registry
    }

    pub fn register(&mut self, modifier: Modifier) {
        self.modifiers.push(modifier);
    }

    /// Effective threshold = base + capped category sums.
    pub fn effective_threshold(&self, inputs: &ModifierInputs<'_>) -> (f64, ModifierResult) {
        let mut by_category: BTreeMap<ModifierCategory, f64> = BTreeMap::new();
        let mut active = Vec::new();

        for modifier in &self.modifiers {
            if !(modifier.condition)(inputs) {
                continue;
            }
            let cap = modifier.category.cap();
            let entry = by_category.entry(modifier.category).or_insert(0.0);
            let proposed = *entry + modifier.adjustment;
            *entry = proposed.clamp(-cap, cap);
            active.push(modifier.id);
        }

        let total: f64 = by_category.values().sum();
        let result = ModifierResult {
            active_modifiers: active,
            total_adjustment: total,
            by_category: by_category
                .iter()
                .map(|(k, v)| (format!("{:?}", k), *v))
                .collect(),
        };
        (self.base_threshold + total, result)
    }

    fn register_builtin(&mut self) {
        use ModifierCategory::*;

        // Time of day.
        self.register(Modifier {
            id: "opening_first_30",
            category: Time,
            adjustment: 0.05,
            condition: |i| {
                i.signals.session_phase == SessionPhase::Opening
                    && i.signals.close_magnet_index == Some(0.0)
            },
        });
        self.register(Modifier {
            id: "close_magnet_window",
            category: Time,
            adjustment: 0.08,
            condition: |i| i.signals.close_magnet_index.map_or(false, |v| v > 0.5),
        });
        self.register(Modifier {
            id: "mid_morning_edge",
            category: Time,
            adjustment: -0.03,
            condition: |i| i.signals.session_phase == SessionPhase::MidMorning,
        });

        // Event context.
        self.register(Modifier {
            id: "pre_event_compression",
            category: Event,
            adjustment: 0.10,
            condition: |i| i.bias.pre_event_compression >= 0.8,
        });
        self.register(Modifier {
            id: "post_event_expansion",
            category: Event,
            adjustment: 0.12,
            condition: |i| i.bias.post_event_expansion >= 0.9,
        });
        self.register(Modifier {
            id: "quarter_end_flow",
            category: Event,
            adjustment: 0.08,
            condition: |i| i.bias.quarter_end_flow >= 0.8,
        });

        // Volatility regime.
        self.register(Modifier {
            id: "high_vol_regime",
            category: Regime,
            adjustment: 0.10,
            condition: |i| i.sigma_norm > 1.5,
        });
        self.register(Modifier {
            id: "low_vol_regime",
            category: Regime,
            adjustment: -0.05,
            condition: |i| i.sigma_norm < 0.7,
        });
        self.register(Modifier {
            id: "range_expansion_shock",
            category: Regime,
            adjustment: 0.08,
            condition: |i| i.signals.range_compression.map_or(false, |v| v > 1.8),
        });

        // Psychological / bias state.
        self.register(Modifier {
            id: "fomo_elevated",
            category: Psychological,
            adjustment: 0.08,
            condition: |i| i.bias.fomo_index > 0.6,
        });
        self.register(Modifier {
            id: "euphoria",
            category: Psychological,
            adjustment: 0.10,
            condition: |i| i.bias.euphoria_flag > 0.7,
        });
        self.register(Modifier {
            id: "overconfidence",
            category: Psychological,
            adjustment: 0.07,
            condition: |i| i.bias.overconfidence_flag > 0.7,
        });

        // Strategy confluence / conflict.
        self.register(Modifier {
            id: "strategy_conflict",
            category: Strategy,
            adjustment: 0.10,
            condition: |i| i.strategy.conflict_detected,
        });
        self.register(Modifier {
            id: "strategy_confluence",
            category: Strategy,
            adjustment: -0.05,
            condition: |i| i.strategy.confluence_count >= 2,
        });

        // Data quality.
        self.register(Modifier {
            id: "dvs_marginal",
            category: Quality,
            adjustment: 0.10,
            condition: |i| i.signals.dvs < 0.90,
        });
        self.register(Modifier {
            id: "spread_degraded",
            category: Quality,
            adjustment: 0.12,
            condition: |i| i.signals.spread_proxy_tickiness.map_or(false, |v| v < 0.5),
        });
        self.register(Modifier {
            id: "slippage_degraded",
            category: Quality,
            adjustment: 0.10,
            condition: |i| i.signals.slippage_risk_proxy.map_or(false, |v| v < 0.5),
        });
    }
}
