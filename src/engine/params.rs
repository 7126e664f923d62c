//! Learnable Parameter State
//!
//! The single source of truth for everything the learning loop may touch:
//! belief signal weights, belief entry thresholds, decay rates, and template
//! adjustments. All values are hard-bounded; out-of-bound writes clip and
//! log.
//!
//! Ownership: the learning loop is the only writer. It publishes a new
//! immutable snapshot through [`ParamsHandle`] (swap-on-write); the belief
//! and decision engines load the snapshot at the top of each cycle.

use crate::engine::beliefs::ConstraintId;
use crate::engine::templates::TemplateId;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Hard bounds and per-update change budgets for one parameter category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
    /// Maximum change per weekly batch update.
    pub max_change: f64,
}

impl Bounds {
    #[inline]
    pub fn clip(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

/// Constitutional bounds per category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamBounds {
    pub signal_weights: Bounds,
    pub belief_thresholds: Bounds,
    pub decay_rates: Bounds,
    pub template_stop_buffers: Bounds,
    pub template_time_stops: Bounds,
}

impl Default for ParamBounds {
    fn default() -> Self {
        Self {
            signal_weights: Bounds {
                min: 0.0,
                max: 1.5,
                max_change: 0.05,
            },
            belief_thresholds: Bounds {
                min: 0.50,
                max: 0.95,
                max_change: 0.01,
            },
            decay_rates: Bounds {
                min: 0.90,
                max: 0.995,
                max_change: 0.005,
            },
            template_stop_buffers: Bounds {
                min: -2.0,
                max: 2.0,
                max_change: 1.0,
            },
            template_time_stops: Bounds {
                min: 10.0,
                max: 60.0,
                max_change: 2.0,
            },
        }
    }
}

/// The learnable parameter tree. Cloned wholesale on every update; readers
/// only ever see complete, bounded snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    /// constraint → signal name → weight.
    pub signal_weights: BTreeMap<ConstraintId, BTreeMap<String, f64>>,
    /// constraint → entry threshold on effective likelihood.
    pub belief_thresholds: BTreeMap<ConstraintId, f64>,
    /// constraint → decay lambda.
    pub decay_rates: BTreeMap<ConstraintId, f64>,
    /// template → stop adjustment in ticks.
    pub template_stop_buffers: BTreeMap<TemplateId, i64>,
    /// template → time stop in minutes.
    pub template_time_stops: BTreeMap<TemplateId, i64>,

    pub version: u64,
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
    pub update_reason: Option<String>,
}

impl ParameterState {
    /// Seed defaults matching the shipped belief matrix and templates.
    pub fn defaults() -> Self {
        use ConstraintId::*;
        use TemplateId::*;

        let weights = |rows: &[(&str, f64)]| -> BTreeMap<String, f64> {
            rows.iter().map(|(k, v)| (k.to_string(), *v)).collect()
        };

        let mut signal_weights = BTreeMap::new();
        // F1 keys on the magnitude of the VWAP stretch; the trade's side
        // comes from the sign of vwap_z at decision time.
        signal_weights.insert(
            F1,
            weights(&[
                ("vwap_stretch", 0.40),
                ("range_compression", 0.20),
                ("vol_z", -0.15),
                ("close_location_value", 0.15),
                ("friction_regime_index", 0.10),
            ]),
        );
        signal_weights.insert(
            F3,
            weights(&[
                ("breakout_distance_n", 0.30),
                ("rejection_wick_n", 0.30),
                ("vol_z", 0.20),
                ("hhll_trend_strength", -0.10),
                ("opening_range_break", 0.10),
            ]),
        );
        signal_weights.insert(
            F4,
            weights(&[
                ("rejection_wick_n", 0.35),
                ("climax_bar_flag", 0.25),
                ("micro_trend_5", -0.15),
                ("close_location_value", 0.15),
                ("distance_from_poc_proxy", 0.10),
            ]),
        );
        signal_weights.insert(
            F5,
            weights(&[
                ("hhll_trend_strength", 0.30),
                ("micro_trend_5", 0.25),
                ("real_body_impulse_n", 0.20),
                ("range_expansion_on_volume", 0.15),
                ("participation_expansion_index", 0.10),
            ]),
        );
        signal_weights.insert(
            F6,
            weights(&[
                ("dvs", 0.40),
                ("friction_regime_index", 0.30),
                ("lunch_void_gate", 0.15),
                ("spread_proxy_tickiness", 0.10),
                ("slippage_risk_proxy", 0.05),
            ]),
        );

        let belief_thresholds =
            BTreeMap::from([(F1, 0.65), (F3, 0.60), (F4, 0.55), (F5, 0.50), (F6, 0.50)]);
        let decay_rates =
            BTreeMap::from([(F1, 0.96), (F3, 0.98), (F4, 0.95), (F5, 0.94), (F6, 0.97)]);
        let template_stop_buffers = BTreeMap::from([(K1, 0), (K2, 0), (K3, 0), (K4, 0)]);
        let template_time_stops = BTreeMap::from([(K1, 30), (K2, 45), (K3, 40), (K4, 60)]);

        Self {
            signal_weights,
            belief_thresholds,
            decay_rates,
            template_stop_buffers,
            template_time_stops,
            version: 1,
            last_updated: None,
            update_reason: Some("INITIALIZED_DEFAULTS".to_string()),
        }
    }

    /// Clip every field into its bounds, logging anything out of range.
    pub fn enforce_bounds(&mut self, bounds: &ParamBounds) {
        for (cid, row) in self.signal_weights.iter_mut() {
            for (name, w) in row.iter_mut() {
                let clipped = bounds.signal_weights.clip(*w);
                if clipped != *w {
                    warn!(constraint = ?cid, signal = %name, from = *w, to = clipped,
                          "signal weight clipped to bounds");
                    *w = clipped;
                }
            }
        }
        for (cid, t) in self.belief_thresholds.iter_mut() {
            let clipped = bounds.belief_thresholds.clip(*t);
            if clipped != *t {
                warn!(constraint = ?cid, from = *t, to = clipped, "belief threshold clipped");
                *t = clipped;
            }
        }
        for (cid, d) in self.decay_rates.iter_mut() {
            let clipped = bounds.decay_rates.clip(*d);
            if clipped != *d {
                warn!(constraint = ?cid, from = *d, to = clipped, "decay rate clipped");
                *d = clipped;
            }
        }
        for (tid, b) in self.template_stop_buffers.iter_mut() {
            let clipped = bounds.template_stop_buffers.clip(*b as f64) as i64;
            if clipped != *b {
                warn!(template = ?tid, from = *b, to = clipped, "stop buffer clipped");
                *b = clipped;
            }
        }
        for (tid, t) in self.template_time_stops.iter_mut() {
            let clipped = bounds.template_time_stops.clip(*t as f64) as i64;
            if clipped != *t {
                warn!(template = ?tid, from = *t, to = clipped, "time stop clipped");
                *t = clipped;
            }
        }
    }
}

impl Default for ParameterState {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Swap-on-write handle. Writers call [`ParamsHandle::publish`]; readers
/// call [`ParamsHandle::load`] once per cycle and keep the `Arc` for the
/// duration of that cycle.
#[derive(Debug)]
pub struct ParamsHandle {
    inner: ArcSwap<ParameterState>,
}

impl ParamsHandle {
    pub fn new(state: ParameterState) -> Self {
        Self {
            inner: ArcSwap::from_pointee(state),
        }
    }

    #[inline]
    pub fn load(&self) -> Arc<ParameterState> {
        self.inner.load_full()
    }

    pub fn publish(&self, state: ParameterState) {
        self.inner.store(Arc::new(state));
    }
}

impl Default for ParamsHandle {
    fn default() -> Self {
        Self::new(ParameterState::defaults())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::beliefs::ConstraintId;

    #[test]
    fn test_defaults_within_bounds() {
        let mut state = ParameterState::defaults();
        let bounds = ParamBounds::default();
        let before = state.clone();
        state.enforce_bounds(&bounds);
        assert_eq!(state, before, "defaults must already satisfy bounds");
    }

    #[test]
    fn test_enforce_bounds_clips() {
        let mut state = ParameterState::defaults();
        state
            .signal_weights
            .get_mut(&ConstraintId::F1)
            .unwrap()
            .insert("vwap_z".to_string(), 9.0);
        state.belief_thresholds.insert(ConstraintId::F1, 0.10);
        state.decay_rates.insert(ConstraintId::F1, 1.5);
        state.enforce_bounds(&ParamBounds::default());
        assert_eq!(state.signal_weights[&ConstraintId::F1]["vwap_z"], 1.5);
        assert_eq!(state.belief_thresholds[&ConstraintId::F1], 0.50);
        assert_eq!(state.decay_rates[&ConstraintId::F1], 0.995);
    }

    #[test]
    fn test_snapshot_swap_isolation() {
        let handle = ParamsHandle::default();
        let reader_view = handle.load();
        let mut next = (*reader_view).clone();
        next.version += 1;
        handle.publish(next);
        // The old snapshot is unchanged; the new one is visible to fresh loads.
        assert_eq!(reader_view.version, 1);
        assert_eq!(handle.load().version, 2);
    }
}
