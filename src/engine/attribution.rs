//! Post-Trade Attribution
//!
//! Decomposes a finished trade into process versus outcome: how much edge
//! the entry actually had, how lucky the path was, and how clean the
//! execution was. The learning weight down-weights lucky outcomes so the
//! learning loop trains on process.

use crate::engine::in_trade::ExitReason;
use crate::engine::numeric::clamp01;
use serde::{Deserialize, Serialize};

/// Entry forecast snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub expected_return_ticks: f64,
    pub belief_probability: f64,
    pub friction_usd: f64,
    pub tick_value: f64,
}

/// Realized path of the trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathSnapshot {
    pub mae_ticks: f64,
    pub mfe_ticks: f64,
    pub exit_reason: ExitReason,
    pub time_to_exit_s: f64,
}

/// Execution quality of the fills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub slippage_ticks: f64,
    pub expected_slippage_ticks: f64,
    pub partial_fill: bool,
}

/// Plan the trade was entered under.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub stop_ticks: f64,
    pub target_ticks: f64,
    pub expected_time_to_target_s: f64,
}

/// Trade classification by process/outcome quadrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeClass {
    SkillWin,
    LuckWin,
    SkillLoss,
    BadLuckLoss,
    Neutral,
}

impl TradeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeClass::SkillWin => "SKILL_WIN",
            TradeClass::LuckWin => "LUCK_WIN",
            TradeClass::SkillLoss => "SKILL_LOSS",
            TradeClass::BadLuckLoss => "BAD_LUCK_LOSS",
            TradeClass::Neutral => "NEUTRAL",
        }
    }
}

/// Full attribution result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PostTradeScores {
    pub edge_score: f64,
    pub luck_score: f64,
    pub execution_score: f64,
    /// (1 − luck) · execution, in [0, 1].
    pub learning_weight: f64,
    pub classification: TradeClass,
}

/// Edge proxy at entry: belief-haircut expected return against a $12 scale.
pub fn edge_score(forecast: &ForecastSnapshot) -> f64 {
    let p_lb = clamp01(forecast.belief_probability * 0.8);
    let er_usd = forecast.expected_return_ticks * forecast.tick_value * p_lb;
    if er_usd <= 0.0 {
        return 0.0;
    }
    clamp01(er_usd / 12.0)
}

/// Luck as surprise between the realized path and the plan.
pub fn luck_score(path: &PathSnapshot, plan: &PlanSnapshot) -> f64 {
    let stop_ticks = plan.stop_ticks.max(1.0);
    // How close the adverse excursion came to the stop.
    let near_stop = clamp01(path.mae_ticks / stop_ticks);
    let quick = if plan.expected_time_to_target_s > 0.0 {
        clamp01(1.0 - path.time_to_exit_s / (2.0 * plan.expected_time_to_target_s))
    } else {
        0.0
    };
    let clean = clamp01(1.0 - path.mae_ticks / stop_ticks);

    let base = 0.5;
    let luck = match path.exit_reason {
        // Winning through the target: clean and timely is skill, a
        // near-stop save is luck.
        ExitReason::Target | ExitReason::RunnerStop => {
            base + 0.6 * near_stop - 0.2 * (clean + quick)
        }
        // Stopouts: an early whipsaw with small MAE is more model error
        // than bad luck.
        ExitReason::Stop => base - 0.3 * near_stop,
        _ => base + 0.3 * near_stop,
    };
    clamp01(luck)
}

/// Execution quality: slippage against expectation, penalized for partials.
pub fn execution_score(exe: &ExecutionSnapshot) -> f64 {
    let expected = exe.expected_slippage_ticks.max(0.25);
    let ratio = exe.slippage_ticks.abs() / expected;
    let mut score = clamp01(1.0 - 0.3 * (ratio - 1.0).max(0.0));
    if exe.partial_fill {
        score = clamp01(score - 0.15);
    }
    score
}

pub fn classify(pnl_usd: f64, luck: f64, edge: f64) -> TradeClass {
    if pnl_usd > 0.0 {
        if luck > 0.7 && edge < 0.4 {
            TradeClass::LuckWin
        } else {
            TradeClass::SkillWin
        }
    } else if pnl_usd < 0.0 {
        if luck < 0.3 && edge > 0.6 {
            TradeClass::BadLuckLoss
        } else {
            TradeClass::SkillLoss
        }
    } else {
        TradeClass::Neutral
    }
}

/// Score a completed trade.
pub fn score_post_trade(
    pnl_usd: f64,
    forecast: &ForecastSnapshot,
    path: &PathSnapshot,
    plan: &PlanSnapshot,
    exe: &ExecutionSnapshot,
) -> PostTradeScores {
    let edge = edge_score(forecast);
    let luck = luck_score(path, plan);
    let exe_score = execution_score(exe);
    let learning_weight = clamp01((1.0 - luck) * exe_score);
    PostTradeScores {
        edge_score: edge,
        luck_score: luck,
        execution_score: exe_score,
        learning_weight,
        classification: classify(pnl_usd, luck, edge),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecast(belief: f64) -> ForecastSnapshot {
        ForecastSnapshot {
            expected_return_ticks: 12.0,
            belief_probability: belief,
            friction_usd: 4.5,
            tick_value: 1.25,
        }
    }

    fn plan() -> PlanSnapshot {
        PlanSnapshot {
            stop_ticks: 8.0,
            target_ticks: 16.0,
            expected_time_to_target_s: 900.0,
        }
    }

    fn clean_exe() -> ExecutionSnapshot {
        ExecutionSnapshot {
            slippage_ticks: 0.5,
            expected_slippage_ticks: 0.5,
            partial_fill: false,
        }
    }

    #[test]
    fn test_clean_quick_win_is_low_luck() {
        let path = PathSnapshot {
            mae_ticks: 1.0,
            mfe_ticks: 16.0,
            exit_reason: ExitReason::Target,
            time_to_exit_s: 600.0,
        };
        let luck = luck_score(&path, &plan());
        assert!(luck < 0.35, "clean quick win should be low luck, got {luck}");
    }

    #[test]
    fn test_near_stop_win_is_high_luck() {
        let path = PathSnapshot {
            mae_ticks: 7.5,
            mfe_ticks: 16.0,
            exit_reason: ExitReason::Target,
            time_to_exit_s: 2400.0,
        };
        let luck = luck_score(&path, &plan());
        assert!(luck > 0.7, "near-stop win should be high luck, got {luck}");
    }

    #[test]
    fn test_whipsaw_stop_is_model_error_not_luck() {
        let path = PathSnapshot {
            mae_ticks: 8.0,
            mfe_ticks: 1.0,
            exit_reason: ExitReason::Stop,
            time_to_exit_s: 120.0,
        };
        let luck = luck_score(&path, &plan());
        assert!(luck < 0.5);
    }

    #[test]
    fn test_learning_weight_downweights_luck() {
        let lucky_path = PathSnapshot {
            mae_ticks: 7.5,
            mfe_ticks: 16.0,
            exit_reason: ExitReason::Target,
            time_to_exit_s: 2400.0,
        };
        let clean_path = PathSnapshot {
            mae_ticks: 1.0,
            mfe_ticks: 16.0,
            exit_reason: ExitReason::Target,
            time_to_exit_s: 600.0,
        };
        let lucky = score_post_trade(25.0, &forecast(0.7), &lucky_path, &plan(), &clean_exe());
        let skilled = score_post_trade(25.0, &forecast(0.7), &clean_path, &plan(), &clean_exe());
        assert!(lucky.learning_weight < skilled.learning_weight);
        assert!((0.0..=1.0).contains(&lucky.learning_weight));
    }

    #[test]
    fn test_classification_quadrants() {
        assert_eq!(classify(25.0, 0.8, 0.2), TradeClass::LuckWin);
        assert_eq!(classify(25.0, 0.2, 0.7), TradeClass::SkillWin);
        assert_eq!(classify(-25.0, 0.1, 0.8), TradeClass::BadLuckLoss);
        assert_eq!(classify(-25.0, 0.6, 0.3), TradeClass::SkillLoss);
        assert_eq!(classify(0.0, 0.5, 0.5), TradeClass::Neutral);
    }

    #[test]
    fn test_partial_fill_penalizes_execution() {
        let partial = ExecutionSnapshot {
            partial_fill: true,
            ..clean_exe()
        };
        assert!(execution_score(&partial) < execution_score(&clean_exe()));
    }

    #[test]
    fn test_edge_score_scales_with_belief() {
        assert!(edge_score(&forecast(0.8)) > edge_score(&forecast(0.4)));
        assert_eq!(edge_score(&forecast(0.0)), 0.0);
    }
}
