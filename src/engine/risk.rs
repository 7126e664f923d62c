//! Risk Tracking and the Kill Switch
//!
//! Session-scoped counters feeding the decision gates (daily trade count,
//! consecutive-loss lockout, cooldown, daily loss limit) and the sticky
//! kill switch shared between the decision loop and the execution
//! supervisor.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

/// Risk model limits, part of the frozen config tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_trades_per_day: u32,
    pub max_daily_loss_usd: f64,
    pub consecutive_loss_limit: u32,
    /// Pause after hitting the consecutive-loss limit.
    pub pause_after_losses_minutes: i64,
    /// Minimum spacing between entries.
    pub cooldown_minutes: i64,
    /// Intraday drawdown from the equity peak that trips the kill switch.
    pub intraday_drawdown_kill_usd: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_trades_per_day: 10,
            max_daily_loss_usd: 50.0,
            consecutive_loss_limit: 3,
            pause_after_losses_minutes: 60,
            cooldown_minutes: 5,
            intraday_drawdown_kill_usd: 50.0,
        }
    }
}

/// Sticky kill switch. Activation requires manual release; an optional
/// time-bounded freeze may auto-expire, a mismatch- or loss-induced one
/// does not.
#[derive(Debug, Default)]
pub struct KillSwitch {
    inner: RwLock<KillSwitchState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    /// Set only for time-bounded freezes.
    pub auto_expires_at: Option<DateTime<Utc>>,
}

impl KillSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn activate(&self, reason: &str, now: DateTime<Utc>) {
        let mut state = self.inner.write();
        if state.active {
            return;
        }
        error!(reason, "kill switch ACTIVATED");
        state.active = true;
        state.reason = Some(reason.to_string());
        state.triggered_at = Some(now);
        state.auto_expires_at = None;
    }

    /// Time-bounded activation; expires on its own at `until`.
    pub fn activate_until(&self, reason: &str, now: DateTime<Utc>, until: DateTime<Utc>) {
        let mut state = self.inner.write();
        if state.active {
            return;
        }
        warn!(reason, until = %until, "kill switch activated with auto-expiry");
        state.active = true;
        state.reason = Some(reason.to_string());
        state.triggered_at = Some(now);
        state.auto_expires_at = Some(until);
    }

    /// Manual operator release.
    pub fn release(&self) {
        let mut state = self.inner.write();
        warn!(reason = ?state.reason, "kill switch released by operator");
        *state = KillSwitchState::default();
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        {
            let state = self.inner.read();
            if !state.active {
                return false;
            }
            match state.auto_expires_at {
                Some(expiry) if now >= expiry => {}
                _ => return true,
            }
        }
        // Auto-expiry reached: clear under the write lock.
        let mut state = self.inner.write();
        if state.active && state.auto_expires_at.map_or(false, |e| now >= e) {
            *state = KillSwitchState::default();
        }
        state.active
    }

    pub fn state(&self) -> KillSwitchState {
        self.inner.read().clone()
    }
}

/// Session-scoped risk counters. Owned by the orchestrator; updated on
/// every trade close.
#[derive(Debug, Clone)]
pub struct RiskTracker {
    limits: RiskLimits,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    pub peak_equity: f64,
    pub max_drawdown: f64,
    pub pause_until: Option<DateTime<Utc>>,
    pub last_entry_at: Option<DateTime<Utc>>,
}

impl RiskTracker {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            daily_pnl: 0.0,
            daily_trades: 0,
            consecutive_wins: 0,
            consecutive_losses: 0,
            peak_equity: 0.0,
            max_drawdown: 0.0,
            pause_until: None,
            last_entry_at: None,
        }
    }

    #[inline]
    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn record_entry(&mut self, now: DateTime<Utc>) {
        self.daily_trades += 1;
        self.last_entry_at = Some(now);
    }

    /// Fold a realized trade result into the counters. Returns a kill-switch
    /// reason when a hard trigger fired.
    pub fn record_trade_close(
        &mut self,
        realized_pnl: f64,
        now: DateTime<Utc>,
    ) -> Option<&'static str> {
        self.daily_pnl += realized_pnl;
        if realized_pnl > 0.0 {
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
        } else if realized_pnl < 0.0 {
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
        }

        if self.daily_pnl > self.peak_equity {
            self.peak_equity = self.daily_pnl;
        }
        let drawdown = self.peak_equity - self.daily_pnl;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }

        if self.daily_pnl <= -self.limits.max_daily_loss_usd {
            return Some("DAILY_LOSS_LIMIT");
        }
        if self.max_drawdown >= self.limits.intraday_drawdown_kill_usd {
            return Some("INTRADAY_DRAWDOWN");
        }
        if self.consecutive_losses >= self.limits.consecutive_loss_limit {
            self.pause_until =
                Some(now + Duration::minutes(self.limits.pause_after_losses_minutes));
            return Some("CONSECUTIVE_LOSSES");
        }
        None
    }

    pub fn max_trades_reached(&self) -> bool {
        self.daily_trades >= self.limits.max_trades_per_day
    }

    pub fn in_loss_pause(&self, now: DateTime<Utc>) -> bool {
        self.pause_until.map_or(false, |until| now < until)
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_entry_at.map_or(false, |at| {
            now < at + Duration::minutes(self.limits.cooldown_minutes)
        })
    }

    pub fn daily_loss_limit_hit(&self) -> bool {
        self.daily_pnl <= -self.limits.max_daily_loss_usd
    }

    /// Reset at the first bar of a new session date.
    pub fn reset_daily(&mut self) {
        self.daily_pnl = 0.0;
        self.daily_trades = 0;
        self.consecutive_wins = 0;
        self.consecutive_losses = 0;
        self.peak_equity = 0.0;
        self.max_drawdown = 0.0;
        self.pause_until = None;
        self.last_entry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 11, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_kill_switch_sticky() {
        let ks = KillSwitch::new();
        assert!(!ks.is_active(now()));
        ks.activate("POSITION_MISMATCH", now());
        assert!(ks.is_active(now()));
        assert!(ks.is_active(now() + Duration::days(30)), "no auto-expiry");
        ks.release();
        assert!(!ks.is_active(now()));
    }

    #[test]
    fn test_kill_switch_time_bounded_expires() {
        let ks = KillSwitch::new();
        ks.activate_until("AUTO_FREEZE", now(), now() + Duration::hours(24));
        assert!(ks.is_active(now() + Duration::hours(23)));
        assert!(!ks.is_active(now() + Duration::hours(25)));
    }

    #[test]
    fn test_first_activation_wins() {
        let ks = KillSwitch::new();
        ks.activate("FIRST", now());
        ks.activate("SECOND", now());
        assert_eq!(ks.state().reason.as_deref(), Some("FIRST"));
    }

    #[test]
    fn test_consecutive_loss_lockout_and_pause() {
        let mut tracker = RiskTracker::new(RiskLimits::default());
        assert_eq!(tracker.record_trade_close(-10.0, now()), None);
        assert_eq!(tracker.record_trade_close(-10.0, now()), None);
        let trigger = tracker.record_trade_close(-10.0, now());
        assert_eq!(trigger, Some("CONSECUTIVE_LOSSES"));
        assert!(tracker.in_loss_pause(now() + Duration::minutes(30)));
        assert!(!tracker.in_loss_pause(now() + Duration::minutes(61)));
        // A win resets the streak.
        tracker.consecutive_losses = 0;
        tracker.record_trade_close(20.0, now());
        assert_eq!(tracker.consecutive_wins, 1);
    }

    #[test]
    fn test_daily_loss_limit() {
        let mut tracker = RiskTracker::new(RiskLimits::default());
        assert_eq!(tracker.record_trade_close(-30.0, now()), None);
        let trigger = tracker.record_trade_close(-25.0, now());
        // -55 breaches both the loss limit and the drawdown trigger; the
        // loss limit is checked first.
        assert_eq!(trigger, Some("DAILY_LOSS_LIMIT"));
        assert!(tracker.daily_loss_limit_hit());
    }

    #[test]
    fn test_cooldown_window() {
        let mut tracker = RiskTracker::new(RiskLimits::default());
        tracker.record_entry(now());
        assert!(tracker.in_cooldown(now() + Duration::minutes(4)));
        assert!(!tracker.in_cooldown(now() + Duration::minutes(5)));
    }

    #[test]
    fn test_daily_reset() {
        let mut tracker = RiskTracker::new(RiskLimits::default());
        tracker.record_entry(now());
        tracker.record_trade_close(-60.0, now());
        tracker.reset_daily();
        assert_eq!(tracker.daily_pnl, 0.0);
        assert_eq!(tracker.daily_trades, 0);
        assert!(!tracker.in_cooldown(now()));
    }
}
