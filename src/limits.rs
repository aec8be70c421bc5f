//! Spend limit guard and circuit breaker
//!
//! Gates every disbursement attempt against rolling daily/hourly spend
//! caps and a CLOSED/OPEN/HALF_OPEN circuit breaker driven by consecutive
//! submission failures. All state lives behind one mutex so a concurrent
//! check-then-record can never observe a half-applied update; the lock is
//! synchronous and never held across an await point.
//!
//! Windows are fixed wall-clock boundaries (UTC midnight, top of hour)
//! and reset lazily on access rather than from a background timer.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Limit guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitGuardConfig {
    /// Daily spend cap in base units
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,

    /// Hourly spend cap in base units
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: u64,

    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before probing recovery
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Consecutive trial successes required to close a half-open breaker
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_daily_limit() -> u64 {
    100_000_000_000 // 100k USDT
}
fn default_hourly_limit() -> u64 {
    10_000_000_000 // 10k USDT
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> u64 {
    300
}
fn default_success_threshold() -> u32 {
    3
}

impl Default for LimitGuardConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            hourly_limit: default_hourly_limit(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Rejecting all requests
    Open,
    /// Probing recovery with trial requests
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
struct LimitState {
    daily_used: u64,
    hourly_used: u64,
    /// UTC date the daily window belongs to
    day: NaiveDate,
    /// (date, hour) the hourly window belongs to
    hour: (NaiveDate, u32),
    consecutive_failures: u32,
    breaker: BreakerState,
    last_failure_at: Option<DateTime<Utc>>,
    trial_successes: u32,
}

impl LimitState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_used: 0,
            hourly_used: 0,
            day: now.date_naive(),
            hour: (now.date_naive(), now.hour()),
            consecutive_failures: 0,
            breaker: BreakerState::Closed,
            last_failure_at: None,
            trial_successes: 0,
        }
    }

    /// Lazy window reset on every access
    fn roll_windows(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day != self.day {
            self.day = day;
            self.daily_used = 0;
        }
        let hour = (day, now.hour());
        if hour != self.hour {
            self.hour = hour;
            self.hourly_used = 0;
        }
    }
}

/// Read-only view of the guard for status output
#[derive(Debug, Clone, Serialize)]
pub struct LimitSnapshot {
    pub daily_used: u64,
    pub hourly_used: u64,
    pub daily_limit: u64,
    pub hourly_limit: u64,
    pub consecutive_failures: u32,
    pub breaker: BreakerState,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Shared limit guard, one instance per engine
pub struct LimitGuard {
    config: LimitGuardConfig,
    state: Mutex<LimitState>,
}

impl LimitGuard {
    pub fn new(config: LimitGuardConfig) -> Self {
        let state = Mutex::new(LimitState::new(Utc::now()));
        Self { config, state }
    }

    /// Gate a disbursement attempt. Denials never mutate spend counters
    /// and are not counted as breaker failures.
    pub fn check(&self, amount: u64) -> Result<()> {
        self.check_at(amount, Utc::now())
    }

    pub fn check_at(&self, amount: u64, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().expect("limit state poisoned");
        state.roll_windows(now);

        if state.breaker == BreakerState::Open {
            let elapsed = state
                .last_failure_at
                .map(|t| (now - t).num_seconds())
                .unwrap_or(i64::MAX);
            let timeout = self.config.recovery_timeout_secs as i64;
            if elapsed >= timeout {
                state.breaker = BreakerState::HalfOpen;
                state.trial_successes = 0;
                info!("Circuit breaker half-open, probing recovery");
            } else {
                return Err(Error::CircuitBreakerOpen {
                    retry_after_secs: timeout - elapsed,
                });
            }
        }

        if state.daily_used.saturating_add(amount) > self.config.daily_limit {
            return Err(Error::DailyLimitExceeded {
                used: state.daily_used,
                requested: amount,
                limit: self.config.daily_limit,
            });
        }

        if state.hourly_used.saturating_add(amount) > self.config.hourly_limit {
            return Err(Error::HourlyLimitExceeded {
                used: state.hourly_used,
                requested: amount,
                limit: self.config.hourly_limit,
            });
        }

        Ok(())
    }

    /// Record a confirmed disbursement. The only place spend counters grow.
    pub fn record_success(&self, amount: u64) {
        self.record_success_at(amount, Utc::now());
    }

    pub fn record_success_at(&self, amount: u64, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("limit state poisoned");
        state.roll_windows(now);
        state.daily_used = state.daily_used.saturating_add(amount);
        state.hourly_used = state.hourly_used.saturating_add(amount);
        state.consecutive_failures = 0;

        if state.breaker == BreakerState::HalfOpen {
            state.trial_successes += 1;
            if state.trial_successes >= self.config.success_threshold {
                state.breaker = BreakerState::Closed;
                state.trial_successes = 0;
                info!("Circuit breaker closed after successful recovery");
            }
        }
    }

    /// Record a definitive submission/confirmation failure
    pub fn record_failure(&self) {
        self.record_failure_at(Utc::now());
    }

    pub fn record_failure_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("limit state poisoned");
        state.consecutive_failures += 1;
        state.last_failure_at = Some(now);

        match state.breaker {
            // A failed trial request reopens the breaker immediately
            BreakerState::HalfOpen => {
                state.breaker = BreakerState::Open;
                state.trial_successes = 0;
                warn!("Circuit breaker re-opened during recovery probe");
            }
            BreakerState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.breaker = BreakerState::Open;
                    warn!(
                        failures = state.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn snapshot(&self) -> LimitSnapshot {
        let state = self.state.lock().expect("limit state poisoned");
        LimitSnapshot {
            daily_used: state.daily_used,
            hourly_used: state.hourly_used,
            daily_limit: self.config.daily_limit,
            hourly_limit: self.config.hourly_limit,
            consecutive_failures: state.consecutive_failures,
            breaker: state.breaker,
            last_failure_at: state.last_failure_at,
        }
    }
}
