use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::prelude::{CoreError, CoreResult};

/// Exponential delay applied before a new session after recent subprocess crashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Crashes in a row after which new sessions are refused until the streak resets.
    pub max_consecutive_crashes: u32,
    /// A crash older than this no longer counts towards the streak.
    pub reset_after_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_consecutive_crashes: 5,
            reset_after_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> CoreResult<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(CoreError::InvalidConfig(
                "backoff multiplier must be at least 1".into(),
            ));
        }
        if self.max_consecutive_crashes == 0 {
            return Err(CoreError::InvalidConfig(
                "backoff needs at least one allowed crash".into(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(CoreError::InvalidConfig(
                "backoff max delay below initial delay".into(),
            ));
        }
        Ok(())
    }

    /// Delay owed after `crashes` consecutive crashes, before subtracting elapsed time.
    pub fn delay_for(&self, crashes: u32) -> Duration {
        if crashes == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(crashes.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Crash streak bookkeeping for one manager.
#[derive(Debug, Clone)]
pub struct CrashBackoff {
    policy: BackoffPolicy,
    consecutive: u32,
    last_crash: Option<Instant>,
}

impl CrashBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
            last_crash: None,
        }
    }

    fn streak_expired(&self, now: Instant) -> bool {
        match self.last_crash {
            Some(at) => {
                now.saturating_duration_since(at)
                    >= Duration::from_millis(self.policy.reset_after_ms)
            }
            None => true,
        }
    }

    pub fn record_crash(&mut self, now: Instant) {
        if self.streak_expired(now) {
            self.consecutive = 0;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        self.last_crash = Some(now);
    }

    /// A full lap without failure clears the streak.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
        self.last_crash = None;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Remaining wait before the next spawn, or an error once the streak is spent.
    pub fn next_delay(&self, now: Instant) -> CoreResult<Duration> {
        if self.consecutive == 0 || self.streak_expired(now) {
            return Ok(Duration::ZERO);
        }
        if self.consecutive >= self.policy.max_consecutive_crashes {
            return Err(CoreError::BackoffExhausted {
                crashes: self.consecutive,
            });
        }
        let owed = self.policy.delay_for(self.consecutive);
        let elapsed = self
            .last_crash
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        Ok(owed.saturating_sub(elapsed))
    }
}
