//! Bounded restart policy for crashed handler and surrogate processes.
//!
//! A process that keeps failing is relaunched at most
//! [`RestartPolicy::max_attempts`] times in a row. The delay before attempt
//! `n` (0-indexed) is `first × factor^n`, clamped to `max`. The caller resets
//! its attempt counter whenever the process proves healthy again.

use std::time::Duration;

use crate::config::RestartConfig;

/// Restart budget plus exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Consecutive relaunches allowed before giving up.
    pub max_attempts: u32,
    /// Delay before the first relaunch.
    pub first: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            first: Duration::from_millis(config.backoff_first),
            max: Duration::from_millis(config.backoff_max),
            factor: config.backoff_factor,
        }
    }
}

impl RestartPolicy {
    /// Delay before relaunch number `attempt`, or `None` once the budget
    /// is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.backoff(attempt))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
