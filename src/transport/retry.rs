//! Pure retry decisions for connection establishment
//!
//! Delays grow exponentially from `initial_delay_ms` by `multiplier` up to
//! `max_delay_ms`, and at most `max_attempts` attempts are made in total.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of connection attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    15_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Outcome of consulting the policy after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then make attempt number `attempt`
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is spent
    GiveUp,
}

impl RetryPolicy {
    /// Policy that retries quickly, for tests and local buses
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 1,
            multiplier: 1.0,
            max_delay_ms: 1,
        }
    }

    /// Decide what follows the failure of attempt number `failed_attempt`
    /// (1-based). No sleep follows the final attempt.
    pub fn decide(&self, failed_attempt: u32) -> RetryDecision {
        if failed_attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry {
            attempt: failed_attempt + 1,
            delay: self.delay_after(failed_attempt),
        }
    }

    /// Delay to wait after failed attempt `failed_attempt` (1-based)
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Upper bound on the time spent sleeping across all retries
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_after(n)).sum()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("multiplier must be a finite number >= 1.0".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("initial_delay_ms must not exceed max_delay_ms".to_string());
        }
        Ok(())
    }
}
