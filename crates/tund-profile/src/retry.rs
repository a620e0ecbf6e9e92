//! Reconnect backoff policy.

use crate::supervisor::ExitClass;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff bounded by a retry count.
///
/// The delay before retry `n` (1-based) is
/// `min(initial * multiplier^(n-1) * penalty, max)`, where `penalty`
/// is `unknown_penalty` for unclassified exits and 1 otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables reconnecting
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Extra factor for exits with no recognizable cause
    pub unknown_penalty: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            unknown_penalty: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Whether another retry is allowed after `attempts` retries.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32, class: ExitClass) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let mut ms = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        if class == ExitClass::Unknown {
            ms *= self.unknown_penalty;
        }
        let max = self.max_backoff_ms as f64;
        if !ms.is_finite() || ms > max {
            ms = max;
        }
        Duration::from_millis(ms.max(0.0) as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(format!("multiplier must be >= 1, got {}", self.multiplier));
        }
        if self.unknown_penalty.is_nan() || self.unknown_penalty < 1.0 {
            return Err(format!(
                "unknown_penalty must be >= 1, got {}",
                self.unknown_penalty
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            ));
        }
        Ok(())
    }
}
