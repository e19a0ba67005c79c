//! Reconnect backoff.
//!
//! Exponential backoff with a bounded maximum interval. The store client
//! reconnects indefinitely; the cap only limits how long a single wait gets.

use crate::config::StoreConfig;
use std::time::Duration;

/// Backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First delay.
    pub initial_backoff: Duration,
    /// Largest delay.
    pub max_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy from explicit bounds.
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
        }
    }

    /// Policy configured for a store.
    pub fn from_store(config: &StoreConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

/// Exponential backoff calculator.
///
/// Delays grow as initial, 2x, 4x, 8x, ... capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Creates a new exponential backoff calculator.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
        }
    }

    /// Calculates the next backoff duration.
    pub fn next_backoff(&mut self) -> Duration {
        self.current_attempt = self.current_attempt.saturating_add(1);
        let exponent = (self.current_attempt - 1).min(31);
        let multiplier = 2u32.saturating_pow(exponent);

        self.policy
            .initial_backoff
            .saturating_mul(multiplier)
            .min(self.policy.max_backoff)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Resets the calculator after a successful connect.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
