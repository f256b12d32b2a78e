//! Exponential backoff retry policy, shared by commit retries and
//! fetch/gap retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds (caps exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Adds `jitter_fraction * backoff / 2` on top of each delay (0.0 = none).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th retry (1-based), ignoring `max_retries`.
    ///
    /// Used where retrying never gives up, e.g. waiting out a gap upstream.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);

        // Deterministic jitter keeps delays reproducible in tests.
        let jitter_ms = capped * self.config.jitter_fraction * 0.5;
        Duration::from_millis((capped + jitter_ms) as u64)
    }

    /// Delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        Some(self.backoff(attempt))
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }
}
