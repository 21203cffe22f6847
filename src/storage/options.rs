use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::metrics::CacheMetrics;

/// Backoff schedule used when listing or watching a kind fails.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor applied after every failure.
    pub multiplier: f64,
    /// Attempts before the population unit gives up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failures` consecutive failures (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Returns true when another attempt is allowed after `attempts` tries.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Configuration options supplied when creating a [`crate::RelationCache`].
#[derive(Clone)]
pub struct CacheOptions {
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn CacheMetrics>>,
    /// Retry schedule for bootstrap listing and watch re-establishment
    pub retry: RetryPolicy,
    /// How often population workers wake to check for cancellation
    pub watch_poll_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            metrics: None,
            retry: RetryPolicy::default(),
            watch_poll_interval: Duration::from_millis(50),
        }
    }
}

impl CacheOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replaces the retry schedule.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the cancellation poll interval for population workers.
    pub fn watch_poll_interval(mut self, interval: Duration) -> Self {
        self.watch_poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(40), Duration::from_millis(5_000));
    }

    #[test]
    fn attempt_budget() {
        let unbounded = RetryPolicy::default();
        assert!(unbounded.allows(u32::MAX - 1));
        let bounded = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::default()
        };
        assert!(bounded.allows(2));
        assert!(!bounded.allows(3));
    }

    #[test]
    fn retry_policy_reads_partial_toml() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 5\ninitial_backoff_ms = 10")
            .expect("parse retry policy");
        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.initial_backoff_ms, 10);
        assert_eq!(policy.max_backoff_ms, 5_000);
    }
}
