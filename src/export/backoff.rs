//! Bounded exponential backoff between failed drain cycles.

use serde::Deserialize;
use std::time::Duration;

/// Backoff parameters for failed deliveries.
///
/// There is no attempt limit: records are never dropped because delivery
/// keeps failing, the exporter only waits longer between cycles, up to
/// `max_delay`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failure.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay after `failures` consecutive failures (0 means no delay).
    #[must_use]
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * factor;

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs).min(self.max_delay)
    }
}

/// Failure counter driving [`RetryConfig::delay_for_failures`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
}

impl Backoff {
    /// Starts with no recorded failures.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config, failures: 0 }
    }

    /// Records a failure.
    ///
    /// # Returns
    ///
    /// How long to wait before the next cycle, capped at
    /// [`RetryConfig::max_delay`].
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for_failures(self.failures)
    }

    /// Clears the failure streak after a successful delivery.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures so far.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}

/// Durations are written as integer milliseconds in config files.
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.delay_for_failures(0), Duration::ZERO);
        assert_eq!(config.delay_for_failures(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_failures(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_failures(4), Duration::from_millis(800));
        assert_eq!(config.delay_for_failures(5), Duration::from_millis(1000));
        assert_eq!(config.delay_for_failures(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(RetryConfig::default());
        let first = backoff.fail();
        let second = backoff.fail();
        assert!(second > first);
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.fail(), first);
    }
}
