//! Channel retry policy (exponential backoff with a ceiling).

use std::time::Duration;

use courier_common::config::AppConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per channel, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.dispatch_max_attempts.max(1),
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            backoff_multiplier: config.retry_backoff_multiplier,
        }
    }

    /// Whether attempt `attempt_number` failing transiently earns another attempt.
    pub fn should_retry(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts
    }

    /// Delay before attempt `attempt_number + 1`:
    /// `initial * multiplier^(attempt_number - 1)`, capped at `max_delay`.
    pub fn delay_after(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(63) as i32;
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}
