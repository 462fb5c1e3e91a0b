//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Exponential backoff used when the store or broker is unreachable.
///
/// `delay = base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
/// Callers stop retrying once `max_elapsed` has passed since the first failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound of a single delay.
    pub max_delay: Duration,

    /// Total time budget across all retries.
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    /// Calculate delay for the next retry based on attempt number.
    ///
    /// Example with base_delay=50ms, multiplier=2.0, max_delay=2s:
    /// - attempt 1: 50ms
    /// - attempt 2: 100ms
    /// - attempt 3: 200ms
    /// - attempt 7: 2s (capped)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Whether another retry fits in the budget.
    pub fn should_retry(&self, elapsed: Duration) -> bool {
        elapsed < self.max_elapsed
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(60),
        }
    }
}
