//! Retry policy for transient broker transport errors.
//!
//! Bound to the [`crate::error::BrokerErrorKind`] taxonomy rather than a
//! catch-all retry decorator: only [`BrokerErrorKind::is_retryable`] kinds
//! ever consult this policy, and they are retried once per call.

use std::time::Duration;

use rand::Rng;

/// A bounded, jittered backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    /// One retry after a short, jittered backoff, matching the broker's
    /// "transient errors retried once with short backoff" contract.
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay to use before the given attempt (0-indexed: the first retry is
    /// attempt 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32 - 1).max(1.0);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter_span = capped * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let millis = (capped + jitter).max(0.0) as u64;
        Duration::from_millis(millis)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
