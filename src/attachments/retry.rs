use std::time::Duration;

use rand::Rng;

use crate::utils::SyncError;

const MAX_EXPONENT: u32 = 16;

/// Exponential backoff with jitter, bounded by an attempt ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempts` counts the tries made so far, including the failed one.
    pub fn should_retry(&self, error: &SyncError, attempts: u32) -> bool {
        error.is_retryable() && attempts < self.max_attempts
    }

    /// A server-provided `Retry-After` replaces the computed backoff.
    pub fn delay(&self, attempts: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(delay) = retry_after {
            return delay;
        }
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempts.min(MAX_EXPONENT)));
        let jitter_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        backoff + jitter
    }
}
