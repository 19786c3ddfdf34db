//! Retry policy
//!
//! Exponential backoff with proportional jitter, bounded by a maximum number of
//! attempts. A server-provided `Retry-After` is a floor on the next delay.

use rand::Rng;
use std::time::Duration;

use crate::fetcher::FetchError;
use crate::loader::config::{DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS};

/// Composable retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound on the exponential part
    pub max_delay: Duration,
    /// Relative jitter in `[0, 1]`: 0.2 spreads a delay over ±20%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` total attempts and default delays
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Set the delay bounds
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Set relative jitter (clamped to `[0, 1]`)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    /// Whether attempt number `attempt` (1-based) that failed with `error`
    /// should be followed by another one
    pub fn should_retry(&self, error: &FetchError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Exponential delay after failed attempt `attempt` (1-based), without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 1u32 << exponent;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the attempt following failed attempt `attempt`
    ///
    /// `retry_after` from the server raises the delay, never lowers it.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.base_backoff(attempt);
        let jittered = if self.jitter > 0.0 && !base.is_zero() {
            let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        match retry_after {
            Some(floor) => jittered.max(floor),
            None => jittered,
        }
    }
}
