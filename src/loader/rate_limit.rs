//! Token-bucket rate limiting
//!
//! One bucket is shared by every in-flight request of a batch. Tokens are
//! request weights; the bucket refills continuously. A server `Retry-After`
//! pauses the whole bucket, not just the request that received it.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::metrics::record_limiter_acquired;

/// Share of the per-minute budget available as an immediate burst
const BURST_FRACTION: f64 = 0.1;

/// Rate limiter errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Requested weight can never be satisfied
    #[error("request weight {weight} exceeds bucket capacity {capacity}")]
    WeightExceedsCapacity {
        /// Weight asked for
        weight: u32,
        /// Bucket capacity
        capacity: f64,
    },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    paused_until: Option<Instant>,
}

/// Token bucket safe under concurrent acquisition
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a bucket holding `capacity` tokens, refilled at `refill_per_sec`
    ///
    /// The bucket starts full.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity.max(1.0),
                last_refill: Instant::now(),
                paused_until: None,
            }),
        }
    }

    /// Bucket sized for an exchange weight budget per minute
    ///
    /// Burst capacity plus one minute of refill equals the budget, so no
    /// sliding minute can exceed it.
    pub fn weight_per_minute(budget: u32) -> Self {
        let budget = f64::from(budget.max(1));
        let capacity = (budget * BURST_FRACTION).max(1.0);
        let refill_per_sec = (budget - capacity).max(1.0) / 60.0;
        Self::new(capacity, refill_per_sec)
    }

    /// Maximum tokens held
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens currently available
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Wait until `weight` tokens are available and take them
    pub async fn acquire(&self, weight: u32) -> Result<(), RateLimitError> {
        let needed = f64::from(weight);
        if needed > self.capacity {
            return Err(RateLimitError::WeightExceedsCapacity {
                weight,
                capacity: self.capacity,
            });
        }

        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);

                match state.paused_until {
                    Some(until) if until > now => until - now,
                    _ => {
                        state.paused_until = None;
                        if state.tokens >= needed {
                            state.tokens -= needed;
                            record_limiter_acquired(started.elapsed(), state.tokens);
                            return Ok(());
                        }
                        Duration::from_secs_f64((needed - state.tokens) / self.refill_per_sec)
                    }
                }
            };

            debug!(weight = weight, wait_ms = wait.as_millis(), "Waiting for rate limit tokens");
            sleep(wait).await;
        }
    }

    /// Stop handing out tokens for `duration` (server `Retry-After`)
    ///
    /// Extends an existing pause, never shortens it. Tokens are drained so the
    /// bucket does not burst the moment the pause ends.
    pub async fn pause_for(&self, duration: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + duration;
        if state.paused_until.map_or(true, |current| until > current) {
            warn!(pause_ms = duration.as_millis(), "Pausing rate limiter");
            state.paused_until = Some(until);
        }
        state.tokens = 0.0;
        state.last_refill = until.max(state.last_refill);
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if now <= state.last_refill {
            return;
        }
        let elapsed = (now - state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}
