//! Token-bucket rate limiting for broadcasts, syncs, and pattern shares.
//!
//! Buckets refill continuously against an injected [`TimeProvider`] so
//! limits are reproducible under test. Overflow reports the cooldown until
//! the next token becomes available.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;

use crate::TimeProvider;

/// Configuration for a token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket can hold.
    pub capacity: u64,
    /// Tokens added per refill interval.
    pub refill_tokens: u64,
    /// Refill interval in milliseconds.
    pub refill_interval_ms: u64,
}

impl TokenBucketConfig {
    /// A bucket allowing `n` operations per minute.
    pub fn per_minute(n: u64) -> Self {
        Self {
            capacity: n,
            refill_tokens: n,
            refill_interval_ms: 60_000,
        }
    }

    /// A bucket allowing `n` operations per hour.
    pub fn per_hour(n: u64) -> Self {
        Self {
            capacity: n,
            refill_tokens: n,
            refill_interval_ms: 3_600_000,
        }
    }
}

/// Error returned when a bucket is exhausted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("rate limited, retry after {retry_after_ms} ms")]
pub struct RateLimitError {
    /// Milliseconds until at least one token is available again.
    pub retry_after_ms: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_ms: u64,
}

/// A token bucket refilled continuously from a deterministic clock.
pub struct TokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
    time: Arc<dyn TimeProvider>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: TokenBucketConfig, time: Arc<dyn TimeProvider>) -> Self {
        let state = BucketState {
            tokens: config.capacity as f64,
            last_refill_ms: time.unix_millis(),
        };
        Self {
            config,
            state: Mutex::new(state),
            time,
        }
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&self) -> Result<(), RateLimitError> {
        self.try_acquire_many(1)
    }

    /// Take `n` tokens at once, or report the cooldown.
    pub fn try_acquire_many(&self, n: u64) -> Result<(), RateLimitError> {
        let mut state = self.state.lock().expect("bucket lock");
        self.refill(&mut state);

        let needed = n as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            return Ok(());
        }

        let deficit = needed - state.tokens;
        let ms_per_token =
            self.config.refill_interval_ms as f64 / self.config.refill_tokens as f64;
        let retry_after_ms = (deficit * ms_per_token).ceil() as u64;
        Err(RateLimitError { retry_after_ms })
    }

    /// Tokens currently available.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock().expect("bucket lock");
        self.refill(&mut state);
        state.tokens as u64
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.time.unix_millis();
        if now <= state.last_refill_ms {
            return;
        }
        let elapsed = (now - state.last_refill_ms) as f64;
        let rate = self.config.refill_tokens as f64 / self.config.refill_interval_ms as f64;
        state.tokens = (state.tokens + elapsed * rate).min(self.config.capacity as f64);
        state.last_refill_ms = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedTimeProvider;

    fn bucket(capacity: u64, refill_ms: u64) -> (TokenBucket, FixedTimeProvider) {
        let time = FixedTimeProvider::new(0);
        let bucket = TokenBucket::new(
            TokenBucketConfig {
                capacity,
                refill_tokens: capacity,
                refill_interval_ms: refill_ms,
            },
            Arc::new(time.clone()),
        );
        (bucket, time)
    }

    #[test]
    fn test_bucket_exhausts_and_reports_cooldown() {
        let (bucket, _time) = bucket(2, 60_000);

        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());

        let err = bucket.try_acquire().unwrap_err();
        assert!(err.retry_after_ms > 0);
        assert!(err.retry_after_ms <= 30_000);
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let (bucket, time) = bucket(2, 1_000);

        assert!(bucket.try_acquire_many(2).is_ok());
        assert!(bucket.try_acquire().is_err());

        time.advance(500);
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_err());

        time.advance(1_000);
        assert_eq!(bucket.available(), 2);
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let (bucket, time) = bucket(3, 1_000);
        time.advance(100_000);
        assert_eq!(bucket.available(), 3);
    }
}
