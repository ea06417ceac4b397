//! Weighted token bucket used as a global retry budget.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{RestError, Result};

/// Default budget: 1000 retries per second, shared by every request that
/// uses the same limiter.
pub const DEFAULT_RETRY_RATE: u64 = 1000;
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Gate bounding how many retry attempts may run per time window.
///
/// Tokens are refilled lazily from the wall-clock time elapsed since the
/// previous admission check; there is no background timer. The bucket
/// starts full.
pub struct RetryLimiter {
    capacity: f64,
    period: Duration,
    bucket: Mutex<TokenBucket>,
}

impl fmt::Debug for RetryLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLimiter")
            .field("capacity", &self.capacity)
            .field("period", &self.period)
            .field("available", &self.available())
            .finish()
    }
}

impl Default for RetryLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_RATE, DEFAULT_RETRY_PERIOD)
    }
}

impl RetryLimiter {
    /// Creates a limiter admitting up to `rate` units of weight per `period`.
    ///
    /// A zero `period` is treated as one millisecond.
    pub fn new(rate: u64, period: Duration) -> Self {
        let capacity = rate as f64;
        Self {
            capacity,
            period: period.max(Duration::from_millis(1)),
            bucket: Mutex::new(TokenBucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    /// Refill window.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Attempts to take `weight` tokens.
    ///
    /// Returns [`RestError::InvalidWeight`] for a zero weight and
    /// [`RestError::QuotaExceeded`] when fewer than `weight` tokens are
    /// available; in the latter case the bucket is left untouched.
    pub fn admit(&self, weight: u64) -> Result<()> {
        if weight == 0 {
            return Err(RestError::InvalidWeight);
        }

        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());

        let weight = weight as f64;
        if bucket.tokens < weight {
            return Err(RestError::QuotaExceeded);
        }
        bucket.tokens -= weight;
        Ok(())
    }

    /// Tokens available right now (after refill).
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    fn refill(&self, bucket: &mut TokenBucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = elapsed.as_secs_f64() * self.capacity / self.period.as_secs_f64();
        bucket.tokens = (bucket.tokens + added).clamp(0.0, self.capacity);
        bucket.last_refill = now;
    }
}
