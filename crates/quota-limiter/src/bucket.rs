//! Token bucket burst limiter.
//!
//! Each bucket owns a single lock; refill, decision and mutation all happen
//! inside it, so concurrent `has_capacity`/`consume` callers always observe a
//! consistent count.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::clock::{Clock, SystemClock};
use crate::error::QuotaError;

/// Configuration for a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum units (burst capacity). The bucket starts full.
    pub capacity: u64,
    /// Units added per second.
    pub refill_rate: f64,
}

impl BucketConfig {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.capacity == 0 {
            return Err(QuotaError::invalid("bucket capacity must be at least 1"));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(QuotaError::invalid(format!(
                "refill rate must be a non-negative finite number, got {}",
                self.refill_rate
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub available: f64,
    pub capacity: u64,
    pub refill_rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket driven by the system clock.
    pub fn new(config: BucketConfig) -> Result<Self, QuotaError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BucketConfig, clock: Arc<dyn Clock>) -> Result<Self, QuotaError> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            state: Mutex::new(BucketState {
                tokens: config.capacity as f64,
                last_refill: now,
            }),
            clock,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Whether at least `n` units are available right now. Never consumes.
    pub fn has_capacity(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens >= n as f64
    }

    /// Take `n` units if available.
    ///
    /// Returns `false` and leaves the bucket untouched when fewer than `n`
    /// units are available.
    pub fn consume(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        let requested = n as f64;
        if state.tokens >= requested {
            state.tokens -= requested;
            true
        } else {
            trace!(
                requested = n,
                available = state.tokens,
                "bucket has insufficient capacity"
            );
            false
        }
    }

    /// Current number of units after refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            available: self.available(),
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }

    /// `tokens = min(capacity, tokens + elapsed * refill_rate)`.
    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        // A clock stepping backwards adds nothing.
        let elapsed = (now - state.last_refill)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        state.last_refill = now;
    }
}
