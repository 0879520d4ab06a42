//! Token bucket arithmetic.
//!
//! Pure state with caller-supplied timestamps, so the limiter worker stays the
//! only place that decides *when* mutation happens.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum burst size (tokens).
    pub capacity: f64,
    /// Tokens per second.
    pub refill_per_sec: f64,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Build from provider limits: `burst` tokens, refilled at `rpm / 60` per second.
    pub fn from_limits(rpm: u32, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst.max(1)),
            refill_per_sec: f64::from(rpm.max(1)) / 60.0,
        }
    }

    pub fn validate(&self, field: &str) -> Result<()> {
        if !self.capacity.is_finite() || self.capacity < 1.0 {
            return Err(Error::configuration_with_context(
                "bucket capacity must be at least 1",
                ErrorContext::new()
                    .with_field_path(format!("{}.capacity", field))
                    .with_details(format!("got {}", self.capacity))
                    .with_source("rate_limiter"),
            ));
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(Error::configuration_with_context(
                "refill rate must be positive",
                ErrorContext::new()
                    .with_field_path(format!("{}.refill_per_sec", field))
                    .with_details(format!("got {}", self.refill_per_sec))
                    .with_source("rate_limiter"),
            ));
        }
        Ok(())
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 1.0,
        }
    }
}

/// Capped, continuously replenished permit count. Starts full.
///
/// `available` always stays within `[0, capacity]`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    available: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    /// Set when the provider reports an exhausted budget.
    blocked_until: Option<Instant>,
}

impl TokenBucket {
    pub fn new(cfg: BucketConfig, now: Instant) -> Self {
        Self {
            available: cfg.capacity,
            capacity: cfg.capacity,
            refill_per_sec: cfg.refill_per_sec,
            last_refill: now,
            blocked_until: None,
        }
    }

    pub fn available(&self) -> f64 {
        self.available
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.available = (self.available + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    /// Whether a token could be taken at `now`. Call [`refill`](Self::refill) first.
    pub fn ready(&self, now: Instant) -> bool {
        self.available >= 1.0 && !self.blocked_until.is_some_and(|until| until > now)
    }

    /// Refill, then consume one token if possible.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.ready(now) {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }

    /// Return an unused token.
    pub fn refund(&mut self) {
        self.available = (self.available + 1.0).min(self.capacity);
    }

    /// Time until a token is available, assuming a fresh refill at `now`.
    pub fn wait_time(&self, now: Instant) -> Duration {
        let blocked = self
            .blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let local = if self.available >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.available) / self.refill_per_sec)
        };
        blocked.max(local)
    }

    /// Apply provider budget signals (remaining requests, time to reset).
    pub fn apply_budget(&mut self, remaining: Option<u64>, reset_after: Option<Duration>, now: Instant) {
        let Some(rem) = remaining else {
            return;
        };
        if rem == 0 {
            let after = reset_after.unwrap_or(Duration::from_secs(1));
            self.blocked_until = Some(now + after);
        } else {
            self.blocked_until = None;
            self.available = self.available.min(rem as f64);
        }
    }
}
