//! Retry policy and the orchestrator that drives bounded retries.

use crate::config::duration_secs;
use crate::error_code::ErrorKind;
use crate::types::CallOptions;
use crate::{Error, ErrorContext, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound accepted for `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// How to proceed after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    /// Not retryable here, but another model may serve the request.
    Fallback,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per logical call, including the first.
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Multiply computed delays by a factor drawn from `[0.5, 1.0)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(Error::configuration_with_context(
                "retry.max_attempts out of range",
                ErrorContext::new()
                    .with_field_path("retry.max_attempts")
                    .with_details(format!(
                        "expected 1..={}, got {}",
                        MAX_ATTEMPTS_LIMIT, self.max_attempts
                    ))
                    .with_source("retry_policy"),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::configuration_with_context(
                "retry.backoff_factor must be at least 1.0",
                ErrorContext::new()
                    .with_field_path("retry.backoff_factor")
                    .with_details(format!("got {}", self.backoff_factor))
                    .with_source("retry_policy"),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::configuration_with_context(
                "retry.initial_delay exceeds retry.max_delay",
                ErrorContext::new()
                    .with_field_path("retry.initial_delay")
                    .with_source("retry_policy"),
            ));
        }
        Ok(())
    }

    /// `min(max_delay, initial_delay * backoff_factor^attempt)`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64()
            * self.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before retrying after failed attempt `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            base.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
        } else {
            base
        }
    }

    /// Decide what to do after failed attempt `attempt` (0-based).
    ///
    /// A server-provided `retry_after` replaces the computed delay as-is.
    pub fn decide(&self, err: &Error, attempt: u32) -> Decision {
        let Some(classified) = err.classified() else {
            return Decision::Fail;
        };
        if classified.retryable && attempt + 1 < self.max_attempts {
            let delay = match classified.kind {
                ErrorKind::RateLimit { retry_after } => retry_after,
                _ => self.backoff_delay(attempt),
            };
            return Decision::Retry { delay };
        }
        if classified.fallbackable() {
            Decision::Fallback
        } else {
            Decision::Fail
        }
    }
}

/// Runs an operation up to `max_attempts` times, sleeping between retryable failures.
#[derive(Debug, Clone, Default)]
pub struct RetryOrchestrator {
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `operation` receives the 0-based attempt index. The last error is returned
    /// unchanged once attempts run out; backoff sleeps stop on cancellation.
    pub async fn execute_with_retry<F, Fut, T>(&self, opts: &CallOptions, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            opts.check()?;
            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match self.policy.decide(&err, attempt) {
                Decision::Retry { delay } => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        code = err.classified().map(|c| c.code()).unwrap_or_default(),
                        error = %err,
                        "retrying request"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        interrupted = opts.interrupted() => return Err(interrupted),
                    }
                    attempt += 1;
                }
                Decision::Fallback | Decision::Fail => return Err(err),
            }
        }
    }
}
