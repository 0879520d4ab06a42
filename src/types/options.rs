//! Per-call knobs: admission priority, cancellation and an overall deadline.

use crate::Error;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lower values are admitted first.
pub type Priority = u32;

pub const PRIORITY_HIGH: Priority = 0;
pub const PRIORITY_NORMAL: Priority = 50;
pub const PRIORITY_LOW: Priority = 100;

/// Options carried through admission, retries and transport for one logical call.
///
/// The deadline is absolute, so it bounds the whole call including queueing and
/// backoff sleeps, not a single attempt.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub priority: Priority,
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            priority: PRIORITY_NORMAL,
            cancel: None,
            deadline: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Resolves once the token fires or the deadline passes. Never resolves otherwise.
    pub async fn interrupted(&self) -> Error {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancelled => Error::cancelled("call cancelled by caller"),
            _ = expired => Error::cancelled("call deadline exceeded"),
        }
    }

    /// Non-blocking check, used between steps.
    pub fn check(&self) -> crate::Result<()> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(Error::cancelled("call cancelled by caller"));
        }
        if self.deadline.is_some_and(|at| at <= Instant::now()) {
            return Err(Error::cancelled("call deadline exceeded"));
        }
        Ok(())
    }
}
