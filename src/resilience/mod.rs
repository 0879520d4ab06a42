//! # Resilience Module
//!
//! Admission control in front of the transport.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`bucket`] | Token bucket arithmetic and its configuration |
//! | [`rate_limiter`] | Worker-owned buckets, priority queue and in-flight cap |
//!
//! Every outbound attempt, including each retry, passes through
//! [`RateLimiter::acquire`] and holds the returned [`Admission`] until the
//! response (or the stream) is finished.
//!
//! ```rust
//! use chatlink::resilience::{BucketConfig, RateLimiter, RateLimiterConfig};
//! use chatlink::types::CallOptions;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> chatlink::Result<()> {
//! let limiter = RateLimiter::new(
//!     RateLimiterConfig::new()
//!         .with_bucket(BucketConfig::new(10.0, 1.0))
//!         .with_max_in_flight(5),
//! )?;
//!
//! let admission = limiter.acquire("openai/gpt-4o-mini", &CallOptions::new()).await?;
//! // ... send the request ...
//! drop(admission);
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod rate_limiter;

pub use bucket::{BucketConfig, TokenBucket};
pub use rate_limiter::{
    AdmitOutcome, Admission, RateLimiter, RateLimiterConfig, RateLimiterSnapshot,
    DEFAULT_MAX_IN_FLIGHT,
};
