//! # chatlink
//!
//! Resilient client for OpenRouter-style chat completion aggregators.
//!
//! ## Overview
//!
//! One base URL and one API key front many upstream model providers. This
//! crate owns everything between "I want a completion from model X" and the
//! HTTP wire: credential lookup, request validation, rate-limit admission,
//! retries with backoff, error classification, stream decoding, and a cached
//! model catalog used for capability lookup and fallback.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatlink::{ChatClientBuilder, ChatMessage, ChatRequest};
//!
//! #[tokio::main]
//! async fn main() -> chatlink::Result<()> {
//!     let client = ChatClientBuilder::new()
//!         .with_api_key("sk-or-...")
//!         .build()
//!         .await?;
//!
//!     let request = ChatRequest::new(
//!         "openai/gpt-4o-mini",
//!         vec![ChatMessage::user("Hello, how are you?")],
//!     );
//!     let response = client.chat(&request).await?;
//!     println!("{}", response.content());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`ChatClient`] facade, builder and retry policy |
//! | [`catalog`] | Cached model catalog, capability filters and fallback selection |
//! | [`config`] | Client configuration with env and YAML layering |
//! | [`credentials`] | API key providers (static, environment, OS keyring) |
//! | [`error_code`] | Error taxonomy and classifier |
//! | [`pipeline`] | Incremental server-sent-event decoding |
//! | [`resilience`] | Token buckets and the admission-controlling rate limiter |
//! | [`sanitize`] | Credential redaction for surfaced messages |
//! | [`transport`] | HTTP transport |
//! | [`types`] | Requests, responses, stream fragments and call options |

pub mod catalog;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error_code;
pub mod pipeline;
pub mod resilience;
pub mod sanitize;
pub mod transport;
pub mod types;

pub use catalog::{Capability, ModelCatalog, ModelInfo};
pub use client::{ChatClient, ChatClientBuilder};
pub use config::ClientConfig;
pub use error_code::{ClassifiedError, ErrorKind};
pub use types::{
    CallOptions, ChatMessage, ChatRequest, ChatResponse, Role, StreamFragment, Usage,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
