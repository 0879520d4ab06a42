//! # Types Module
//!
//! Strongly-typed request and response shapes for the chat completions API.
//! Payloads are validated at the boundary so malformed shapes are rejected
//! before any network call.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ChatMessage`] | Role-tagged message |
//! | [`ChatRequest`] | Model, messages and generation parameters |
//! | [`GenerationParams`] | Sampling knobs with validated ranges |
//! | [`ChatResponse`] | Unary completion result |
//! | [`StreamFragment`] | One decoded streaming piece, or the terminal marker |
//! | [`KeyInfo`] | Usage and limits of the configured key |
//! | [`CallOptions`] | Priority, cancellation token and deadline for one call |
//!
//! ## Example
//!
//! ```rust
//! use chatlink::types::{ChatMessage, ChatRequest};
//!
//! let request = ChatRequest::new(
//!     "openai/gpt-4o-mini",
//!     vec![
//!         ChatMessage::system("You are terse."),
//!         ChatMessage::user("Say hi"),
//!     ],
//! )
//! .temperature(0.2)
//! .max_tokens(64);
//!
//! request.validate(32_000).unwrap();
//! ```

pub mod key;
pub mod message;
pub mod options;
pub mod request;
pub mod response;

pub use key::{KeyInfo, KeyRateLimit};
pub use message::{ChatMessage, Role};
pub use options::{CallOptions, Priority, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL};
pub use request::{ChatRequest, GenerationParams, ProviderPayload};
pub use response::{ChatResponse, Choice, StreamFragment, Usage};
