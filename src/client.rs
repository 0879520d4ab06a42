//! Client facade.
//!
//! [`ChatClient`] wires the limiter, retry orchestration, transport and model
//! catalog together. Build one with [`ChatClientBuilder`].

pub mod builder;
pub mod core;
pub mod policy;

pub use builder::ChatClientBuilder;
pub use self::core::ChatClient;
pub use policy::{Decision, RetryOrchestrator, RetryPolicy};
