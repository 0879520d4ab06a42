//! Transport layer.
//!
//! [`HttpTransport`] speaks the aggregator's HTTP API: unary and streaming chat
//! completions, `/models` and `/key`. Failures leave this module already
//! classified as [`crate::Error::Api`].

pub mod http;

pub use http::{HttpTransport, REQUEST_ID_HEADER};
