//! # Streaming Pipeline
//!
//! Turns the raw byte stream of a streaming completion into ordered
//! [`StreamFragment`](crate::types::StreamFragment)s.
//!
//! ```text
//! HTTP body bytes → StreamDecoder (line framing, `data: ` prefix, [DONE]) → fragments
//! ```
//!
//! A stream that closes without the terminal `[DONE]` frame yields a
//! `Network` error instead of ending silently, and partial streams are never
//! resumed: a retry restarts the whole request.

pub mod decode;

pub use decode::{decode_stream, StreamDecoder};
