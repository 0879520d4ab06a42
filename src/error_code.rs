//! Error taxonomy and classification.
//!
//! Every failed call is reduced to a [`ClassifiedError`] carrying one of seven
//! [`ErrorKind`]s plus a retry decision. Classification is deterministic: the same
//! outcome always yields the same kind, message and retry flag.
//!
//! | Outcome | Kind | Retryable |
//! |---------|------|-----------|
//! | HTTP 401 / 403 | `Authentication` | no |
//! | HTTP 429 | `RateLimit { retry_after }` | yes |
//! | HTTP 408 / 504, connect or timeout failure, truncated stream | `Network` | yes |
//! | HTTP 500..=503 | `ServerError` | yes |
//! | HTTP 400 / 404 naming an unknown model | `ModelUnavailable` | no (fallback only) |
//! | other HTTP 400 | `Validation` | no |
//! | anything else | `Unknown` | no |
//!
//! ```rust
//! use chatlink::error_code::{ErrorClassifier, ErrorKind, Outcome};
//! use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
//! use std::time::Duration;
//!
//! let mut headers = HeaderMap::new();
//! headers.insert(RETRY_AFTER, HeaderValue::from_static("45"));
//! let err = ErrorClassifier::default().classify(Outcome::Http {
//!     status: 429,
//!     headers: &headers,
//!     body: "",
//! });
//! assert_eq!(err.kind, ErrorKind::RateLimit { retry_after: Duration::from_secs(45) });
//! assert!(err.retryable);
//! ```

use crate::sanitize::Sanitizer;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Wait applied to a 429 that carries no hint in headers or body.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

const MAX_MESSAGE_CHARS: usize = 500;

/// Closed error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect failure, timeout, broken or truncated stream
    Network,
    /// Invalid, expired, or missing API key
    Authentication,
    /// Request rate limit exceeded; wait at least `retry_after`
    RateLimit { retry_after: Duration },
    /// Provider-side failure
    ServerError,
    /// Malformed request or parameters
    Validation,
    /// Requested model does not exist or cannot serve requests
    ModelUnavailable,
    /// Error could not be classified
    Unknown,
}

impl ErrorKind {
    /// Returns the canonical code string (e.g., `"E2001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "E1001",
            Self::Authentication => "E1002",
            Self::ModelUnavailable => "E1004",
            Self::RateLimit { .. } => "E2001",
            Self::ServerError => "E3001",
            Self::Network => "E3003",
            Self::Unknown => "E9999",
        }
    }

    /// Returns the standard name (e.g., `"rate_limit"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::RateLimit { .. } => "rate_limit",
            Self::ServerError => "server_error",
            Self::Validation => "validation",
            Self::ModelUnavailable => "model_unavailable",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a blind retry of the same request may succeed.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimit { .. } | Self::ServerError
        )
    }

    /// Whether the request should be reissued against another model.
    #[inline]
    pub fn fallbackable(&self) -> bool {
        matches!(self, Self::ModelUnavailable)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit { retry_after } => {
                write!(f, "{} (retry after {}s)", self.name(), retry_after.as_secs())
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A failure reduced to the taxonomy, with sanitized text only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} [{}]: {message}", .kind.code())]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    /// Sanitized, human-readable message.
    pub message: String,
    /// Sanitized raw cause (response body or transport error text).
    pub cause: Option<String>,
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    pub retryable: bool,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: crate::sanitize::redact(&message.into()),
            cause: None,
            status: None,
            retryable: kind.retryable(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(crate::sanitize::redact(&cause.into()));
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn fallbackable(&self) -> bool {
        self.kind.fallbackable()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.kind.retry_after()
    }
}

/// Low-level transport failure, decoupled from the HTTP library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailureKind {
    Connect,
    Timeout,
    /// Connection broke while reading the body.
    Io,
    /// Request could not be built or sent for a non-network reason.
    Request,
}

#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub kind: TransportFailureKind,
    pub message: String,
}

impl TransportFailure {
    pub fn new(kind: TransportFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TransportFailureKind::Timeout,
            format!("request timed out after {}ms", after.as_millis()),
        )
    }
}

impl From<&reqwest::Error> for TransportFailure {
    fn from(e: &reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportFailureKind::Timeout
        } else if e.is_connect() {
            TransportFailureKind::Connect
        } else if e.is_body() || e.is_decode() || e.is_request() {
            TransportFailureKind::Io
        } else {
            TransportFailureKind::Request
        };
        Self::new(kind, e.to_string())
    }
}

/// A raw call outcome to classify.
#[derive(Debug)]
pub enum Outcome<'a> {
    /// Non-success HTTP response.
    Http {
        status: u16,
        headers: &'a HeaderMap,
        body: &'a str,
    },
    Transport(TransportFailure),
    /// Connection closed before the stream's terminal frame.
    TruncatedStream,
    /// An error object delivered inside an otherwise successful stream.
    StreamError { body: &'a str },
    /// A success response whose body did not match the expected shape.
    MalformedResponse { detail: String },
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    metadata: Option<ErrorMetadata>,
}

#[derive(Debug, Deserialize)]
struct ErrorMetadata {
    #[serde(default)]
    retry_after: Option<f64>,
}

impl ErrorBody {
    fn code_str(&self) -> Option<String> {
        match self.code.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn code_status(&self) -> Option<u16> {
        match self.code.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Maps outcomes to [`ClassifiedError`]s, scrubbing credentials from all text.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    sanitizer: Sanitizer,
}

impl ErrorClassifier {
    pub fn new(sanitizer: Sanitizer) -> Self {
        Self { sanitizer }
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    pub fn classify(&self, outcome: Outcome<'_>) -> ClassifiedError {
        match outcome {
            Outcome::Http {
                status,
                headers,
                body,
            } => self.classify_http(status, Some(headers), body),
            Outcome::Transport(failure) => {
                let kind = match failure.kind {
                    TransportFailureKind::Connect
                    | TransportFailureKind::Timeout
                    | TransportFailureKind::Io => ErrorKind::Network,
                    TransportFailureKind::Request => ErrorKind::Unknown,
                };
                let label = match failure.kind {
                    TransportFailureKind::Connect => "connection failed",
                    TransportFailureKind::Timeout => "timeout",
                    TransportFailureKind::Io => "connection interrupted",
                    TransportFailureKind::Request => "request failed",
                };
                let msg = self.sanitizer.sanitize(&failure.message);
                self.build(kind, format!("{}: {}", label, msg), None, Some(msg))
            }
            Outcome::TruncatedStream => self.build(
                ErrorKind::Network,
                "stream truncated: connection closed before [DONE]".to_string(),
                None,
                None,
            ),
            Outcome::StreamError { body } => {
                let status = serde_json::from_str::<ErrorEnvelope>(body)
                    .ok()
                    .and_then(|env| env.error.code_status())
                    .filter(|s| (400..=599).contains(s));
                match status {
                    Some(status) => {
                        let mut err = self.classify_http(status, None, body);
                        err.status = None;
                        err
                    }
                    None => {
                        let msg = self.extract_message(body);
                        self.build(
                            ErrorKind::Unknown,
                            format!("stream error: {}", msg),
                            None,
                            Some(self.sanitizer.sanitize(body)),
                        )
                    }
                }
            }
            Outcome::MalformedResponse { detail } => {
                let msg = self.sanitizer.sanitize(&detail);
                self.build(
                    ErrorKind::Unknown,
                    format!("malformed response: {}", msg),
                    None,
                    Some(msg),
                )
            }
        }
    }

    fn classify_http(&self, status: u16, headers: Option<&HeaderMap>, body: &str) -> ClassifiedError {
        let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
        let message = self.extract_message(body);

        let kind = match status {
            401 | 403 => ErrorKind::Authentication,
            429 => ErrorKind::RateLimit {
                retry_after: headers
                    .and_then(retry_after_header)
                    .or_else(|| envelope.as_ref().and_then(retry_after_body))
                    .unwrap_or(DEFAULT_RETRY_AFTER),
            },
            408 | 504 => ErrorKind::Network,
            500..=503 => ErrorKind::ServerError,
            400 | 404 if is_unknown_model(envelope.as_ref(), &message) => {
                ErrorKind::ModelUnavailable
            }
            400 => ErrorKind::Validation,
            _ => ErrorKind::Unknown,
        };

        self.build(
            kind,
            format!("HTTP {}: {}", status, message),
            Some(status),
            Some(self.sanitizer.sanitize(body)),
        )
    }

    fn build(
        &self,
        kind: ErrorKind,
        message: String,
        status: Option<u16>,
        cause: Option<String>,
    ) -> ClassifiedError {
        let err = ClassifiedError {
            kind,
            message: self.sanitizer.sanitize(&message),
            cause: cause.filter(|c| !c.is_empty()),
            status,
            retryable: kind.retryable(),
        };
        tracing::debug!(
            kind = kind.name(),
            code = kind.code(),
            http_status = status,
            retryable = err.retryable,
            message = err.message.as_str(),
            "chatlink classified error"
        );
        err
    }

    fn extract_message(&self, body: &str) -> String {
        let raw = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|env| env.error.message)
            .unwrap_or_else(|| body.trim().to_string());
        let raw = if raw.is_empty() {
            "no error details".to_string()
        } else {
            raw
        };
        truncate(&self.sanitizer.sanitize(&raw), MAX_MESSAGE_CHARS)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

/// Parses `Retry-After: <seconds>`; fractional seconds are accepted.
fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = raw.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn retry_after_body(env: &ErrorEnvelope) -> Option<Duration> {
    let secs = env.error.metadata.as_ref()?.retry_after?;
    Duration::try_from_secs_f64(secs).ok()
}

fn is_unknown_model(envelope: Option<&ErrorEnvelope>, message: &str) -> bool {
    if let Some(code) = envelope.and_then(|e| e.error.code_str()) {
        if matches!(
            code.as_str(),
            "model_not_found" | "model_not_supported" | "invalid_model" | "model_decommissioned"
        ) {
            return true;
        }
    }
    let m = message.to_lowercase();
    m.contains("model")
        && (m.contains("not found")
            || m.contains("not a valid model")
            || m.contains("does not exist")
            || m.contains("unknown model")
            || m.contains("no longer supported")
            || m.contains("decommission"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn http(status: u16, body: &str) -> ClassifiedError {
        let headers = HeaderMap::new();
        ErrorClassifier::default().classify(Outcome::Http {
            status,
            headers: &headers,
            body,
        })
    }

    #[test]
    fn rate_limit_uses_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("45"));
        let err = ErrorClassifier::default().classify(Outcome::Http {
            status: 429,
            headers: &headers,
            body: r#"{"error":{"message":"Rate limit exceeded","code":429}}"#,
        });
        assert_eq!(
            err.kind,
            ErrorKind::RateLimit {
                retry_after: Duration::from_secs(45)
            }
        );
        assert!(err.retryable);
        assert_eq!(err.status, Some(429));
        assert_eq!(err.message, "HTTP 429: Rate limit exceeded");
    }

    #[test]
    fn rate_limit_falls_back_to_body_then_default() {
        let err = http(
            429,
            r#"{"error":{"message":"slow down","metadata":{"retry_after":12}}}"#,
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));

        let err = http(429, "");
        assert_eq!(err.retry_after(), Some(DEFAULT_RETRY_AFTER));
    }

    #[test]
    fn oversized_retry_hints_fall_back_to_default() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1e30"));
        let err = ErrorClassifier::default().classify(Outcome::Http {
            status: 429,
            headers: &headers,
            body: "",
        });
        assert_eq!(err.retry_after(), Some(DEFAULT_RETRY_AFTER));
        assert!(err.retryable);

        let err = http(429, r#"{"error":{"message":"slow down","metadata":{"retry_after":1e30}}}"#);
        assert_eq!(err.retry_after(), Some(DEFAULT_RETRY_AFTER));
    }

    #[test]
    fn auth_failures_are_not_retryable() {
        for status in [401, 403] {
            let err = http(status, r#"{"error":{"message":"No auth credentials found"}}"#);
            assert_eq!(err.kind, ErrorKind::Authentication);
            assert!(!err.retryable);
        }
    }

    #[test]
    fn server_errors_are_retryable() {
        for status in 500..=503 {
            let err = http(status, "upstream exploded");
            assert_eq!(err.kind, ErrorKind::ServerError, "status {}", status);
            assert!(err.retryable);
        }
    }

    #[test]
    fn request_timeout_is_network() {
        assert_eq!(http(408, "").kind, ErrorKind::Network);
        assert!(http(408, "").retryable);
    }

    #[test]
    fn unknown_model_is_model_unavailable() {
        let err = http(
            400,
            r#"{"error":{"message":"foo/bar is not a valid model ID","code":400}}"#,
        );
        assert_eq!(err.kind, ErrorKind::ModelUnavailable);
        assert!(!err.retryable);
        assert!(err.fallbackable());

        let err = http(400, "model not found");
        assert_eq!(err.kind, ErrorKind::ModelUnavailable);

        let err = http(404, r#"{"error":{"message":"gone","code":"model_not_found"}}"#);
        assert_eq!(err.kind, ErrorKind::ModelUnavailable);
    }

    #[test]
    fn other_bad_requests_are_validation() {
        let err = http(400, r#"{"error":{"message":"temperature must be <= 2"}}"#);
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable);
        assert!(!err.fallbackable());
    }

    #[test]
    fn unmatched_status_is_unknown() {
        for status in [402, 409, 418] {
            let err = http(status, "");
            assert_eq!(err.kind, ErrorKind::Unknown);
            assert!(!err.retryable);
        }
    }

    #[test]
    fn transport_failures() {
        let c = ErrorClassifier::default();
        let t = c.classify(Outcome::Transport(TransportFailure::timeout(
            Duration::from_secs(60),
        )));
        assert_eq!(t.kind, ErrorKind::Network);
        assert!(t.retryable);
        assert!(t.message.starts_with("timeout"));

        let r = c.classify(Outcome::Transport(TransportFailure::new(
            TransportFailureKind::Request,
            "builder error",
        )));
        assert_eq!(r.kind, ErrorKind::Unknown);
        assert!(!r.retryable);
    }

    #[test]
    fn truncated_stream_is_network() {
        let err = ErrorClassifier::default().classify(Outcome::TruncatedStream);
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.retryable);
    }

    #[test]
    fn stream_error_frame_uses_embedded_code() {
        let c = ErrorClassifier::default();
        let err = c.classify(Outcome::StreamError {
            body: r#"{"error":{"code":502,"message":"provider disconnected"}}"#,
        });
        assert_eq!(err.kind, ErrorKind::ServerError);

        let err = c.classify(Outcome::StreamError {
            body: r#"{"error":{"message":"weird"}}"#,
        });
        assert_eq!(err.kind, ErrorKind::Unknown);
    }

    #[test]
    fn messages_never_carry_credentials() {
        let c = ErrorClassifier::new(Sanitizer::new().with_secret("my-secret-key-123"));
        let err = c.classify(Outcome::Http {
            status: 401,
            headers: &HeaderMap::new(),
            body: r#"{"error":{"message":"key my-secret-key-123 rejected; Bearer sk-abcdefghijklmnopqrstuv"}}"#,
        });
        assert!(!err.message.contains("my-secret-key-123"));
        assert!(!err.message.contains("sk-abcdefghijklmnopqrstuv"));
        assert!(!err.cause.unwrap_or_default().contains("my-secret-key-123"));
    }

    #[test]
    fn classification_is_deterministic() {
        let a = http(503, r#"{"error":{"message":"no providers"}}"#);
        let b = http(503, r#"{"error":{"message":"no providers"}}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn codes_match_kinds() {
        assert_eq!(ErrorKind::Authentication.code(), "E1002");
        assert_eq!(
            ErrorKind::RateLimit {
                retry_after: Duration::ZERO
            }
            .code(),
            "E2001"
        );
        assert_eq!(ErrorKind::Unknown.code(), "E9999");
    }
}
