use crate::error_code::{ClassifiedError, ErrorKind};
use std::fmt;
use thiserror::Error;

/// Where a validation or configuration error came from.
///
/// Rendered after the message as ` (field: .., details: .., source: ..)`,
/// omitting unset parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Request field or config key, e.g. `request.messages[0].content`.
    pub field_path: Option<String>,
    /// Expected range, actual value and similar.
    pub details: Option<String>,
    /// Component that raised the error, e.g. `config` or `rate_limiter`.
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            ("field", &self.field_path),
            ("details", &self.details),
            ("source", &self.source),
        ];
        let mut first = true;
        for (label, value) in parts {
            let Some(value) = value else { continue };
            f.write_str(if first { " (" } else { ", " })?;
            write!(f, "{}: {}", label, value)?;
            first = false;
        }
        if !first {
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Unified error type for chatlink.
///
/// Every upstream or transport failure is classified before it reaches this type,
/// so callers match on [`ErrorKind`] instead of inspecting raw HTTP outcomes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Api(#[from] ClassifiedError),

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Validation error: {message}{context}")]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{context}")]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Model catalog is empty after refresh")]
    CatalogEmpty,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Validation { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }

    /// The classified upstream error, if this error came from an API call.
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            Error::Api(e) => Some(e),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.classified().map(|e| e.kind)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Only bad credentials and an empty catalog need a human; everything else
    /// is recoverable through retry, backoff or fallback.
    pub fn requires_user_action(&self) -> bool {
        match self {
            Error::Api(e) => e.kind == ErrorKind::Authentication,
            Error::CatalogEmpty => true,
            _ => false,
        }
    }
}
