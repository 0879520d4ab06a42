//! Chat request assembly and boundary validation.

use super::message::ChatMessage;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=2.0;
const TOP_P_RANGE: RangeInclusive<f64> = 0.0..=1.0;
const PENALTY_RANGE: RangeInclusive<f64> = -2.0..=2.0;

/// Sampling parameters. Unset fields are omitted from the wire payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
}

/// A chat completion request. Validated before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            params: GenerationParams::default(),
            stream: false,
        }
    }

    /// Same conversation, different model. Used when reissuing against a fallback.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn temperature(mut self, temp: f64) -> Self {
        self.params.temperature = Some(temp);
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.params.max_tokens = Some(max);
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.params.top_p = Some(top_p);
        self
    }

    pub fn frequency_penalty(mut self, penalty: f64) -> Self {
        self.params.frequency_penalty = Some(penalty);
        self
    }

    pub fn presence_penalty(mut self, penalty: f64) -> Self {
        self.params.presence_penalty = Some(penalty);
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Reject requests the provider would refuse anyway.
    pub fn validate(&self, max_message_chars: usize) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(invalid("model id must be non-empty", "request.model", None));
        }
        if self.messages.is_empty() {
            return Err(invalid(
                "at least one message is required",
                "request.messages",
                None,
            ));
        }
        for (i, m) in self.messages.iter().enumerate() {
            let len = m.content.chars().count();
            if len > max_message_chars {
                return Err(invalid(
                    "message content exceeds maximum length",
                    format!("request.messages[{}].content", i),
                    Some(format!("{} > {} chars", len, max_message_chars)),
                ));
            }
        }

        let p = &self.params;
        check_range("request.temperature", p.temperature, TEMPERATURE_RANGE)?;
        check_range("request.top_p", p.top_p, TOP_P_RANGE)?;
        check_range("request.frequency_penalty", p.frequency_penalty, PENALTY_RANGE)?;
        check_range("request.presence_penalty", p.presence_penalty, PENALTY_RANGE)?;
        if p.max_tokens == Some(0) {
            return Err(invalid(
                "max_tokens must be at least 1",
                "request.max_tokens",
                None,
            ));
        }
        Ok(())
    }

    /// Build the provider wire payload for `POST /chat/completions`.
    pub fn to_payload(&self) -> ProviderPayload<'_> {
        ProviderPayload {
            model: &self.model,
            messages: &self.messages,
            stream: if self.stream { Some(true) } else { None },
            temperature: self.params.temperature,
            max_tokens: self.params.max_tokens,
            top_p: self.params.top_p,
            frequency_penalty: self.params.frequency_penalty,
            presence_penalty: self.params.presence_penalty,
        }
    }
}

/// Borrowed wire form of a [`ChatRequest`].
#[derive(Debug, Serialize)]
pub struct ProviderPayload<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

fn check_range(field: &str, value: Option<f64>, range: RangeInclusive<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() || !range.contains(&v) => Err(invalid(
            format!("{} out of range", field.trim_start_matches("request.")),
            field,
            Some(format!(
                "expected {}..={}, got {}",
                range.start(),
                range.end(),
                v
            )),
        )),
        _ => Ok(()),
    }
}

fn invalid(
    msg: impl Into<String>,
    field: impl Into<String>,
    details: Option<String>,
) -> Error {
    let mut ctx = ErrorContext::new()
        .with_field_path(field)
        .with_source("request_validator");
    if let Some(d) = details {
        ctx = ctx.with_details(d);
    }
    Error::validation_with_context(msg, ctx)
}
