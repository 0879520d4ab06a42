//! Credential redaction for messages that reach logs or callers.

use once_cell::sync::Lazy;
use regex::Regex;

const REDACTED: &str = "[REDACTED]";

// Secrets shorter than this are too likely to collide with ordinary words.
const MIN_SECRET_LEN: usize = 8;

static BEARER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=\-]+").unwrap());

static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bsk-[A-Za-z0-9_\-]{16,}").unwrap());

static ASSIGNMENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(api[_-]?key|access[_-]?token|secret|password|authorization)(["']?\s*[:=]\s*["']?)[^\s"',}&]+"#)
        .unwrap()
});

/// Redacts credential-shaped substrings and any explicitly registered secrets.
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    secrets: Vec<String>,
}

impl Sanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a literal secret (e.g. the configured API key) to scrub verbatim.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if secret.len() >= MIN_SECRET_LEN && !self.secrets.contains(&secret) {
            self.secrets.push(secret);
        }
        self
    }

    pub fn sanitize(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        redact(&out)
    }
}

/// Pattern-only redaction, usable without a configured [`Sanitizer`].
pub fn redact(text: &str) -> String {
    let out = BEARER_PATTERN.replace_all(text, format!("Bearer {}", REDACTED).as_str());
    let out = KEY_PATTERN.replace_all(&out, REDACTED);
    let out = ASSIGNMENT_PATTERN.replace_all(&out, format!("${{1}}${{2}}{}", REDACTED).as_str());
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_tokens() {
        let s = redact("request failed: Authorization header Bearer abc.def-123 rejected");
        assert!(!s.contains("abc.def-123"));
        assert!(s.contains("Bearer [REDACTED]"));
    }

    #[test]
    fn redacts_provider_keys() {
        let s = redact("invalid key sk-or-v1-0123456789abcdef0123456789abcdef");
        assert_eq!(s, "invalid key [REDACTED]");
    }

    #[test]
    fn redacts_key_assignments() {
        let s = redact(r#"{"api_key": "hunter2hunter2", "model": "m1"}"#);
        assert!(!s.contains("hunter2hunter2"));
        assert!(s.contains("\"model\": \"m1\""));
    }

    #[test]
    fn redacts_registered_secret() {
        let sanitizer = Sanitizer::new().with_secret("plainsecretvalue");
        assert_eq!(
            sanitizer.sanitize("echo: plainsecretvalue"),
            "echo: [REDACTED]"
        );
    }

    #[test]
    fn short_secrets_are_ignored() {
        let sanitizer = Sanitizer::new().with_secret("abc");
        assert_eq!(sanitizer.sanitize("abc def"), "abc def");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(redact("model not found"), "model not found");
    }
}
