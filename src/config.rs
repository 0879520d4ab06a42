//! Client configuration.
//!
//! Defaults are production-friendly; every field can be overridden from a YAML
//! file or from `CHATLINK_*` environment variables.
//!
//! ```yaml
//! base_url: https://openrouter.ai/api/v1
//! app_title: my-app
//! timeout: 30
//! rate_limit:
//!   capacity: 20
//!   refill_per_sec: 2.0
//!   per_model:
//!     anthropic/claude-3-opus:
//!       capacity: 2
//!       refill_per_sec: 0.1
//! retry:
//!   max_attempts: 5
//! ```

use crate::client::policy::RetryPolicy;
use crate::credentials::ProviderLimits;
use crate::resilience::{BucketConfig, RateLimiterConfig, DEFAULT_MAX_IN_FLIGHT};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 32_000;
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub per_model: HashMap<String, BucketConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let bucket = BucketConfig::default();
        Self {
            capacity: bucket.capacity,
            refill_per_sec: bucket.refill_per_sec,
            per_model: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Sent as `HTTP-Referer`.
    pub app_url: Option<String>,
    /// Sent as `X-Title`.
    pub app_title: Option<String>,
    /// Per-call timeout; also the idle limit between stream chunks.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    #[serde(with = "duration_secs")]
    pub pool_idle_timeout: Duration,
    pub proxy_url: Option<String>,
    pub max_message_chars: usize,
    pub rate_limit: RateLimitConfig,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    #[serde(with = "duration_secs")]
    pub catalog_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            app_url: None,
            app_title: Some("chatlink".to_string()),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
            proxy_url: None,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            rate_limit: RateLimitConfig::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryPolicy::default(),
            catalog_ttl: DEFAULT_CATALOG_TTL,
        }
    }
}

impl ClientConfig {
    /// Defaults layered with `CHATLINK_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration_with_context(
                "invalid configuration file",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            Error::Configuration { message, context } => Error::Configuration {
                message,
                context: ErrorContext {
                    field_path: Some(path.display().to_string()),
                    ..context
                },
            },
            other => other,
        })
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());
        let parse_f64 = |name: &str| lookup(name).and_then(|s| s.trim().parse::<f64>().ok());

        if let Some(v) = lookup("CHATLINK_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("CHATLINK_APP_URL") {
            self.app_url = Some(v);
        }
        if let Some(v) = lookup("CHATLINK_APP_TITLE") {
            self.app_title = Some(v);
        }
        if let Some(v) = lookup("CHATLINK_PROXY_URL") {
            self.proxy_url = Some(v);
        }
        if let Some(v) = parse_u64("CHATLINK_TIMEOUT_SECS") {
            self.timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64("CHATLINK_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64("CHATLINK_POOL_MAX_IDLE_PER_HOST") {
            self.pool_max_idle_per_host = v as usize;
        }
        if let Some(v) = parse_u64("CHATLINK_POOL_IDLE_TIMEOUT_SECS") {
            self.pool_idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64("CHATLINK_MAX_MESSAGE_CHARS") {
            self.max_message_chars = v as usize;
        }
        if let Some(v) = parse_f64("CHATLINK_RATE_CAPACITY") {
            self.rate_limit.capacity = v;
        }
        if let Some(v) = parse_f64("CHATLINK_RATE_REFILL_PER_SEC") {
            self.rate_limit.refill_per_sec = v;
        }
        if let Some(v) = parse_u64("CHATLINK_MAX_IN_FLIGHT") {
            self.max_in_flight = v as usize;
        }
        if let Some(v) = parse_u64("CHATLINK_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = v.min(u64::from(u32::MAX)) as u32;
        }
        if let Some(v) = parse_u64("CHATLINK_CATALOG_TTL_SECS") {
            self.catalog_ttl = Duration::from_secs(v);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        match url::Url::parse(&self.base_url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            Ok(u) => {
                return Err(invalid(
                    "base_url",
                    "base_url must use http or https",
                    format!("scheme {}", u.scheme()),
                ))
            }
            Err(e) => return Err(invalid("base_url", "base_url is not a valid URL", e.to_string())),
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "timeout must be positive", "0s".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid(
                "connect_timeout",
                "connect_timeout must be positive",
                "0s".into(),
            ));
        }
        if self.max_message_chars == 0 {
            return Err(invalid(
                "max_message_chars",
                "max_message_chars must be at least 1",
                "0".into(),
            ));
        }
        if self.catalog_ttl.is_zero() {
            return Err(invalid("catalog_ttl", "catalog_ttl must be positive", "0s".into()));
        }
        if let Some(proxy) = &self.proxy_url {
            if url::Url::parse(proxy).is_err() {
                return Err(invalid("proxy_url", "proxy_url is not a valid URL", proxy.clone()));
            }
        }
        self.retry.validate()?;
        self.rate_limiter_config(None).validate()
    }

    /// Limiter configuration, with provider limits replacing the default bucket when known.
    pub fn rate_limiter_config(&self, limits: Option<ProviderLimits>) -> RateLimiterConfig {
        let default_bucket = match limits {
            Some(l) => BucketConfig::from_limits(l.rpm, l.burst),
            None => BucketConfig::new(self.rate_limit.capacity, self.rate_limit.refill_per_sec),
        };
        RateLimiterConfig {
            default_bucket,
            per_model: self.rate_limit.per_model.clone(),
            max_in_flight: self.max_in_flight,
        }
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

fn invalid(field: &str, msg: &str, details: String) -> Error {
    Error::configuration_with_context(
        msg,
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("config"),
    )
}

/// Durations as (fractional) seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
