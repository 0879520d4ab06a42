use crate::catalog::{ModelCatalog, ModelSource};
use crate::client::core::ChatClient;
use crate::client::policy::{RetryOrchestrator, RetryPolicy};
use crate::config::ClientConfig;
use crate::credentials::{CredentialProvider, DefaultCredentials, StaticCredentials};
use crate::error_code::ErrorClassifier;
use crate::resilience::RateLimiter;
use crate::sanitize::Sanitizer;
use crate::transport::HttpTransport;
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// Builder for [`ChatClient`].
///
/// Defaults: configuration from `CHATLINK_*` environment variables, key from
/// the OS keyring or `OPENROUTER_API_KEY`.
pub struct ChatClientBuilder {
    config: Option<ClientConfig>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    base_url: Option<String>,
    retry: Option<RetryPolicy>,
}

impl ChatClientBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            credentials: None,
            base_url: None,
            retry: None,
        }
    }

    /// Use a fixed API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.credentials = Some(Arc::new(StaticCredentials::new(key)));
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replace the environment-derived configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the API base URL (mock servers, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Validate configuration, resolve the API key and provider limits, then
    /// start the rate limiter worker. Must run inside a Tokio runtime.
    pub async fn build(self) -> Result<ChatClient> {
        let mut config = self.config.unwrap_or_else(ClientConfig::from_env);
        if let Some(url) = self.base_url {
            config.base_url = url;
        }
        if let Some(policy) = self.retry {
            config.retry = policy;
        }
        config.validate()?;
        let config = Arc::new(config);

        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(DefaultCredentials::default()));
        let key = credentials.get_key().await?;
        let limits = credentials.get_limits().await?;

        let classifier = ErrorClassifier::new(Sanitizer::new().with_secret(key.clone()));
        let limiter = RateLimiter::new(config.rate_limiter_config(limits))?;
        let transport = Arc::new(
            HttpTransport::new(config.clone(), credentials, classifier)?
                .with_resolved_key(key)
                .with_budget_feedback(limiter.clone()),
        );
        let source: Arc<dyn ModelSource> = transport.clone();
        let catalog = Arc::new(ModelCatalog::new(source, config.catalog_ttl));
        let retry = RetryOrchestrator::new(config.retry.clone());

        debug!(
            base_url = %config.base_url,
            max_in_flight = config.max_in_flight,
            max_attempts = config.retry.max_attempts,
            provider_limits = limits.is_some(),
            "chat client ready"
        );

        Ok(ChatClient::from_parts(config, transport, limiter, catalog, retry))
    }
}

impl Default for ChatClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
