//! API key and limit providers.

use crate::error_code::{ClassifiedError, ErrorKind};
use crate::{Error, Result};
use async_trait::async_trait;
use keyring::Entry;
use std::env;

pub const DEFAULT_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const KEYRING_SERVICE: &str = "chatlink";
pub const KEYRING_USER: &str = "openrouter";

/// Account limits known to the credential source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderLimits {
    /// Requests per minute.
    pub rpm: u32,
    pub burst: u32,
}

/// Source of the API key and, optionally, account limits.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_key(&self) -> Result<String>;

    async fn get_limits(&self) -> Result<Option<ProviderLimits>> {
        Ok(None)
    }
}

fn missing_key(source: &str) -> Error {
    Error::Api(ClassifiedError::new(
        ErrorKind::Authentication,
        format!("no API key available from {}", source),
    ))
}

/// Fixed key, e.g. from application settings.
#[derive(Clone)]
pub struct StaticCredentials {
    key: String,
    limits: Option<ProviderLimits>,
}

impl StaticCredentials {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            limits: None,
        }
    }

    pub fn with_limits(mut self, limits: ProviderLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("key", &"[REDACTED]")
            .field("limits", &self.limits)
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_key(&self) -> Result<String> {
        if self.key.trim().is_empty() {
            return Err(missing_key("static configuration"));
        }
        Ok(self.key.clone())
    }

    async fn get_limits(&self) -> Result<Option<ProviderLimits>> {
        Ok(self.limits)
    }
}

/// Key from an environment variable. Limits from `CHATLINK_RPM` / `CHATLINK_BURST`
/// when both are set.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_ENV)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn get_key(&self) -> Result<String> {
        env::var(&self.var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| missing_key(&format!("${}", self.var)))
    }

    async fn get_limits(&self) -> Result<Option<ProviderLimits>> {
        let read = |name: &str| env::var(name).ok().and_then(|s| s.trim().parse::<u32>().ok());
        Ok(match (read("CHATLINK_RPM"), read("CHATLINK_BURST")) {
            (Some(rpm), Some(burst)) => Some(ProviderLimits { rpm, burst }),
            _ => None,
        })
    }
}

/// Key stored in the OS keyring.
#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    service: String,
    user: String,
}

impl KeyringCredentials {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }

    fn entry(&self) -> Option<Entry> {
        Entry::new(&self.service, &self.user).ok()
    }

    /// Store `key` for later lookups.
    pub fn store(&self, key: &str) -> Result<()> {
        let entry = self
            .entry()
            .ok_or_else(|| missing_key("the OS keyring"))?;
        entry.set_password(key).map_err(|e| {
            Error::configuration_with_context(
                "failed to write API key to keyring",
                crate::ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("keyring"),
            )
        })
    }
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE, KEYRING_USER)
    }
}

#[async_trait]
impl CredentialProvider for KeyringCredentials {
    async fn get_key(&self) -> Result<String> {
        // Keyring backends block on platform IPC.
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.entry().and_then(|e| e.get_password().ok()))
            .await
            .ok()
            .flatten()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| missing_key("the OS keyring"))
    }
}

/// Keyring first, then the environment.
#[derive(Debug, Clone, Default)]
pub struct DefaultCredentials {
    keyring: KeyringCredentials,
    env: EnvCredentials,
}

#[async_trait]
impl CredentialProvider for DefaultCredentials {
    async fn get_key(&self) -> Result<String> {
        match self.keyring.get_key().await {
            Ok(key) => Ok(key),
            Err(_) => self.env.get_key().await,
        }
    }

    async fn get_limits(&self) -> Result<Option<ProviderLimits>> {
        self.env.get_limits().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credentials_return_key_and_limits() {
        let creds = StaticCredentials::new("sk-or-test-key")
            .with_limits(ProviderLimits { rpm: 60, burst: 5 });
        assert_eq!(creds.get_key().await.unwrap(), "sk-or-test-key");
        assert_eq!(
            creds.get_limits().await.unwrap(),
            Some(ProviderLimits { rpm: 60, burst: 5 })
        );
    }

    #[tokio::test]
    async fn empty_key_is_an_authentication_error() {
        let err = StaticCredentials::new("  ").get_key().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Authentication));
        assert!(err.requires_user_action());
    }

    #[tokio::test]
    async fn missing_env_var_is_an_authentication_error() {
        let creds = EnvCredentials::new("CHATLINK_TEST_KEY_THAT_IS_NEVER_SET");
        let err = creds.get_key().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Authentication));
    }

    #[test]
    fn debug_output_hides_the_key() {
        let s = format!("{:?}", StaticCredentials::new("sk-or-secret-value"));
        assert!(!s.contains("secret-value"));
    }
}
