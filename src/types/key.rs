//! `GET /key` response.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRateLimit {
    pub requests: u32,
    /// Provider interval string, e.g. `"10s"`.
    pub interval: String,
}

/// Usage and limits for the configured API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    #[serde(default)]
    pub label: String,
    /// Credits used so far.
    #[serde(default)]
    pub usage: f64,
    /// Credit limit, `None` when unlimited.
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub is_free_tier: bool,
    #[serde(default)]
    pub rate_limit: Option<KeyRateLimit>,
}

impl KeyInfo {
    /// Remaining credits, when the key has a limit.
    pub fn remaining(&self) -> Option<f64> {
        self.limit.map(|l| (l - self.usage).max(0.0))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeyEnvelope {
    pub data: KeyInfo,
}
