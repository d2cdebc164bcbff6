use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::capability::ProviderCapabilities;

/// Model provider settings: an ordered priority list of bindings plus
/// routing preferences.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Bindings in fixed priority order — the router's last-resort walk
    /// follows this order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Globally preferred provider id (after purpose resolution).
    #[serde(default)]
    pub preferred: Option<String>,
    /// Per-purpose preference map, e.g. `image_analysis = "anthropic"`.
    #[serde(default)]
    pub purposes: HashMap<String, String>,
    /// Seconds a binding stays blacklisted after consecutive failures.
    #[serde(default = "d_blacklist_seconds")]
    pub blacklist_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-call timeout for non-streaming requests.
    #[serde(default = "d_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn d_blacklist_seconds() -> u64 {
    60
}

fn d_request_timeout_ms() -> u64 {
    120_000
}

/// One configured provider binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Environment variable holding the API credential. The value is
    /// read at adapter construction and never serialized or logged.
    pub credential_env: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub capabilities: ProviderCapabilities,
}

impl ProviderConfig {
    /// A minimal binding for tests.
    pub fn test_binding(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: None,
            kind: ProviderKind::OpenaiCompat,
            base_url: "http://localhost:1".into(),
            credential_env: format!("{}_API_KEY", id.to_ascii_uppercase()),
            default_model: Some("test-model".into()),
            capabilities: ProviderCapabilities::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
}

/// Failover retry policy: exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_base_ms")]
    pub base_ms: u64,
    #[serde(default = "d_factor")]
    pub factor: u32,
    #[serde(default = "d_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: d_base_ms(),
            factor: d_factor(),
            cap_ms: d_cap_ms(),
            max_attempts: d_max_attempts(),
        }
    }
}

fn d_base_ms() -> u64 {
    500
}
fn d_factor() -> u32 {
    2
}
fn d_cap_ms() -> u64 {
    8_000
}
fn d_max_attempts() -> u32 {
    3
}

impl RetryConfig {
    /// Backoff delay before attempt `n` (0-based), pre-jitter, capped.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let raw = self
            .base_ms
            .saturating_mul(u64::from(self.factor).saturating_pow(attempt));
        raw.min(self.cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_ms(0), 500);
        assert_eq!(retry.delay_ms(1), 1_000);
        assert_eq!(retry.delay_ms(2), 2_000);
        assert_eq!(retry.delay_ms(10), 8_000);
    }
}
