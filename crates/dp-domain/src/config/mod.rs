mod compression;
mod llm;
mod runtime;
mod sandbox;
mod skills;
mod workspace;

pub use compression::*;
pub use llm::*;
pub use runtime::*;
pub use sandbox::*;
pub use skills::*;
pub use workspace::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
}

impl Config {
    /// Parse a TOML config document.
    pub fn from_toml(raw: &str) -> crate::Result<Self> {
        toml::from_str(raw).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Apply the documented environment overrides on top of the file
    /// values. Unparseable values are ignored with a warning rather
    /// than failing startup.
    pub fn apply_env_overrides(&mut self) {
        env_u32("DP_COMPRESSION_THRESHOLD", &mut self.compression.threshold_tokens);
        env_u32("DP_COMPRESSION_TARGET", &mut self.compression.target_tokens);
        env_usize("DP_RECENCY_WINDOW", &mut self.compression.recency_window);
        env_usize("DP_INLINE_CAP", &mut self.compression.inline_cap_bytes);
        env_u32("DP_MAX_ITERATIONS", &mut self.runtime.max_iterations);
        env_u32("DP_MAX_STEP_ATTEMPTS", &mut self.runtime.max_step_attempts);
        env_u64("DP_TOOL_GRACE_SECONDS", &mut self.runtime.tool_grace_seconds);
        env_u64("DP_SANDBOX_TIMEOUT_SECONDS", &mut self.sandbox.timeout_seconds);
        env_u64("DP_SANDBOX_MEMORY_CAP_BYTES", &mut self.sandbox.memory_cap_bytes);
        env_usize(
            "DP_ARTIFACT_RETENTION_VERSIONS",
            &mut self.workspace.artifact_retention_versions,
        );
        if let Ok(root) = std::env::var("DP_WORKSPACE_ROOT") {
            if !root.is_empty() {
                self.workspace.root = root.into();
            }
        }
        // Per-purpose preferred-provider overrides: DP_PURPOSE_PLANNING=provider_id
        for purpose in ["planning", "coding", "image_analysis", "summarization"] {
            let var = format!("DP_PURPOSE_{}", purpose.to_ascii_uppercase());
            if let Ok(provider) = std::env::var(&var) {
                if !provider.is_empty() {
                    self.llm.purposes.insert(purpose.to_string(), provider);
                }
            }
        }
    }

    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.llm.providers.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "llm.providers".into(),
                message: "no model providers configured".into(),
            });
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, provider) in self.llm.providers.iter().enumerate() {
            if provider.id.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].id"),
                    message: "provider id must not be empty".into(),
                });
            }
            if !provider.base_url.starts_with("http://")
                && !provider.base_url.starts_with("https://")
            {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].base_url"),
                    message: format!(
                        "base_url must start with http:// or https:// (got \"{}\")",
                        provider.base_url
                    ),
                });
            }
            if !provider.id.is_empty() && !seen_ids.insert(&provider.id) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].id"),
                    message: format!("duplicate provider id \"{}\"", provider.id),
                });
            }
        }

        for (purpose, provider_id) in &self.llm.purposes {
            if !self.llm.providers.iter().any(|p| &p.id == provider_id) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: format!("llm.purposes.{purpose}"),
                    message: format!("references unknown provider \"{provider_id}\""),
                });
            }
        }

        if self.compression.target_tokens >= self.compression.threshold_tokens {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "compression.target_tokens".into(),
                message: "target must be below threshold".into(),
            });
        }

        if self.runtime.max_iterations == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "runtime.max_iterations".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.sandbox.timeout_seconds == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sandbox.timeout_seconds".into(),
                message: "must be at least 1".into(),
            });
        }

        errors
    }
}

fn env_u32(var: &str, slot: &mut u32) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(var, raw, "ignoring unparseable env override"),
        }
    }
}

fn env_u64(var: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(var, raw, "ignoring unparseable env override"),
        }
    }
}

fn env_usize(var: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(var, raw, "ignoring unparseable env override"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "defaults must not produce errors: {errors:?}");
    }

    #[test]
    fn duplicate_provider_ids_rejected() {
        let mut config = Config::default();
        config.llm.providers = vec![
            ProviderConfig::test_binding("alpha"),
            ProviderConfig::test_binding("alpha"),
        ];
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|e| e.severity == ConfigSeverity::Error && e.message.contains("duplicate")));
    }

    #[test]
    fn target_above_threshold_rejected() {
        let mut config = Config::default();
        config.compression.target_tokens = 40_000;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|e| e.field == "compression.target_tokens"));
    }

    #[test]
    fn toml_round_trip_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.compression.threshold_tokens, 30_000);
        assert_eq!(config.runtime.max_iterations, 12);
    }

    #[test]
    fn unknown_purpose_provider_warns() {
        let mut config = Config::default();
        config.llm.providers = vec![ProviderConfig::test_binding("alpha")];
        config
            .llm
            .purposes
            .insert("planning".into(), "ghost".into());
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|e| e.severity == ConfigSeverity::Warning && e.field.contains("planning")));
    }
}
