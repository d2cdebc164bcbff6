//! Provider registry: constructs one adapter per configured binding,
//! preserving the config's priority order.

use std::sync::Arc;

use dp_domain::config::{LlmConfig, ProviderConfig, ProviderKind};
use dp_domain::error::Result;

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

pub struct ProviderRegistry {
    /// Bindings in priority order.
    providers: Vec<(String, Arc<dyn LlmProvider>)>,
}

impl ProviderRegistry {
    /// Build adapters for every configured binding. A binding whose
    /// credential is unreachable is skipped with a warning rather than
    /// failing startup — the router treats it as absent.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let mut providers: Vec<(String, Arc<dyn LlmProvider>)> = Vec::new();
        for binding in &cfg.providers {
            match build_provider(binding, cfg.request_timeout_ms) {
                Ok(provider) => providers.push((binding.id.clone(), provider)),
                Err(e) => {
                    tracing::warn!(
                        provider = %binding.id,
                        error = %e,
                        "skipping binding with unusable configuration"
                    );
                }
            }
        }
        Ok(Self { providers })
    }

    /// Build from pre-constructed providers (used by tests).
    pub fn from_providers(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.provider_id().to_string(), p))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|(pid, _)| pid == id)
            .map(|(_, p)| p.clone())
    }

    /// Bindings in configured priority order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn LlmProvider>)> {
        self.providers.iter().map(|(id, p)| (id.as_str(), p))
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn build_provider(cfg: &ProviderConfig, timeout_ms: u64) -> Result<Arc<dyn LlmProvider>> {
    Ok(match cfg.kind {
        ProviderKind::OpenaiCompat => Arc::new(OpenAiCompatProvider::from_config(cfg, timeout_ms)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_config(cfg, timeout_ms)?),
    })
}
