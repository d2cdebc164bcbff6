//! The failover router: one streaming chat interface over every
//! configured binding.
//!
//! Resolution order: explicit per-call override → per-purpose
//! preference → global preferred → first non-blacklisted binding in
//! priority order. Transient failures walk to the next eligible
//! binding with exponential backoff; two consecutive transient
//! failures blacklist a binding for a configured window.

use std::sync::Arc;

use rand::Rng;

use dp_domain::config::LlmConfig;
use dp_domain::error::{Error, Result};
use dp_domain::stream::{BoxStream, Purpose, StreamDelta};

use crate::health::{HealthSnapshot, HealthTracker};
use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

pub struct ModelRouter {
    registry: ProviderRegistry,
    health: Arc<HealthTracker>,
    purposes: parking_lot::RwLock<std::collections::HashMap<String, String>>,
    preferred: parking_lot::RwLock<Option<String>>,
    retry: dp_domain::config::RetryConfig,
}

impl ModelRouter {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_config(cfg)?;
        Ok(Self::new(registry, cfg))
    }

    /// Build from an already-constructed registry (used by tests).
    pub fn new(registry: ProviderRegistry, cfg: &LlmConfig) -> Self {
        Self {
            registry,
            health: Arc::new(HealthTracker::new(cfg.blacklist_seconds)),
            purposes: parking_lot::RwLock::new(cfg.purposes.clone()),
            preferred: parking_lot::RwLock::new(cfg.preferred.clone()),
            retry: cfg.retry.clone(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    // ── Resolution ─────────────────────────────────────────────────

    /// Resolve the binding for a purpose, honoring an explicit
    /// override. Blacklisted bindings are skipped at every level.
    pub fn resolve(
        &self,
        purpose: Purpose,
        override_id: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>> {
        for candidate in self.candidate_ids(purpose, override_id) {
            if self.health.is_blacklisted(&candidate) {
                tracing::debug!(provider = %candidate, "skipping blacklisted binding");
                continue;
            }
            if let Some(provider) = self.registry.get(&candidate) {
                return Ok(provider);
            }
        }
        Err(Error::ProviderFatal {
            provider: "router".into(),
            message: format!("no eligible binding for purpose '{purpose}'"),
        })
    }

    /// The ordered candidate list for a purpose (deduplicated, before
    /// blacklist filtering).
    fn candidate_ids(&self, purpose: Purpose, override_id: Option<&str>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |id: String| {
            if !out.contains(&id) {
                out.push(id);
            }
        };

        if let Some(id) = override_id {
            push(id.to_string());
        }
        if let Some(id) = self.purposes.read().get(purpose.as_str()) {
            push(id.clone());
        }
        if let Some(id) = self.preferred.read().clone() {
            push(id);
        }
        for id in self.registry.ids() {
            push(id);
        }
        out
    }

    /// Update the global preference (models/config contract).
    pub fn set_preferred(&self, provider_id: Option<String>) {
        *self.preferred.write() = provider_id;
    }

    /// Update one per-purpose preference; `None` clears it.
    pub fn set_purpose(&self, purpose: &str, provider_id: Option<String>) {
        let mut purposes = self.purposes.write();
        match provider_id {
            Some(id) => {
                purposes.insert(purpose.to_string(), id);
            }
            None => {
                purposes.remove(purpose);
            }
        }
    }

    /// The current purpose preference map (introspection contract).
    pub fn purpose_map(&self) -> std::collections::HashMap<String, String> {
        self.purposes.read().clone()
    }

    /// The binding currently resolved for general use, with health state.
    pub fn active_binding(&self) -> Result<HealthSnapshot> {
        let provider = self.resolve(Purpose::General, None)?;
        Ok(self.health.snapshot(provider.provider_id()))
    }

    pub fn health_snapshot(&self, provider_id: &str) -> HealthSnapshot {
        self.health.snapshot(provider_id)
    }

    /// Manually record a call outcome (used by callers that hold a
    /// resolved binding across several requests).
    pub fn record_outcome(&self, provider_id: &str, success: bool) {
        if success {
            self.health.record_success(provider_id);
        } else {
            self.health.record_failure(provider_id);
        }
    }

    // ── Chat with failover ─────────────────────────────────────────

    /// Non-streaming chat with failover across eligible bindings.
    pub async fn chat(
        &self,
        purpose: Purpose,
        override_id: Option<&str>,
        req: &ChatRequest,
    ) -> Result<ChatResponse> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..self.retry.max_attempts {
            let provider = match self.resolve(purpose, override_id) {
                Ok(p) => p,
                Err(e) => return Err(last_err.unwrap_or(e)),
            };
            let id = provider.provider_id().to_string();

            match provider.chat(req).await {
                Ok(resp) => {
                    self.health.record_success(&id);
                    return Ok(resp);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(provider = %id, attempt, error = %e, "chat failed, failing over");
                    self.health.record_failure(&id);
                    last_err = Some(e);
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::ProviderFatal {
            provider: "router".into(),
            message: "all bindings exhausted".into(),
        }))
    }

    /// Streaming chat with failover.
    ///
    /// Attempts that fail before producing a single delta are retried
    /// on the next eligible binding; their partial output is discarded
    /// and logged, never emitted. Once a delta has reached the caller
    /// the attempt is committed and later errors propagate.
    pub async fn stream_chat(
        &self,
        purpose: Purpose,
        override_id: Option<&str>,
        req: &ChatRequest,
    ) -> Result<(String, BoxStream<'static, Result<StreamDelta>>)> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..self.retry.max_attempts {
            let provider = match self.resolve(purpose, override_id) {
                Ok(p) => p,
                Err(e) => return Err(last_err.unwrap_or(e)),
            };
            let id = provider.provider_id().to_string();

            match provider.chat_stream(req).await {
                Ok(inner) => {
                    let stream = committed_stream(self.health.clone(), id.clone(), inner);
                    return Ok((id, stream));
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        provider = %id,
                        attempt,
                        error = %e,
                        "stream open failed, failing over"
                    );
                    self.health.record_failure(&id);
                    last_err = Some(e);
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::ProviderFatal {
            provider: "router".into(),
            message: "all bindings exhausted".into(),
        }))
    }

    /// Sleep for the attempt's backoff delay plus jitter.
    async fn backoff(&self, attempt: u32) {
        let base = self.retry.delay_ms(attempt);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        tokio::time::sleep(std::time::Duration::from_millis(base + jitter)).await;
    }
}

/// Wrap a provider stream so the health tracker sees the outcome.
fn committed_stream(
    health: Arc<HealthTracker>,
    provider_id: String,
    mut inner: BoxStream<'static, Result<StreamDelta>>,
) -> BoxStream<'static, Result<StreamDelta>> {
    use futures_util::StreamExt;
    let stream = async_stream::stream! {
        let mut failed = false;
        while let Some(item) = inner.next().await {
            if item.is_err() {
                failed = true;
            }
            yield item;
        }
        if failed {
            health.record_failure(&provider_id);
        } else {
            health.record_success(&provider_id);
        }
    };
    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use dp_domain::capability::ProviderCapabilities;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A scripted provider: fails the first `fail_times` calls with a
    /// transient error, then succeeds.
    struct ScriptedProvider {
        id: String,
        fail_times: u32,
        calls: AtomicU32,
        capabilities: ProviderCapabilities,
    }

    impl ScriptedProvider {
        fn new(id: &str, fail_times: u32) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                fail_times,
                calls: AtomicU32::new(0),
                capabilities: ProviderCapabilities::default(),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(Error::ProviderTransient {
                    provider: self.id.clone(),
                    message: "HTTP 503".into(),
                });
            }
            Ok(ChatResponse {
                content: format!("from {}", self.id),
                tool_calls: vec![],
                usage: None,
                model: "scripted".into(),
                finish_reason: Some("stop".into()),
            })
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(Error::ProviderTransient {
                    provider: self.id.clone(),
                    message: "HTTP 503".into(),
                });
            }
            let id = self.id.clone();
            Ok(Box::pin(async_stream::stream! {
                yield Ok(StreamDelta::Text { text: format!("from {id}") });
                yield Ok(StreamDelta::Finish { usage: None, finish_reason: Some("stop".into()) });
            }))
        }

        fn capabilities(&self) -> &ProviderCapabilities {
            &self.capabilities
        }

        fn provider_id(&self) -> &str {
            &self.id
        }
    }

    fn router_with(providers: Vec<Arc<dyn LlmProvider>>, cfg: &mut LlmConfig) -> Arc<ModelRouter> {
        cfg.retry.base_ms = 1; // keep tests fast
        cfg.retry.cap_ms = 2;
        Arc::new(ModelRouter::new(
            ProviderRegistry::from_providers(providers),
            cfg,
        ))
    }

    #[tokio::test]
    async fn failover_reaches_healthy_binding() {
        let a = ScriptedProvider::new("a", 99);
        let b = ScriptedProvider::new("b", 0);
        let router = router_with(
            vec![a.clone() as Arc<dyn LlmProvider>, b.clone()],
            &mut LlmConfig::default(),
        );

        let resp = router
            .chat(Purpose::General, None, &ChatRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "from b");
        assert!(router.health_snapshot("a").consecutive_failures >= 1);
    }

    #[tokio::test]
    async fn consecutive_failures_blacklist_binding() {
        let a = ScriptedProvider::new("a", 99);
        let b = ScriptedProvider::new("b", 0);
        let router = router_with(
            vec![a.clone() as Arc<dyn LlmProvider>, b.clone()],
            &mut LlmConfig::default(),
        );

        // One round: "a" fails, is retried once (second consecutive
        // failure → blacklist), then "b" answers.
        let _ = router
            .chat(Purpose::General, None, &ChatRequest::default())
            .await
            .unwrap();

        let snap = router.health_snapshot("a");
        assert!(snap.blacklisted, "second consecutive failure must blacklist");

        // The next round resolves straight to "b" without touching "a".
        let calls_before = a.calls.load(Ordering::SeqCst);
        let resp = router
            .chat(Purpose::General, None, &ChatRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "from b");
        assert_eq!(a.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn fatal_error_short_circuits() {
        struct FatalProvider(ProviderCapabilities);
        #[async_trait::async_trait]
        impl LlmProvider for FatalProvider {
            async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
                Err(Error::ProviderFatal {
                    provider: "fatal".into(),
                    message: "HTTP 401: bad key".into(),
                })
            }
            async fn chat_stream(
                &self,
                _req: &ChatRequest,
            ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
                self.chat(_req).await.map(|_| unreachable!())
            }
            fn capabilities(&self) -> &ProviderCapabilities {
                &self.0
            }
            fn provider_id(&self) -> &str {
                "fatal"
            }
        }

        let healthy = ScriptedProvider::new("b", 0);
        let router = router_with(
            vec![
                Arc::new(FatalProvider(ProviderCapabilities::default())) as Arc<dyn LlmProvider>,
                healthy.clone(),
            ],
            &mut LlmConfig::default(),
        );

        let err = router
            .chat(Purpose::General, None, &ChatRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderFatal { .. }));
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_failover_emits_only_winning_deltas() {
        use futures_util::StreamExt;

        let a = ScriptedProvider::new("a", 99);
        let b = ScriptedProvider::new("b", 0);
        let router = router_with(
            vec![a as Arc<dyn LlmProvider>, b],
            &mut LlmConfig::default(),
        );

        let (provider_id, mut stream) = router
            .stream_chat(Purpose::General, None, &ChatRequest::default())
            .await
            .unwrap();
        assert_eq!(provider_id, "b");

        let mut texts = Vec::new();
        while let Some(delta) = stream.next().await {
            if let StreamDelta::Text { text } = delta.unwrap() {
                texts.push(text);
            }
        }
        assert_eq!(texts, vec!["from b"]);
        assert!(!router.health_snapshot("b").blacklisted);
    }

    #[tokio::test]
    async fn purpose_preference_wins_over_priority() {
        let a = ScriptedProvider::new("a", 0);
        let b = ScriptedProvider::new("b", 0);
        let mut cfg = LlmConfig::default();
        cfg.purposes.insert("planning".into(), "b".into());
        let router = router_with(vec![a as Arc<dyn LlmProvider>, b], &mut cfg);

        let resolved = router.resolve(Purpose::Planning, None).unwrap();
        assert_eq!(resolved.provider_id(), "b");
        let general = router.resolve(Purpose::General, None).unwrap();
        assert_eq!(general.provider_id(), "a");
    }

    #[tokio::test]
    async fn explicit_override_wins() {
        let a = ScriptedProvider::new("a", 0);
        let b = ScriptedProvider::new("b", 0);
        let router = router_with(
            vec![a as Arc<dyn LlmProvider>, b],
            &mut LlmConfig::default(),
        );

        let resolved = router.resolve(Purpose::General, Some("b")).unwrap();
        assert_eq!(resolved.provider_id(), "b");
    }
}
