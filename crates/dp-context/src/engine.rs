//! The compression engine.

use std::time::Duration;

use chrono::Utc;

use dp_domain::config::CompressionConfig;
use dp_domain::error::Result;
use dp_domain::message::{ContentPart, Message, MessageContent, Role};
use dp_providers::{ChatRequest, LlmProvider};

use crate::estimate::{estimate_conversation_tokens, estimate_tokens};
use crate::record::{CompressionRecord, CompressionStore};

/// What a compression pass produced.
#[derive(Debug)]
pub struct CompressionOutcome {
    /// The new cumulative summary (prior summaries folded in).
    pub summary: String,
    /// Messages kept verbatim (the recency window).
    pub kept: Vec<Message>,
    /// Mechanical fallback was used, or the summary cap forced drops.
    pub lossy: bool,
    pub record: CompressionRecord,
}

pub struct CompressionEngine {
    config: CompressionConfig,
}

impl CompressionEngine {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Strictly greater than the threshold — at the threshold exactly,
    /// nothing happens.
    pub fn needs_compression(&self, messages: &[Message], summary: &str) -> bool {
        let total = estimate_conversation_tokens(messages) + estimate_tokens(summary);
        total > self.config.threshold_tokens
    }

    /// Run one compression pass.
    ///
    /// `turn_range` is the inclusive turn span the prefix covers (for
    /// the audit record). The provider performs the auxiliary
    /// summarization; on failure or budget overrun the mechanical
    /// fallback drops the oldest blocks entirely.
    pub async fn compress(
        &self,
        messages: &[Message],
        prior_summary: &str,
        turn_range: (u64, u64),
        provider: &dyn LlmProvider,
        store: &CompressionStore,
    ) -> Result<CompressionOutcome> {
        let original_estimate =
            estimate_conversation_tokens(messages) + estimate_tokens(prior_summary);

        // ── 1. Split prefix / recency window ───────────────────────
        let keep_from = messages.len().saturating_sub(self.config.recency_window);
        let (prefix, recency) = messages.split_at(keep_from);

        if prefix.is_empty() {
            // Nothing compressible; the recency window alone exceeds
            // the threshold. Record a no-op rather than touch verbatim
            // messages.
            let record = CompressionRecord {
                timestamp: Utc::now().to_rfc3339(),
                turn_range,
                summary_text: prior_summary.to_string(),
                original_token_estimate: original_estimate,
                compressed_token_estimate: original_estimate,
                lossy: false,
            };
            return Ok(CompressionOutcome {
                summary: prior_summary.to_string(),
                kept: recency.to_vec(),
                lossy: false,
                record,
            });
        }

        // ── 2+3. Offload bulky tool payloads from the prefix ───────
        let mut slimmed: Vec<Message> = Vec::with_capacity(prefix.len());
        for (index, message) in prefix.iter().enumerate() {
            slimmed.push(self.offload_if_bulky(message, turn_range.0, index, store)?);
        }

        // ── 4. Auxiliary summarization under a wall-clock budget ───
        let budget = Duration::from_secs(self.config.summary_budget_seconds);
        let (new_summary, lossy) = match tokio::time::timeout(
            budget,
            self.summarize(&slimmed, prior_summary, provider),
        )
        .await
        {
            Ok(Ok(text)) => (text, false),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "auxiliary summarization failed; falling back");
                (self.mechanical_fallback(&slimmed, prior_summary), true)
            }
            Err(_) => {
                tracing::warn!(
                    budget_secs = self.config.summary_budget_seconds,
                    "auxiliary summarization overran its budget; falling back"
                );
                (self.mechanical_fallback(&slimmed, prior_summary), true)
            }
        };

        // ── 5. Cumulative summary cap ──────────────────────────────
        let (summary, capped) = self.apply_summary_cap(new_summary);
        let lossy = lossy || capped;

        store.write_summary(&summary)?;
        let record = CompressionRecord {
            timestamp: Utc::now().to_rfc3339(),
            turn_range,
            summary_text: summary.clone(),
            original_token_estimate: original_estimate,
            compressed_token_estimate: estimate_tokens(&summary)
                + estimate_conversation_tokens(recency),
            lossy,
        };
        store.append_record(&record)?;

        Ok(CompressionOutcome {
            summary,
            kept: recency.to_vec(),
            lossy,
            record,
        })
    }

    /// Replace a tool payload above the inline cap with a reference
    /// handle plus a short descriptor. Workspace-materialized content
    /// is never discarded — only its inline representation.
    fn offload_if_bulky(
        &self,
        message: &Message,
        turn_lo: u64,
        index: usize,
        store: &CompressionStore,
    ) -> Result<Message> {
        if message.role != Role::Tool {
            return Ok(message.clone());
        }
        let MessageContent::Parts(parts) = &message.content else {
            return Ok(message.clone());
        };

        let mut changed = false;
        let mut new_parts = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } if content.len() > self.config.inline_cap_bytes => {
                    let handle = store.offload_payload(turn_lo, index, content)?;
                    let digest: String = content.chars().take(160).collect();
                    new_parts.push(ContentPart::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: format!(
                            "[payload moved to {handle}; {} bytes; begins: {digest}]",
                            content.len()
                        ),
                        is_error: *is_error,
                    });
                    changed = true;
                }
                other => new_parts.push(other.clone()),
            }
        }

        if changed {
            Ok(Message {
                role: message.role,
                content: MessageContent::Parts(new_parts),
            })
        } else {
            Ok(message.clone())
        }
    }

    async fn summarize(
        &self,
        prefix: &[Message],
        prior_summary: &str,
        provider: &dyn LlmProvider,
    ) -> Result<String> {
        let conversation = render_conversation(prefix);
        let mut prompt = String::new();
        if !prior_summary.is_empty() {
            prompt.push_str("EARLIER SUMMARY (fold into your output):\n");
            prompt.push_str(prior_summary);
            prompt.push_str("\n\n");
        }
        prompt.push_str(
            "Summarize the analysis conversation below into a structured summary with \
             these sections: Decisions made; Datasets introduced; Artifacts produced; \
             Open questions. Be concise, keep every actionable fact, write in present \
             tense, omit pleasantries.\n\nCONVERSATION:\n",
        );
        prompt.push_str(&conversation);

        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            tools: vec![],
            temperature: Some(0.1),
            max_tokens: Some(2000),
            model: None,
        };
        let resp = provider.chat(&req).await?;
        Ok(resp.content)
    }

    /// Mechanical truncation: drop the oldest blocks entirely and keep
    /// a minimal trace of what was dropped.
    fn mechanical_fallback(&self, prefix: &[Message], prior_summary: &str) -> String {
        let dropped = prefix.len();
        let mut out = String::new();
        if !prior_summary.is_empty() {
            out.push_str(prior_summary);
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "[{dropped} earlier messages dropped without summarization]"
        ));
        out
    }

    /// Enforce the hard cumulative-summary cap by dropping the oldest
    /// paragraphs.
    fn apply_summary_cap(&self, summary: String) -> (String, bool) {
        let cap = self.config.max_cumulative_summary_tokens;
        if estimate_tokens(&summary) <= cap {
            return (summary, false);
        }
        let mut paragraphs: Vec<&str> = summary.split("\n\n").collect();
        while paragraphs.len() > 1 {
            paragraphs.remove(0);
            let candidate = paragraphs.join("\n\n");
            if estimate_tokens(&candidate) <= cap {
                return (candidate, true);
            }
        }
        // One giant paragraph: hard character cut.
        let max_chars = cap as usize * 4;
        let mut end = max_chars.min(summary.len());
        while end > 0 && !summary.is_char_boundary(end) {
            end -= 1;
        }
        (summary[..end].to_string(), true)
    }
}

fn render_conversation(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let label = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
        };
        let text = message.content.all_text();
        let text = match &message.content {
            MessageContent::Parts(parts) if text.is_empty() => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult { content, .. } => Some(content.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => text,
        };
        out.push_str(label);
        out.push_str(": ");
        // Long lines are elided head+tail to keep the prompt sane.
        if text.len() > 2000 {
            let head_end = floor_boundary(&text, 1200);
            let tail_start = floor_boundary(&text, text.len() - 400);
            out.push_str(&text[..head_end]);
            out.push_str(" [...] ");
            out.push_str(&text[tail_start..]);
        } else {
            out.push_str(&text);
        }
        out.push('\n');
    }
    out
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use dp_domain::capability::ProviderCapabilities;
    use dp_domain::stream::{BoxStream, StreamDelta};
    use dp_providers::ChatResponse;

    struct StubSummarizer {
        reply: Option<String>,
        capabilities: ProviderCapabilities,
    }

    impl StubSummarizer {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Some(reply.into()),
                capabilities: ProviderCapabilities::default(),
            }
        }
        fn failing() -> Self {
            Self {
                reply: None,
                capabilities: ProviderCapabilities::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for StubSummarizer {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            match &self.reply {
                Some(text) => Ok(ChatResponse {
                    content: text.clone(),
                    tool_calls: vec![],
                    usage: None,
                    model: "stub".into(),
                    finish_reason: Some("stop".into()),
                }),
                None => Err(dp_domain::Error::ProviderTransient {
                    provider: "stub".into(),
                    message: "down".into(),
                }),
            }
        }
        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
            unimplemented!("summarization is non-streaming")
        }
        fn capabilities(&self) -> &ProviderCapabilities {
            &self.capabilities
        }
        fn provider_id(&self) -> &str {
            "stub"
        }
    }

    fn engine(threshold: u32, target: u32, recency: usize) -> CompressionEngine {
        CompressionEngine::new(CompressionConfig {
            threshold_tokens: threshold,
            target_tokens: target,
            recency_window: recency,
            inline_cap_bytes: 64,
            summary_budget_seconds: 5,
            max_cumulative_summary_tokens: 4_000,
        })
    }

    fn long_conversation(n: usize) -> Vec<Message> {
        (0..n)
            .flat_map(|i| {
                vec![
                    Message::user(format!("question {i}: {}", "x".repeat(200))),
                    Message::assistant(format!("answer {i}: {}", "y".repeat(200))),
                ]
            })
            .collect()
    }

    #[test]
    fn threshold_is_strict() {
        let engine = engine(100, 50, 2);
        // Build a conversation estimating exactly 100 tokens.
        let msg = Message::user("x".repeat((100 - 4) * 4));
        assert_eq!(estimate_conversation_tokens(&[msg.clone()]), 100);
        assert!(!engine.needs_compression(&[msg.clone()], ""));

        let over = Message::user("x".repeat((100 - 4) * 4 + 4));
        assert!(engine.needs_compression(&[over], ""));
    }

    #[tokio::test]
    async fn compress_keeps_recency_verbatim_and_shrinks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CompressionStore::new(tmp.path()).unwrap();
        let engine = engine(100, 50, 4);
        let messages = long_conversation(10);
        let provider = StubSummarizer::ok("## Decisions\n- mean by region");

        let outcome = engine
            .compress(&messages, "", (1, 5), &provider, &store)
            .await
            .unwrap();

        assert!(!outcome.lossy);
        assert_eq!(outcome.kept.len(), 4);
        // Recency window is byte-identical.
        for (kept, original) in outcome.kept.iter().zip(&messages[16..]) {
            assert_eq!(
                serde_json::to_string(kept).unwrap(),
                serde_json::to_string(original).unwrap()
            );
        }
        assert!(
            outcome.record.compressed_token_estimate
                < outcome.record.original_token_estimate
        );
        // Summary persisted for the next pass.
        assert!(store.read_summary().unwrap().contains("mean by region"));
    }

    #[tokio::test]
    async fn failed_summarizer_falls_back_lossy() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CompressionStore::new(tmp.path()).unwrap();
        let engine = engine(100, 50, 2);
        let messages = long_conversation(6);

        let outcome = engine
            .compress(&messages, "", (1, 3), &StubSummarizer::failing(), &store)
            .await
            .unwrap();

        assert!(outcome.lossy);
        assert!(outcome.summary.contains("dropped without summarization"));
    }

    #[tokio::test]
    async fn bulky_tool_payloads_offloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CompressionStore::new(tmp.path()).unwrap();
        let engine = engine(10, 5, 1);

        let big_payload = "r".repeat(500);
        let messages = vec![
            Message::user("run it"),
            Message::tool_result("c1", big_payload.clone(), false),
            Message::assistant("summarized"),
            Message::user("latest"),
        ];

        let outcome = engine
            .compress(&messages, "", (1, 1), &StubSummarizer::ok("s"), &store)
            .await
            .unwrap();
        assert!(!outcome.lossy);

        // The payload file holds the original bytes.
        let records = std::fs::read_dir(tmp.path().join(".compression/payloads"))
            .unwrap()
            .count();
        assert_eq!(records, 1);
    }

    #[tokio::test]
    async fn summary_cap_drops_oldest_paragraphs() {
        let engine = CompressionEngine::new(CompressionConfig {
            max_cumulative_summary_tokens: 10,
            ..CompressionConfig::default()
        });
        let long = format!("old paragraph {}\n\nnew paragraph", "z".repeat(200));
        let (capped, was_capped) = engine.apply_summary_cap(long);
        assert!(was_capped);
        assert_eq!(capped, "new paragraph");
    }

    #[tokio::test]
    async fn reapply_below_threshold_is_noop() {
        let engine = engine(100, 50, 4);
        let small = vec![Message::user("short")];
        assert!(!engine.needs_compression(&small, "tiny summary"));
    }
}
