//! Anthropic Messages API adapter.
//!
//! Tool results travel as user messages with `tool_result` blocks, and
//! extended-thinking streams arrive as `thinking_delta` content blocks,
//! which are surfaced as reasoning deltas.

use std::collections::HashMap;

use serde_json::Value;

use dp_domain::capability::ProviderCapabilities;
use dp_domain::config::ProviderConfig;
use dp_domain::error::{Error, Result};
use dp_domain::message::{ContentPart, Message, MessageContent, Role, ToolCall, Usage};
use dp_domain::stream::{BoxStream, StreamDelta};

use crate::sse::sse_delta_stream;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::{from_reqwest, from_status, resolve_credential};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: ProviderCapabilities,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &ProviderConfig, timeout_ms: u64) -> Result<Self> {
        let api_key = resolve_credential(&cfg.id, &cfg.credential_env)?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| from_reqwest(&cfg.id, e))?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg
                .default_model
                .clone()
                .unwrap_or_else(|| "claude-sonnet-4-20250514".into()),
            capabilities: cfg.capabilities.clone(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        // The system prompt is a top-level field, not a message.
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.all_text()),
                Role::Assistant => messages.push(assistant_to_wire(msg)),
                Role::Tool => messages.push(tool_result_to_wire(msg)),
                Role::User => messages.push(serde_json::json!({
                    "role": "user",
                    "content": msg.content.all_text(),
                })),
            }
        }

        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(8192),
            "stream": stream,
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    async fn post_messages(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| from_reqwest(&self.id, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(from_status(&self.id, status.as_u16(), &text));
        }
        Ok(response)
    }
}

// ── Message serialization ──────────────────────────────────────────

fn assistant_to_wire(msg: &Message) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Text(t) => vec![serde_json::json!({"type": "text", "text": t})],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => {
                    Some(serde_json::json!({"type": "text", "text": text}))
                }
                ContentPart::ToolUse { id, name, input } => Some(serde_json::json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                })),
                ContentPart::ToolResult { .. } => None,
            })
            .collect(),
    };
    serde_json::json!({"role": "assistant", "content": content})
}

fn tool_result_to_wire(msg: &Message) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![serde_json::json!({
            "type": "tool_result",
            "tool_use_id": "",
            "content": t,
        })],
    };
    serde_json::json!({"role": "user", "content": content})
}

// ── Response parsing ───────────────────────────────────────────────

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
    })
}

fn normalize_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

// ── Streaming parse ────────────────────────────────────────────────

/// Tool-use blocks stream their arguments as `input_json_delta`
/// fragments keyed by block index.
struct StreamState {
    tool_blocks: HashMap<u64, PendingBlock>,
    usage: Option<Usage>,
}

struct PendingBlock {
    call_id: String,
    name: String,
    args_buf: String,
}

impl StreamState {
    fn new() -> Self {
        Self {
            tool_blocks: HashMap::new(),
            usage: None,
        }
    }

    fn parse_payload(&mut self, payload: &str) -> Vec<Result<StreamDelta>> {
        let v: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };
        let mut out = Vec::new();

        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                self.usage = parse_usage(&v["message"]["usage"]);
            }
            "content_block_start" => {
                let idx = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let call_id = block["id"].as_str().unwrap_or("").to_string();
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    out.push(Ok(StreamDelta::ToolCallStarted {
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                    }));
                    self.tool_blocks.insert(
                        idx,
                        PendingBlock {
                            call_id,
                            name,
                            args_buf: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let idx = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            if !text.is_empty() {
                                out.push(Ok(StreamDelta::Text { text: text.into() }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta["thinking"].as_str() {
                            if !text.is_empty() {
                                out.push(Ok(StreamDelta::Reasoning { text: text.into() }));
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(fragment) = delta["partial_json"].as_str() {
                            if let Some(block) = self.tool_blocks.get_mut(&idx) {
                                block.args_buf.push_str(fragment);
                                out.push(Ok(StreamDelta::ToolCallDelta {
                                    call_id: block.call_id.clone(),
                                    delta: fragment.into(),
                                }));
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let idx = v["index"].as_u64().unwrap_or(0);
                if let Some(block) = self.tool_blocks.remove(&idx) {
                    let arguments = if block.args_buf.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&block.args_buf).unwrap_or_else(|e| {
                            tracing::warn!(
                                call_id = %block.call_id,
                                error = %e,
                                "tool input was not valid JSON"
                            );
                            Value::Object(Default::default())
                        })
                    };
                    out.push(Ok(StreamDelta::ToolCallFinished {
                        call_id: block.call_id,
                        tool_name: block.name,
                        arguments,
                    }));
                }
            }
            "message_delta" => {
                if let Some(u) = v["usage"].as_object() {
                    let output = u
                        .get("output_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32;
                    let usage = self.usage.get_or_insert_with(Usage::default);
                    usage.completion_tokens = output;
                    usage.total_tokens = usage.prompt_tokens + output;
                }
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    out.push(Ok(StreamDelta::Finish {
                        usage: self.usage.clone(),
                        finish_reason: Some(normalize_stop_reason(reason)),
                    }));
                }
            }
            // message_stop / ping carry nothing we need.
            _ => {}
        }

        out
    }
}

// ── Trait impl ─────────────────────────────────────────────────────

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);
        let response = self.post_messages(&body).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| from_reqwest(&self.id, e))?;

        let mut texts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        if let Some(blocks) = json["content"].as_array() {
            for block in blocks {
                match block["type"].as_str().unwrap_or("") {
                    "text" => {
                        if let Some(t) = block["text"].as_str() {
                            texts.push(t.to_string());
                        }
                    }
                    "tool_use" => tool_calls.push(ToolCall {
                        call_id: block["id"].as_str().unwrap_or("").to_string(),
                        tool_name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block
                            .get("input")
                            .cloned()
                            .unwrap_or_else(|| Value::Object(Default::default())),
                    }),
                    _ => {}
                }
            }
        }

        Ok(ChatResponse {
            content: texts.join(""),
            tool_calls,
            usage: parse_usage(&json["usage"]),
            model: json["model"].as_str().unwrap_or("").to_string(),
            finish_reason: json["stop_reason"].as_str().map(normalize_stop_reason),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let body = self.build_body(req, true);
        let response = self.post_messages(&body).await?;

        let mut state = StreamState::new();
        Ok(sse_delta_stream(self.id.clone(), response, move |payload| {
            state.parse_payload(payload)
        }))
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deltas(state: &mut StreamState, payload: &str) -> Vec<StreamDelta> {
        state
            .parse_payload(payload)
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn thinking_delta_becomes_reasoning() {
        let mut state = StreamState::new();
        let out = deltas(
            &mut state,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
        );
        assert!(matches!(&out[0], StreamDelta::Reasoning { text } if text == "hmm"));
    }

    #[test]
    fn tool_use_block_assembles() {
        let mut state = StreamState::new();
        deltas(
            &mut state,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"run_code"}}"#,
        );
        deltas(
            &mut state,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"code\":\"1+1\"}"}}"#,
        );
        let out = deltas(&mut state, r#"{"type":"content_block_stop","index":1}"#);
        match &out[0] {
            StreamDelta::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                assert_eq!(call_id, "tu_1");
                assert_eq!(tool_name, "run_code");
                assert_eq!(arguments["code"], "1+1");
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }

    #[test]
    fn message_delta_carries_usage_and_finish() {
        let mut state = StreamState::new();
        deltas(
            &mut state,
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":0}}}"#,
        );
        let out = deltas(
            &mut state,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
        );
        match &out[0] {
            StreamDelta::Finish {
                usage: Some(u),
                finish_reason,
            } => {
                assert_eq!(u.prompt_tokens, 12);
                assert_eq!(u.completion_tokens, 7);
                assert_eq!(finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }

    #[test]
    fn tool_results_travel_as_user_messages() {
        let wire = tool_result_to_wire(&Message::tool_result("tu_9", "42", false));
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"][0]["type"], "tool_result");
        assert_eq!(wire["content"][0]["tool_use_id"], "tu_9");
    }
}
