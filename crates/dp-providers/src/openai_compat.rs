//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, DeepSeek, Ollama, vLLM, Together, and any other
//! endpoint following the chat-completions contract. DeepSeek-style
//! `reasoning_content` deltas are surfaced as reasoning, never as text.

use std::sync::Arc;

use serde_json::Value;

use dp_domain::capability::ProviderCapabilities;
use dp_domain::config::ProviderConfig;
use dp_domain::error::{Error, Result};
use dp_domain::message::{ContentPart, Message, MessageContent, Role, ToolCall, Usage};
use dp_domain::stream::{BoxStream, StreamDelta};

use crate::sse::sse_delta_stream;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::{from_reqwest, from_status, resolve_credential};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: ProviderCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
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
                .unwrap_or_else(|| "gpt-4o".into()),
            capabilities: cfg.capabilities.clone(),
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }

    async fn post_chat(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Assistant => assistant_to_wire(msg),
        Role::Tool => tool_result_to_wire(msg),
        _ => serde_json::json!({
            "role": role_str(msg.role),
            "content": msg.content.all_text(),
        }),
    }
}

fn assistant_to_wire(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut texts: Vec<String> = Vec::new();
    let mut calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => texts.push(t.clone()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => texts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => calls.push(serde_json::json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": input.to_string() },
                    })),
                    ContentPart::ToolResult { .. } => {}
                }
            }
        }
    }

    obj["content"] = if texts.is_empty() {
        Value::Null
    } else {
        Value::String(texts.join("\n"))
    };
    if !calls.is_empty() {
        obj["tool_calls"] = Value::Array(calls);
    }
    obj
}

fn tool_result_to_wire(msg: &Message) -> Value {
    let call_id = msg.content.answered_call_id().unwrap_or_default();
    let content = match &msg.content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .find_map(|p| match p {
                ContentPart::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_else(|| msg.content.all_text()),
    };
    serde_json::json!({
        "role": "tool",
        "tool_call_id": call_id,
        "content": content,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming parse
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-stream tool-call assembly: the wire identifies calls by index,
/// with id and name only on the first fragment.
#[derive(Default)]
struct StreamState {
    calls: Vec<PendingCall>,
}

struct PendingCall {
    index: u64,
    call_id: String,
    name: String,
    args_buf: String,
}

impl StreamState {
    fn parse_payload(&mut self, payload: &str) -> Vec<Result<StreamDelta>> {
        if payload == "[DONE]" {
            return Vec::new();
        }
        let chunk: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed stream chunk");
                return Vec::new();
            }
        };

        let mut out = Vec::new();

        // Usage arrives in a trailing chunk with empty choices.
        let usage = parse_usage(&chunk);

        let Some(choice) = chunk["choices"].get(0) else {
            if let Some(u) = usage {
                out.push(Ok(StreamDelta::Finish {
                    usage: Some(u),
                    finish_reason: None,
                }));
            }
            return out;
        };

        let delta = &choice["delta"];

        if let Some(text) = delta["reasoning_content"].as_str() {
            if !text.is_empty() {
                out.push(Ok(StreamDelta::Reasoning { text: text.into() }));
            }
        }
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                out.push(Ok(StreamDelta::Text { text: text.into() }));
            }
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                let fragment = tc["function"]["arguments"].as_str().unwrap_or("");

                if let Some(pending) = self.calls.iter_mut().find(|c| c.index == index) {
                    if !fragment.is_empty() {
                        pending.args_buf.push_str(fragment);
                        out.push(Ok(StreamDelta::ToolCallDelta {
                            call_id: pending.call_id.clone(),
                            delta: fragment.into(),
                        }));
                    }
                } else {
                    let call_id = tc["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{index}"));
                    let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                    out.push(Ok(StreamDelta::ToolCallStarted {
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                    }));
                    if !fragment.is_empty() {
                        out.push(Ok(StreamDelta::ToolCallDelta {
                            call_id: call_id.clone(),
                            delta: fragment.into(),
                        }));
                    }
                    self.calls.push(PendingCall {
                        index,
                        call_id,
                        name,
                        args_buf: fragment.into(),
                    });
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            for pending in self.calls.drain(..) {
                let arguments = finish_arguments(&pending.call_id, &pending.args_buf);
                out.push(Ok(StreamDelta::ToolCallFinished {
                    call_id: pending.call_id,
                    tool_name: pending.name,
                    arguments,
                }));
            }
            out.push(Ok(StreamDelta::Finish {
                usage,
                finish_reason: Some(reason.into()),
            }));
        }

        out
    }
}

/// Arguments accumulated for a finished call: empty buffers become `{}`,
/// malformed JSON is downgraded to `{}` with a warning — the registry's
/// schema validation rejects it properly downstream.
fn finish_arguments(call_id: &str, buf: &str) -> Value {
    if buf.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(buf) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(call_id, error = %e, "tool call arguments are not valid JSON");
            Value::Object(Default::default())
        }
    }
}

fn parse_usage(chunk: &Value) -> Option<Usage> {
    let u = chunk.get("usage")?;
    if u.is_null() {
        return None;
    }
    Some(Usage {
        prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: u["total_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);
        let response = self.post_chat(&body).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| from_reqwest(&self.id, e))?;

        let choice = json["choices"]
            .get(0)
            .ok_or_else(|| Error::ProviderFatal {
                provider: self.id.clone(),
                message: "response contained no choices".into(),
            })?;
        let message = &choice["message"];

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for (i, tc) in calls.iter().enumerate() {
                let args_raw = tc["function"]["arguments"].as_str().unwrap_or("{}");
                tool_calls.push(ToolCall {
                    call_id: tc["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{i}")),
                    tool_name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                    arguments: serde_json::from_str(args_raw)
                        .unwrap_or_else(|_| Value::Object(Default::default())),
                });
            }
        }

        Ok(ChatResponse {
            content: message["content"].as_str().unwrap_or("").to_string(),
            tool_calls,
            usage: parse_usage(&json),
            model: json["model"].as_str().unwrap_or("").to_string(),
            finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let body = self.build_body(req, true);
        let response = self.post_chat(&body).await?;

        let mut state = StreamState::default();
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
