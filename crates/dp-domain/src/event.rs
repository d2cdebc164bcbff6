//! Typed event stream shared by the runtime, workspace, and transport.
//!
//! Each server event is a tagged variant with its own payload shape;
//! the envelope adds the shared `turn_id` / `seq` fields. Within a turn
//! the `seq` values form a strict total order.

use serde::{Deserialize, Serialize};

use crate::message::Usage;
use crate::plan::PlanStep;

/// The envelope carried over the wire: shared ordering fields plus the
/// variant payload, flattened so the `type` tag sits at the top level.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub turn_id: u64,
    pub seq: u64,
    #[serde(flatten)]
    pub body: EventBody,
}

/// Server → client event kinds.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// Session bound to this stream.
    Session { session_id: String },

    /// A new ReAct iteration begins.
    IterationStart { iteration: u32 },

    /// Assistant text delta.
    Text { data: String },

    /// Chain-of-thought delta (rendered collapsible client-side).
    Reasoning { data: String },

    /// Dispatched tool invocation.
    ToolCall {
        name: String,
        args: serde_json::Value,
        call_id: String,
    },

    /// Tool returned.
    ToolResult {
        call_id: String,
        success: bool,
        data: serde_json::Value,
    },

    /// Plotly-shaped chart payload.
    Chart {
        data: serde_json::Value,
        layout: serde_json::Value,
        config: serde_json::Value,
    },

    /// Tabular preview.
    Data {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },

    /// New workspace file produced by a tool.
    Artifact {
        path: String,
        kind: String,
        meta: serde_json::Value,
    },

    /// File tree changed.
    WorkspaceUpdate { tree_delta: serde_json::Value },

    /// Structured plan produced by the model.
    AnalysisPlan {
        raw_text: String,
        steps: Vec<PlanStep>,
    },

    /// A single step transitioned.
    PlanStepUpdate { step: PlanStep },

    /// Aggregated progress, sequence-ordered.
    PlanProgress {
        current_step_index: usize,
        total_steps: usize,
        step_title: String,
        step_status: crate::plan::StepStatus,
        next_hint: Option<String>,
    },

    /// Per-attempt status for a plan step.
    TaskAttempt {
        step_id: String,
        attempt: u32,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },

    /// Knowledge-retrieval trace.
    Retrieval {
        query: String,
        hits: Vec<serde_json::Value>,
    },

    /// Compression had to fall back to mechanical truncation.
    CompressionLossy { reason: String },

    /// Turn complete.
    Done { turn_id: u64, usage: Usage },

    /// Turn cancelled by the user or a deadline.
    Stopped { reason: String },

    /// Turn failed.
    Error {
        kind: crate::error::ErrorKind,
        message: String,
    },
}

impl EventBody {
    /// Whether this event terminates a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventBody::Done { .. } | EventBody::Stopped { .. } | EventBody::Error { .. }
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client → server messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Messages a connected client may send on a session stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Chat {
        content: String,
        #[serde(default)]
        dataset_refs: Vec<String>,
    },
    Stop,
    Retry,
    Skill {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_is_snake_case() {
        let ev = Event {
            turn_id: 3,
            seq: 1,
            body: EventBody::IterationStart { iteration: 0 },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "iteration_start");
        assert_eq!(json["turn_id"], 3);
        assert_eq!(json["seq"], 1);
    }

    #[test]
    fn terminal_events_detected() {
        assert!(EventBody::Done {
            turn_id: 1,
            usage: Usage::default()
        }
        .is_terminal());
        assert!(EventBody::Stopped {
            reason: "stop".into()
        }
        .is_terminal());
        assert!(!EventBody::Text { data: "x".into() }.is_terminal());
    }

    #[test]
    fn client_chat_parses_with_optional_refs() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"chat","content":"hi"}"#).unwrap();
        match msg {
            ClientMessage::Chat {
                content,
                dataset_refs,
            } => {
                assert_eq!(content, "hi");
                assert!(dataset_refs.is_empty());
            }
            _ => panic!("expected chat"),
        }
    }
}
