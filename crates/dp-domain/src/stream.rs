use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::message::Usage;

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Normalized streaming deltas (provider-agnostic).
///
/// Every adapter translates its wire format into this shape; the
/// runtime loop and the router only ever see these.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamDelta {
    /// An assistant text chunk.
    #[serde(rename = "text")]
    Text { text: String },

    /// A chain-of-thought chunk, surfaced separately and never fed back
    /// into a later prompt as first-class content.
    #[serde(rename = "reasoning")]
    Reasoning { text: String },

    /// A tool call has started.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, tool_name: String },

    /// Incremental tool call argument data.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    /// A tool call is complete with full arguments.
    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Stream is finished.
    #[serde(rename = "finish")]
    Finish {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

/// Purpose categories the router resolves to preferred bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Planning,
    Coding,
    ImageAnalysis,
    Summarization,
    General,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Planning => "planning",
            Purpose::Coding => "coding",
            Purpose::ImageAnalysis => "image_analysis",
            Purpose::Summarization => "summarization",
            Purpose::General => "general",
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
