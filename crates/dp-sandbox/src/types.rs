use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    R,
}

/// Input to one sandbox call.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub code: String,
    pub language: Language,
    pub session_id: String,
    /// Read-only dataset bindings (name → absolute path).
    pub bound_datasets: HashMap<String, PathBuf>,
    /// Keep the resulting `output_df` available to later calls.
    pub persist_df: bool,
    /// Name to register the resulting dataframe under.
    pub save_as: Option<String>,
    /// Per-call overrides; `None` uses the configured defaults.
    pub timeout_seconds: Option<u64>,
    pub memory_cap_bytes: Option<u64>,
}

impl ExecRequest {
    pub fn python(session_id: &str, code: &str) -> Self {
        Self {
            code: code.to_string(),
            language: Language::Python,
            session_id: session_id.to_string(),
            bound_datasets: HashMap::new(),
            persist_df: false,
            save_as: None,
            timeout_seconds: None,
            memory_cap_bytes: None,
        }
    }
}

/// Failure classification carried in the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Static policy rejected the snippet before dispatch.
    Policy,
    /// The snippet raised at runtime.
    Runtime,
    /// Timeout, memory breach, or another cap.
    Resource,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TruncationFlags {
    pub stdout: bool,
    pub stderr: bool,
}

/// A small tabular preview of the snippet's `output_df`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataframePreview {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: u64,
}

/// Result of one sandbox call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub stdout: String,
    pub stderr: String,
    /// JSON-safe value bound to `result` in the snippet's namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataframe_preview: Option<DataframePreview>,
    /// Dataset name registered via `save_as`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_dataset_handle: Option<String>,
    /// Workspace-relative paths of intercepted figures and files.
    pub artifacts: Vec<String>,
    pub elapsed_ms: u64,
    pub truncation: TruncationFlags,
}

impl ExecOutcome {
    pub fn policy_failure(message: String) -> Self {
        Self {
            success: false,
            failure_kind: Some(FailureKind::Policy),
            stdout: String::new(),
            stderr: message,
            result: None,
            dataframe_preview: None,
            new_dataset_handle: None,
            artifacts: Vec::new(),
            elapsed_ms: 0,
            truncation: TruncationFlags::default(),
        }
    }
}
