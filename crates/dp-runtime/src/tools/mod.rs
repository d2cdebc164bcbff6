//! Builtin tools: the host-implemented half of the catalog.
//!
//! Each tool takes validated JSON arguments and a [`ToolContext`], and
//! returns a [`ToolOutput`]: a structured payload for the conversation
//! plus derived events (chart/data/artifact) for the client. Tool
//! errors are encoded in the output, never propagated — the model
//! decides what to do with a failure.

mod chart;
mod code;
mod dataset;
mod files;
mod report;

use serde_json::{json, Value};

use dp_domain::capability::ToolCapabilities;
use dp_domain::config::Config;
use dp_domain::error::Error;
use dp_domain::event::EventBody;
use dp_sandbox::SandboxExecutor;
use dp_sessions::SessionStore;
use dp_skills::ToolEntry;
use dp_workspace::SessionWorkspace;

/// Everything a builtin tool may touch.
pub struct ToolContext<'a> {
    pub session_id: &'a str,
    pub workspace: &'a SessionWorkspace,
    pub executor: &'a SandboxExecutor,
    pub sessions: &'a SessionStore,
    pub config: &'a Config,
}

/// What a dispatch produced.
pub struct ToolOutput {
    pub success: bool,
    /// Structured result appended to the conversation as the tool
    /// message.
    pub payload: Value,
    /// Derived events emitted after `tool_result`.
    pub derived: Vec<EventBody>,
}

impl ToolOutput {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            derived: Vec::new(),
        }
    }

    pub fn ok_with(payload: Value, derived: Vec<EventBody>) -> Self {
        Self {
            success: true,
            payload,
            derived,
        }
    }

    pub fn fail(err: &Error) -> Self {
        Self {
            success: false,
            payload: json!({
                "error": {
                    "kind": err.kind(),
                    "message": dp_domain::redact::redact(&err.to_string()),
                }
            }),
            derived: Vec::new(),
        }
    }

    pub fn fail_msg(kind: &str, message: &str) -> Self {
        Self {
            success: false,
            payload: json!({ "error": { "kind": kind, "message": message } }),
            derived: Vec::new(),
        }
    }
}

/// Dispatch one validated call to its handler.
pub async fn dispatch(name: &str, args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    match name {
        "load_dataset" => dataset::load_dataset(args, ctx).await,
        "describe_dataset" => dataset::describe_dataset(args, ctx),
        "group_by_mean" => dataset::group_by_mean(args, ctx),
        "build_chart" => chart::build_chart(args, ctx).await,
        "run_code" => code::run_code(args, ctx).await,
        "list_files" => files::list_files(ctx),
        "read_file" => files::read_file(args, ctx),
        "write_note" => files::write_note(args, ctx).await,
        "generate_report" => report::generate_report(args, ctx).await,
        other => ToolOutput::fail(&Error::Validation(format!("unknown tool \"{other}\""))),
    }
}

/// The builtin catalog registered at startup.
pub fn builtin_entries() -> Vec<ToolEntry> {
    let mut entries = vec![
        ToolEntry::builtin(
            "load_dataset",
            "Load a CSV dataset into the session: bind a name to a workspace file \
             (importing it into datasets/ if a source path is given) and profile it.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "binding name" },
                    "path": { "type": "string", "description": "workspace-relative CSV path; defaults to datasets/<name>.csv" },
                },
                "required": ["name"],
                "additionalProperties": false,
            }),
            ToolCapabilities {
                reads_dataset: true,
                writes_artifact: true,
                ..Default::default()
            },
        ),
        ToolEntry::builtin(
            "describe_dataset",
            "Column-level summary of a bound dataset: types, counts, numeric min/mean/max.",
            json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"],
                "additionalProperties": false,
            }),
            ToolCapabilities {
                reads_dataset: true,
                ..Default::default()
            },
        ),
        ToolEntry::builtin(
            "group_by_mean",
            "Group a bound dataset by one column and average another; returns the grouped table.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "dataset binding" },
                    "group_by": { "type": "string" },
                    "value": { "type": "string", "description": "numeric column to average" },
                },
                "required": ["name", "group_by", "value"],
                "additionalProperties": false,
            }),
            ToolCapabilities {
                reads_dataset: true,
                ..Default::default()
            },
        ),
        ToolEntry::builtin(
            "build_chart",
            "Build a chart from a bound dataset and store it as an artifact. Emits a \
             Plotly-shaped payload for live rendering.",
            json!({
                "type": "object",
                "properties": {
                    "dataset": { "type": "string" },
                    "chart_type": { "type": "string", "enum": ["bar", "line", "scatter"] },
                    "x": { "type": "string" },
                    "y": { "type": "string" },
                    "title": { "type": "string" },
                },
                "required": ["dataset", "chart_type", "x", "y"],
                "additionalProperties": false,
            }),
            ToolCapabilities {
                reads_dataset: true,
                writes_artifact: true,
                ..Default::default()
            },
        ),
        ToolEntry::builtin(
            "run_code",
            "Execute a Python or R snippet in the sandbox with the bound datasets \
             available. Set `result` for a scalar answer, `output_df` for a table; \
             figures are captured as artifacts.",
            json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string" },
                    "language": { "type": "string", "enum": ["python", "r"], "default": "python" },
                    "save_as": { "type": "string", "description": "register output_df under this dataset name" },
                    "persist_df": { "type": "boolean" },
                },
                "required": ["code"],
                "additionalProperties": false,
            }),
            ToolCapabilities {
                reads_dataset: true,
                writes_artifact: true,
                executes_code: true,
                ..Default::default()
            },
        ),
        ToolEntry::builtin(
            "list_files",
            "List the session workspace tree with sizes and kinds.",
            json!({ "type": "object", "properties": {}, "additionalProperties": false }),
            ToolCapabilities::default(),
        ),
        ToolEntry::builtin(
            "read_file",
            "Read a workspace file (text, size-capped).",
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"],
                "additionalProperties": false,
            }),
            ToolCapabilities::default(),
        ),
        ToolEntry::builtin(
            "write_note",
            "Write a Markdown note into notes/.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "relative path under notes/" },
                    "content": { "type": "string" },
                },
                "required": ["path", "content"],
                "additionalProperties": false,
            }),
            ToolCapabilities {
                writes_artifact: true,
                ..Default::default()
            },
        ),
        ToolEntry::builtin(
            "generate_report",
            "Render a Markdown report from titled sections, referencing workspace \
             artifacts by relative path; stored under notes/.",
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "sections": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "heading": { "type": "string" },
                                "body": { "type": "string" },
                                "artifacts": {
                                    "type": "array",
                                    "items": { "type": "string" },
                                },
                            },
                            "required": ["heading", "body"],
                            "additionalProperties": false,
                        },
                    },
                },
                "required": ["title", "sections"],
                "additionalProperties": false,
            }),
            ToolCapabilities {
                writes_artifact: true,
                ..Default::default()
            },
        ),
    ];
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}
