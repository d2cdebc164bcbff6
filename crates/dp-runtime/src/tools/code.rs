//! The `run_code` tool: the bridge from the loop to the sandbox.
//!
//! Figures land in a per-call scratch area and are promoted into the
//! workspace through the normal atomic write path, so versioning and
//! `workspace_update` publication apply to sandbox output too. Every
//! call leaves an execution record.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Value};

use dp_domain::event::EventBody;
use dp_sandbox::{ExecOutcome, ExecRequest, FailureKind, Language};
use dp_workspace::store::ExecutionRecord;

use super::{ToolContext, ToolOutput};

pub(super) async fn run_code(args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    let code = args["code"].as_str().unwrap_or_default().to_string();
    let language = match args["language"].as_str().unwrap_or("python") {
        "r" => Language::R,
        _ => Language::Python,
    };

    // Bound datasets resolve to absolute read paths for the worker.
    let bound = match ctx.sessions.get(ctx.session_id) {
        Some(meta) => meta.datasets,
        None => HashMap::new(),
    };
    let mut bound_datasets = HashMap::new();
    for (name, relative) in &bound {
        match dp_workspace::resolve_contained(ctx.workspace.root(), relative) {
            Ok(path) => {
                bound_datasets.insert(name.clone(), path);
            }
            Err(e) => {
                tracing::warn!(dataset = %name, error = %e, "skipping unresolvable dataset");
            }
        }
    }

    let call_id = uuid::Uuid::new_v4().to_string();
    let scratch = ctx.workspace.root().join(".scratch").join(&call_id);
    let paths = dp_sandbox::ExecPaths {
        exec_dir: scratch.clone(),
        artifacts_dir: scratch.join("figures"),
        datasets_dir: ctx.workspace.root().join("datasets"),
    };

    let request = ExecRequest {
        code: code.clone(),
        language,
        session_id: ctx.session_id.to_string(),
        bound_datasets,
        persist_df: args["persist_df"].as_bool().unwrap_or(false),
        save_as: args["save_as"].as_str().map(str::to_string),
        timeout_seconds: None,
        memory_cap_bytes: None,
    };

    let outcome = match ctx.executor.execute(&request, &paths).await {
        Ok(outcome) => outcome,
        Err(e) => return ToolOutput::fail(&e),
    };

    // ── Promote intercepted figures into the workspace ─────────────
    let mut artifact_paths = Vec::new();
    let mut derived = Vec::new();
    for produced in &outcome.artifacts {
        let source = paths.artifacts_dir.join(produced);
        let Ok(bytes) = std::fs::read(&source) else {
            continue;
        };
        let target = format!("artifacts/{produced}");
        match ctx.workspace.write_file(&target, &bytes).await {
            Ok(meta) => {
                derived.push(EventBody::Artifact {
                    path: target.clone(),
                    kind: "visualization".into(),
                    meta: json!({ "size": meta.size }),
                });
                artifact_paths.push(target);
            }
            Err(e) => {
                tracing::warn!(artifact = %produced, error = %e, "failed to promote artifact");
            }
        }
    }
    let _ = std::fs::remove_dir_all(&scratch);

    // ── Derived events: table preview, dataset registration ────────
    if let Some(preview) = &outcome.dataframe_preview {
        derived.push(EventBody::Data {
            columns: preview.columns.clone(),
            rows: preview.rows.clone(),
        });
    }
    if let Some(new_name) = &outcome.new_dataset_handle {
        let relative = format!("datasets/{new_name}.csv");
        let _ = ctx.sessions.update(ctx.session_id, |meta| {
            meta.datasets.insert(new_name.clone(), relative.clone());
        });
    }

    // ── Execution record ───────────────────────────────────────────
    let record = ExecutionRecord {
        id: call_id,
        timestamp: Utc::now().to_rfc3339(),
        language: match language {
            Language::Python => "python".into(),
            Language::R => "r".into(),
        },
        code,
        status: execution_status(&outcome).to_string(),
        stdout_tail: tail(&outcome.stdout, 2000),
        elapsed_ms: outcome.elapsed_ms,
        artifacts: artifact_paths.clone(),
    };
    if let Err(e) = ctx.workspace.record_execution(&record).await {
        tracing::warn!(error = %e, "failed to append execution record");
    }

    let payload = json!({
        "success": outcome.success,
        "kind": outcome.failure_kind,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "result": outcome.result,
        "dataframe_preview": outcome.dataframe_preview,
        "new_dataset": outcome.new_dataset_handle,
        "artifacts": artifact_paths,
        "elapsed_ms": outcome.elapsed_ms,
        "truncated": outcome.truncation,
    });

    ToolOutput {
        success: outcome.success,
        payload,
        derived,
    }
}

fn execution_status(outcome: &ExecOutcome) -> &'static str {
    if outcome.success {
        return "success";
    }
    match outcome.failure_kind {
        Some(FailureKind::Policy) => "policy_rejected",
        Some(FailureKind::Resource) => "resource_exceeded",
        _ => "runtime_error",
    }
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
