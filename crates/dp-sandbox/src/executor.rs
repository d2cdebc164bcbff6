//! The sandbox executor: the public surface the runtime's `run_code`
//! tool dispatches to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dp_domain::config::SandboxConfig;
use dp_domain::error::Result;

use crate::bootstrap::{self, WorkerManifest};
use crate::policy;
use crate::types::{
    DataframePreview, ExecOutcome, ExecRequest, FailureKind, Language, TruncationFlags,
};
use crate::worker::{self, WorkerExit};

/// Where one execution reads and writes. Prepared by the caller (the
/// workspace layer) so the executor never reasons about session
/// layout.
#[derive(Debug, Clone)]
pub struct ExecPaths {
    /// Scratch directory for this call (snippet, manifest, bootstrap).
    pub exec_dir: PathBuf,
    /// Where intercepted figures land.
    pub artifacts_dir: PathBuf,
    /// Where `save_as` datasets land.
    pub datasets_dir: PathBuf,
}

pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Execute one snippet. Policy violations never spawn a process;
    /// worker failures are classified into the outcome rather than
    /// propagated as errors — only host-side faults (I/O, spawn) error.
    pub async fn execute(&self, req: &ExecRequest, paths: &ExecPaths) -> Result<ExecOutcome> {
        // ── Gate 1: static policy ──────────────────────────────────
        let imports = match policy::check(&req.code, req.language) {
            Ok(imports) => imports,
            Err(violations) => {
                let message = violations
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                tracing::info!(
                    session = %req.session_id,
                    violations = violations.len(),
                    "snippet rejected by static policy"
                );
                return Ok(ExecOutcome::policy_failure(message));
            }
        };

        // ── Materialize the call directory ─────────────────────────
        std::fs::create_dir_all(&paths.exec_dir)?;
        std::fs::create_dir_all(&paths.artifacts_dir)?;

        let (program, snippet_name) = match req.language {
            Language::Python => (self.config.python_bin.as_str(), "snippet.py"),
            Language::R => (self.config.r_bin.as_str(), "snippet.R"),
        };

        let snippet_path = paths.exec_dir.join(snippet_name);
        let code = match req.language {
            Language::Python => bootstrap::rewrite_imports(&req.code, &imports),
            Language::R => req.code.clone(),
        };
        std::fs::write(&snippet_path, &code)?;

        let bootstrap_path = paths.exec_dir.join(bootstrap::bootstrap_filename(req.language));
        let manifest_path = paths.exec_dir.join("manifest.json");

        // `persist_df` without an explicit name lands under a stable
        // default so later calls can reload it.
        let save_name = req
            .save_as
            .clone()
            .or_else(|| req.persist_df.then(|| "output_df".to_string()));
        let save_dataset_path = save_name
            .as_ref()
            .map(|name| paths.datasets_dir.join(format!("{name}.csv")));
        if save_dataset_path.is_some() {
            std::fs::create_dir_all(&paths.datasets_dir)?;
        }

        match req.language {
            Language::Python => {
                std::fs::write(&bootstrap_path, bootstrap::python_bootstrap())?;
                let manifest = WorkerManifest {
                    snippet_path: snippet_path.clone(),
                    datasets: req.bound_datasets.clone(),
                    artifacts_dir: paths.artifacts_dir.clone(),
                    scratch_dir: paths.exec_dir.clone(),
                    save_dataset_path,
                    save_dataset_name: save_name,
                };
                std::fs::write(&manifest_path, serde_json::to_vec(&manifest)?)?;
            }
            Language::R => {
                std::fs::write(
                    &bootstrap_path,
                    bootstrap::r_bootstrap(&snippet_path, &paths.artifacts_dir),
                )?;
            }
        }

        // ── Gate 2+3: isolated worker under caps ───────────────────
        let timeout = Duration::from_secs(
            req.timeout_seconds.unwrap_or(self.config.timeout_seconds),
        );
        let memory_cap = req
            .memory_cap_bytes
            .unwrap_or(self.config.memory_cap_bytes);

        let args: Vec<&Path> = match req.language {
            Language::Python => vec![bootstrap_path.as_path(), manifest_path.as_path()],
            Language::R => vec![bootstrap_path.as_path()],
        };
        let flags = self.interpreter_flags(req.language);
        let output = worker::run(
            program,
            &flags,
            &args,
            &paths.exec_dir,
            timeout,
            memory_cap,
            Duration::from_millis(self.config.rss_poll_ms),
        )
        .await?;

        // ── Map to the outcome ─────────────────────────────────────
        let elapsed_ms = output.elapsed.as_millis() as u64;
        let truncation = TruncationFlags {
            stdout: output.stdout_truncated,
            stderr: output.stderr_truncated,
        };

        match output.exit {
            WorkerExit::TimedOut => {
                return Ok(ExecOutcome {
                    success: false,
                    failure_kind: Some(FailureKind::Resource),
                    stdout: output.stdout,
                    stderr: format!(
                        "execution exceeded the {}s wall-clock limit",
                        timeout.as_secs()
                    ),
                    result: None,
                    dataframe_preview: None,
                    new_dataset_handle: None,
                    artifacts: Vec::new(),
                    elapsed_ms,
                    truncation,
                });
            }
            WorkerExit::MemoryBreach => {
                return Ok(ExecOutcome {
                    success: false,
                    failure_kind: Some(FailureKind::Resource),
                    stdout: output.stdout,
                    stderr: format!(
                        "execution exceeded the {} MiB memory cap",
                        memory_cap / (1024 * 1024)
                    ),
                    result: None,
                    dataframe_preview: None,
                    new_dataset_handle: None,
                    artifacts: Vec::new(),
                    elapsed_ms,
                    truncation,
                });
            }
            WorkerExit::Completed => {}
        }

        let Some(sentinel) = output.sentinel else {
            // The worker died before reporting (interpreter missing,
            // hard crash). Classify by exit code.
            return Ok(ExecOutcome {
                success: false,
                failure_kind: Some(FailureKind::Runtime),
                stdout: output.stdout,
                stderr: if output.stderr.is_empty() {
                    format!(
                        "worker exited with code {:?} before reporting a result",
                        output.exit_code
                    )
                } else {
                    output.stderr
                },
                result: None,
                dataframe_preview: None,
                new_dataset_handle: None,
                artifacts: Vec::new(),
                elapsed_ms,
                truncation,
            });
        };

        let ok = sentinel["ok"].as_bool().unwrap_or(false);
        let mut stderr = output.stderr;
        if !ok {
            if let Some(tb) = sentinel["error"].as_str() {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(tb);
            }
        }

        let artifacts = sentinel["artifacts"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let dataframe_preview = sentinel.get("df_preview").and_then(parse_preview);

        Ok(ExecOutcome {
            success: ok,
            failure_kind: if ok { None } else { Some(FailureKind::Runtime) },
            stdout: output.stdout,
            stderr,
            result: match &sentinel["result"] {
                serde_json::Value::Null => None,
                other => Some(other.clone()),
            },
            dataframe_preview,
            new_dataset_handle: sentinel["saved_dataset"].as_str().map(str::to_string),
            artifacts,
            elapsed_ms,
            truncation,
        })
    }

    fn interpreter_flags(&self, language: Language) -> Vec<String> {
        match language {
            // -I: isolated mode — no site-packages path injection from
            // the environment, no user site directory.
            Language::Python => vec!["-I".to_string()],
            Language::R => vec!["--vanilla".to_string()],
        }
    }
}

fn parse_preview(v: &serde_json::Value) -> Option<DataframePreview> {
    if v.is_null() {
        return None;
    }
    Some(DataframePreview {
        columns: v["columns"]
            .as_array()?
            .iter()
            .filter_map(|c| c.as_str().map(str::to_string))
            .collect(),
        rows: v["rows"]
            .as_array()?
            .iter()
            .filter_map(|r| r.as_array().cloned())
            .collect(),
        row_count: v["row_count"].as_u64().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_domain::error::Error;

    fn paths(tmp: &Path) -> ExecPaths {
        ExecPaths {
            exec_dir: tmp.join("exec"),
            artifacts_dir: tmp.join("artifacts"),
            datasets_dir: tmp.join("datasets"),
        }
    }

    #[tokio::test]
    async fn policy_violation_never_spawns() {
        let executor = SandboxExecutor::new(SandboxConfig {
            // A program that would fail loudly if spawned.
            python_bin: "/nonexistent/interpreter".into(),
            ..Default::default()
        });
        let tmp = tempfile::tempdir().unwrap();

        let req = ExecRequest::python("s1", "__import__('os').system('ls')");
        let outcome = executor.execute(&req, &paths(tmp.path())).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.failure_kind, Some(FailureKind::Policy));
        assert!(outcome.stderr.contains("__import__"));
        // Nothing was written: the call directory was never created.
        assert!(!tmp.path().join("exec").exists());
    }

    #[tokio::test]
    async fn missing_interpreter_is_host_error() {
        let executor = SandboxExecutor::new(SandboxConfig {
            python_bin: "/nonexistent/interpreter".into(),
            ..Default::default()
        });
        let tmp = tempfile::tempdir().unwrap();

        let req = ExecRequest::python("s1", "result = 1 + 1");
        let err = executor.execute(&req, &paths(tmp.path())).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn preview_parses_sentinel_shape() {
        let v = serde_json::json!({
            "columns": ["region", "revenue"],
            "rows": [["north", 12.5], ["south", 9.1]],
            "row_count": 2,
        });
        let preview = parse_preview(&v).unwrap();
        assert_eq!(preview.columns, vec!["region", "revenue"]);
        assert_eq!(preview.row_count, 2);
        assert_eq!(preview.rows.len(), 2);
    }
}
