use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Workspace manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory holding one subdirectory per session.
    #[serde(default = "d_root")]
    pub root: PathBuf,
    /// Historical versions retained per file, pruned creation-order FIFO.
    #[serde(default = "d_retention")]
    pub artifact_retention_versions: usize,
    /// Read size cap for file contents returned to callers.
    #[serde(default = "d_read_cap")]
    pub read_cap_bytes: usize,
    /// Size threshold above which previews degrade to `unsupported`.
    #[serde(default = "d_preview_cap")]
    pub preview_cap_bytes: usize,
    /// Lines returned by text previews.
    #[serde(default = "d_preview_lines")]
    pub preview_text_lines: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: d_root(),
            artifact_retention_versions: d_retention(),
            read_cap_bytes: d_read_cap(),
            preview_cap_bytes: d_preview_cap(),
            preview_text_lines: d_preview_lines(),
        }
    }
}

fn d_root() -> PathBuf {
    PathBuf::from("./data/sessions")
}
fn d_retention() -> usize {
    10
}
fn d_read_cap() -> usize {
    4 * 1024 * 1024
}
fn d_preview_cap() -> usize {
    16 * 1024 * 1024
}
fn d_preview_lines() -> usize {
    200
}
