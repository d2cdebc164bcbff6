use serde::{Deserialize, Serialize};

/// Sandbox executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock timeout per execution.
    #[serde(default = "d_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Resident-memory cap for the worker process.
    #[serde(default = "d_memory_cap_bytes")]
    pub memory_cap_bytes: u64,
    /// Interpreter binary for Python snippets.
    #[serde(default = "d_python_bin")]
    pub python_bin: String,
    /// Interpreter binary for R snippets.
    #[serde(default = "d_r_bin")]
    pub r_bin: String,
    /// How often the supervisor samples the worker's RSS.
    #[serde(default = "d_rss_poll_ms")]
    pub rss_poll_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: d_timeout_seconds(),
            memory_cap_bytes: d_memory_cap_bytes(),
            python_bin: d_python_bin(),
            r_bin: d_r_bin(),
            rss_poll_ms: d_rss_poll_ms(),
        }
    }
}

fn d_timeout_seconds() -> u64 {
    30
}
fn d_memory_cap_bytes() -> u64 {
    512 * 1024 * 1024
}
fn d_python_bin() -> String {
    "python3".into()
}
fn d_r_bin() -> String {
    "Rscript".into()
}
fn d_rss_poll_ms() -> u64 {
    200
}

/// Stdout/stderr capture cap per stream. Fixed: the truncation flag in
/// the result is part of the tool contract, not a tunable.
pub const STREAM_CAP_BYTES: usize = 64 * 1024;
