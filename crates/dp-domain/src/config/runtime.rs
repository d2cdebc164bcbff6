use serde::{Deserialize, Serialize};

/// Agent runtime (ReAct loop) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum model iterations per turn.
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    /// Retries per plan step before asking the model to replan.
    #[serde(default = "d_max_step_attempts")]
    pub max_step_attempts: u32,
    /// Grace window granted to in-flight tool calls on cancellation.
    #[serde(default = "d_tool_grace_seconds")]
    pub tool_grace_seconds: u64,
    /// Per-tool dispatch timeout.
    #[serde(default = "d_tool_timeout_seconds")]
    pub tool_timeout_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: d_max_iterations(),
            max_step_attempts: d_max_step_attempts(),
            tool_grace_seconds: d_tool_grace_seconds(),
            tool_timeout_seconds: d_tool_timeout_seconds(),
        }
    }
}

fn d_max_iterations() -> u32 {
    12
}
fn d_max_step_attempts() -> u32 {
    2
}
fn d_tool_grace_seconds() -> u64 {
    5
}
fn d_tool_timeout_seconds() -> u64 {
    120
}
