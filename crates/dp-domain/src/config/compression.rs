use serde::{Deserialize, Serialize};

/// Context compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compress when the prompt estimate strictly exceeds this.
    #[serde(default = "d_threshold")]
    pub threshold_tokens: u32,
    /// Compress down toward this estimate.
    #[serde(default = "d_target")]
    pub target_tokens: u32,
    /// Most recent messages kept verbatim.
    #[serde(default = "d_recency")]
    pub recency_window: usize,
    /// Tool payloads above this size are replaced by reference handles.
    #[serde(default = "d_inline_cap")]
    pub inline_cap_bytes: usize,
    /// Budget for the auxiliary summarization call before falling back
    /// to mechanical truncation.
    #[serde(default = "d_summary_budget")]
    pub summary_budget_seconds: u64,
    /// Hard cap on the cumulative summary; beyond it the oldest
    /// paragraphs are dropped mechanically.
    #[serde(default = "d_summary_cap")]
    pub max_cumulative_summary_tokens: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: d_threshold(),
            target_tokens: d_target(),
            recency_window: d_recency(),
            inline_cap_bytes: d_inline_cap(),
            summary_budget_seconds: d_summary_budget(),
            max_cumulative_summary_tokens: d_summary_cap(),
        }
    }
}

fn d_threshold() -> u32 {
    30_000
}
fn d_target() -> u32 {
    15_000
}
fn d_recency() -> usize {
    20
}
fn d_inline_cap() -> usize {
    10 * 1024
}
fn d_summary_budget() -> u64 {
    15
}
fn d_summary_cap() -> u32 {
    4_000
}
