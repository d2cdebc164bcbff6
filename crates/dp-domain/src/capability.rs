use serde::{Deserialize, Serialize};

/// Advertised capabilities of a provider binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    #[serde(default = "d_true")]
    pub streaming: bool,
    #[serde(default = "d_true")]
    pub tool_calls: bool,
    /// Emits a separate chain-of-thought stream.
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub vision: bool,
}

fn d_true() -> bool {
    true
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            tool_calls: true,
            reasoning: false,
            vision: false,
        }
    }
}

/// Capability set declared by a tool or skill entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCapabilities {
    #[serde(default)]
    pub reads_dataset: bool,
    #[serde(default)]
    pub writes_artifact: bool,
    #[serde(default)]
    pub executes_code: bool,
    #[serde(default)]
    pub network: bool,
}
