use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Skill discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directory scanned for `SKILL.md` definitions.
    #[serde(default = "d_path")]
    pub path: PathBuf,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self { path: d_path() }
    }
}

fn d_path() -> PathBuf {
    PathBuf::from("./skills")
}
