use std::path::PathBuf;

use serde::Serialize;

use dp_domain::capability::ToolCapabilities;
use dp_domain::message::ToolDefinition;

/// How an entry is backed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ToolKind {
    /// Implemented in the host.
    Builtin,
    /// Declared by a Markdown document the model must read before
    /// first invocation in a session.
    Skill {
        source: PathBuf,
        /// Builtin tools the skill constrains itself to, if declared.
        allowed_tools: Vec<String>,
    },
}

/// One catalog entry. The handler binding lives with the runtime; the
/// registry owns identity, schema, and capability metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEntry {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments payload.
    pub arguments_schema: serde_json::Value,
    /// Documentation-only sketch of the return shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns_shape: Option<String>,
    pub capabilities: ToolCapabilities,
    #[serde(flatten)]
    pub kind: ToolKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
}

impl ToolEntry {
    pub fn builtin(
        name: &str,
        description: &str,
        arguments_schema: serde_json::Value,
        capabilities: ToolCapabilities,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            arguments_schema,
            returns_shape: None,
            capabilities,
            kind: ToolKind::Builtin,
            aliases: Vec::new(),
            enabled: true,
            disabled_reason: None,
        }
    }

    pub fn is_skill(&self) -> bool {
        matches!(self.kind, ToolKind::Skill { .. })
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }

    /// The wire definition advertised to the model.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.arguments_schema.clone(),
        }
    }

    /// One line in the snapshot document the model sees for discovery.
    pub fn snapshot_line(&self) -> String {
        let mut flags = Vec::new();
        if self.capabilities.reads_dataset {
            flags.push("reads_dataset");
        }
        if self.capabilities.writes_artifact {
            flags.push("writes_artifact");
        }
        if self.capabilities.executes_code {
            flags.push("executes_code");
        }
        if self.capabilities.network {
            flags.push("network");
        }
        let tag = if self.is_skill() { "skill" } else { "tool" };
        let mut line = format!("- {} ({tag}): {}", self.name, self.description);
        if !flags.is_empty() {
            line.push_str(&format!(" [{}]", flags.join(", ")));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_line_lists_capabilities() {
        let entry = ToolEntry::builtin(
            "run_code",
            "Execute a code snippet",
            serde_json::json!({"type": "object"}),
            ToolCapabilities {
                executes_code: true,
                writes_artifact: true,
                ..Default::default()
            },
        );
        let line = entry.snapshot_line();
        assert!(line.contains("run_code"));
        assert!(line.contains("executes_code"));
        assert!(line.contains("writes_artifact"));
    }

    #[test]
    fn alias_matching() {
        let mut entry = ToolEntry::builtin(
            "load_dataset",
            "Load a dataset",
            serde_json::json!({"type": "object"}),
            ToolCapabilities::default(),
        );
        entry.aliases.push("read_dataset".into());
        assert!(entry.matches_name("load_dataset"));
        assert!(entry.matches_name("read_dataset"));
        assert!(!entry.matches_name("other"));
    }
}
