//! The in-memory catalog behind the runtime's tool dispatch.
//!
//! Builtins are registered at startup; skills are discovered from disk
//! and refreshed on demand. On a name collision the builtin wins and
//! the skill is disabled with a warning. The snapshot document — the
//! model's discovery surface — is regenerated whenever the set changes.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use dp_domain::error::{Error, Result};
use dp_domain::message::ToolDefinition;

use crate::loader;
use crate::types::{ToolEntry, ToolKind};

/// Serialized argument payloads above this are rejected outright,
/// whatever the schema says.
pub const ARGS_BYTE_CAP: usize = 256 * 1024;

pub struct ToolRegistry {
    entries: RwLock<Vec<ToolEntry>>,
    snapshot: RwLock<String>,
    skills_root: PathBuf,
}

impl ToolRegistry {
    /// Create a registry with the given builtins, then scan the skills
    /// directory.
    pub fn new(builtins: Vec<ToolEntry>, skills_root: &Path) -> Result<Self> {
        let registry = Self {
            entries: RwLock::new(builtins),
            snapshot: RwLock::new(String::new()),
            skills_root: skills_root.to_path_buf(),
        };
        registry.refresh_skills()?;
        Ok(registry)
    }

    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            snapshot: RwLock::new(String::new()),
            skills_root: PathBuf::new(),
        }
    }

    // ── Discovery ──────────────────────────────────────────────────

    /// Re-scan the skills directory, apply conflict resolution, and
    /// regenerate the snapshot. Returns the number of enabled skills.
    pub fn refresh_skills(&self) -> Result<usize> {
        let scanned = loader::scan_skills(&self.skills_root)?;

        let mut entries = self.entries.write();
        entries.retain(|e| !e.is_skill());

        let builtin_names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        let mut seen_skill_sources: Vec<(String, PathBuf)> = Vec::new();
        let mut enabled = 0usize;

        for mut skill in scanned {
            let source = match &skill.kind {
                ToolKind::Skill { source, .. } => source.clone(),
                ToolKind::Builtin => continue,
            };

            if builtin_names.iter().any(|n| n == &skill.name) {
                tracing::warn!(
                    skill = %skill.name,
                    source = %source.display(),
                    "skill shadows a builtin tool; disabling the skill"
                );
                skill.enabled = false;
                skill.disabled_reason = Some("shadows a builtin tool".into());
            } else if let Some((_, first)) =
                seen_skill_sources.iter().find(|(n, _)| n == &skill.name)
            {
                tracing::warn!(
                    skill = %skill.name,
                    first = %first.display(),
                    duplicate = %source.display(),
                    "duplicate skill name; disabling the later definition"
                );
                skill.enabled = false;
                skill.disabled_reason = Some(format!(
                    "duplicate of {} (also defined in {})",
                    first.display(),
                    source.display()
                ));
            }

            if skill.enabled {
                enabled += 1;
            }
            seen_skill_sources.push((skill.name.clone(), source));
            entries.push(skill);
        }
        drop(entries);

        self.regenerate_snapshot();
        Ok(enabled)
    }

    fn regenerate_snapshot(&self) {
        let entries = self.entries.read();
        let mut lines: Vec<String> = vec!["Available tools and skills:".into()];
        for entry in entries.iter().filter(|e| e.enabled) {
            lines.push(entry.snapshot_line());
        }
        lines.push(
            "Skills are procedures: read their definition before first use; \
             it is injected automatically on your first invocation."
                .into(),
        );
        *self.snapshot.write() = lines.join("\n");
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<ToolEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.enabled && e.matches_name(name))
            .cloned()
    }

    pub fn list(&self) -> Vec<ToolEntry> {
        self.entries.read().clone()
    }

    /// Wire definitions for every enabled entry, optionally restricted
    /// to an allowed subset (skill constraint).
    pub fn definitions(&self, allowed: Option<&[String]>) -> Vec<ToolDefinition> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.enabled)
            .filter(|e| match allowed {
                Some(names) => names.iter().any(|n| e.matches_name(n)),
                None => true,
            })
            .map(|e| e.definition())
            .collect()
    }

    /// The discovery snapshot injected into the system prompt.
    pub fn snapshot(&self) -> String {
        self.snapshot.read().clone()
    }

    // ── Validation ─────────────────────────────────────────────────

    /// Validate an arguments payload against the entry's schema and
    /// the serialized-size cap.
    pub fn validate_args(&self, name: &str, args: &serde_json::Value) -> Result<()> {
        let entry = self
            .get(name)
            .ok_or_else(|| Error::Validation(format!("unknown tool \"{name}\"")))?;

        let serialized_len = serde_json::to_string(args).map(|s| s.len()).unwrap_or(0);
        if serialized_len > ARGS_BYTE_CAP {
            return Err(Error::Validation(format!(
                "arguments for \"{name}\" are {serialized_len} bytes; the limit is {ARGS_BYTE_CAP}"
            )));
        }

        let validator = jsonschema::validator_for(&entry.arguments_schema)
            .map_err(|e| Error::Internal(format!("invalid schema for \"{name}\": {e}")))?;

        let problems: Vec<String> = validator
            .iter_errors(args)
            .map(|err| format!("{}: {}", err.instance_path(), err))
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "arguments for \"{name}\" failed schema: {}",
                problems.join("; ")
            )))
        }
    }

    // ── Skills ─────────────────────────────────────────────────────

    /// Load the full procedure body for a skill — the payload injected
    /// before the skill's first dispatch in a session.
    pub fn skill_body(&self, name: &str) -> Result<String> {
        let entry = self
            .get(name)
            .ok_or_else(|| Error::SkillUnavailable(name.to_string()))?;
        match &entry.kind {
            ToolKind::Skill { source, .. } => loader::load_skill_body(source),
            ToolKind::Builtin => Err(Error::Validation(format!(
                "\"{name}\" is a builtin tool, not a skill"
            ))),
        }
    }

    /// The allowed-tools constraint a skill declares, if any.
    pub fn skill_allowed_tools(&self, name: &str) -> Option<Vec<String>> {
        match self.get(name)?.kind {
            ToolKind::Skill { allowed_tools, .. } if !allowed_tools.is_empty() => {
                Some(allowed_tools)
            }
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
