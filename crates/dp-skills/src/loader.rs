//! Skill discovery: scan a directory tree for `SKILL.md` definitions
//! and synthesize catalog entries from their front-matter.

use std::path::{Path, PathBuf};

use dp_domain::capability::ToolCapabilities;
use dp_domain::error::{Error, Result};

use crate::manifest::parse_frontmatter;
use crate::types::{ToolEntry, ToolKind};

/// Load one skill directory (one containing a `SKILL.md`).
pub fn load_skill(skill_dir: &Path) -> Result<Option<ToolEntry>> {
    let md_path = skill_dir.join("SKILL.md");
    if !md_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&md_path)?;
    let (manifest, _body) = parse_frontmatter(&content);
    let Some(manifest) = manifest else {
        return Ok(None);
    };

    let name = manifest.name.clone().unwrap_or_else(|| {
        skill_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".into())
    });

    Ok(Some(ToolEntry {
        name,
        description: manifest.description.clone().unwrap_or_default(),
        // Skills take a free-form argument object; the procedure body
        // tells the model what to pass.
        arguments_schema: serde_json::json!({
            "type": "object",
            "additionalProperties": true,
        }),
        returns_shape: None,
        capabilities: ToolCapabilities::default(),
        kind: ToolKind::Skill {
            source: md_path,
            allowed_tools: manifest.allowed_tools,
        },
        aliases: manifest.aliases,
        enabled: true,
        disabled_reason: None,
    }))
}

/// Scan the skills root: every direct subdirectory holding a SKILL.md
/// becomes an entry. Invalid documents are skipped with a warning.
pub fn scan_skills(skills_root: &Path) -> Result<Vec<ToolEntry>> {
    let mut entries = Vec::new();
    if !skills_root.exists() {
        return Ok(entries);
    }
    for dir_entry in std::fs::read_dir(skills_root)? {
        let path = dir_entry?.path();
        if !path.is_dir() {
            continue;
        }
        match load_skill(&path) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    skill_dir = %path.display(),
                    error = %e,
                    "skipping skill directory"
                );
            }
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Load the full SKILL.md body for read-before-execute injection.
///
/// An unreadable file at invocation time is a hard error — the model
/// must not guess at a procedure it could not read.
pub fn load_skill_body(source: &PathBuf) -> Result<String> {
    let content = std::fs::read_to_string(source).map_err(|e| {
        Error::SkillUnavailable(format!("{}: {e}", source.display()))
    })?;
    let (_, body) = parse_frontmatter(&content);
    Ok(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir: &str, doc: &str) {
        let skill_dir = root.join(dir);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), doc).unwrap();
    }

    #[test]
    fn scan_finds_skills_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "zeta",
            "---\nname: zeta\ndescription: z\n---\nbody",
        );
        write_skill(
            tmp.path(),
            "alpha",
            "---\nname: alpha\ndescription: a\n---\nbody",
        );

        let entries = scan_skills(tmp.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn directory_without_skill_md_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("not-a-skill")).unwrap();
        assert!(scan_skills(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn name_falls_back_to_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "from-dir", "---\ndescription: d\n---\nbody");
        let entries = scan_skills(tmp.path()).unwrap();
        assert_eq!(entries[0].name, "from-dir");
    }

    #[test]
    fn missing_body_is_skill_unavailable() {
        let err = load_skill_body(&PathBuf::from("/nonexistent/SKILL.md")).unwrap_err();
        assert!(matches!(err, Error::SkillUnavailable(_)));
    }

    #[test]
    fn body_excludes_frontmatter() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "s",
            "---\nname: s\n---\n# Procedure\nstep one",
        );
        let body = load_skill_body(&tmp.path().join("s/SKILL.md")).unwrap();
        assert!(body.starts_with("# Procedure"));
        assert!(!body.contains("name: s"));
    }
}
