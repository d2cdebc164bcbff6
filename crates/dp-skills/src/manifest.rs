//! SKILL.md front-matter parsing.
//!
//! A skill document opens with a YAML front-matter block:
//!
//! ```markdown
//! ---
//! name: root-analysis
//! description: Guided root-cause analysis over a dataset
//! category: analysis
//! allowed-tools: [load_dataset, run_code, build_chart]
//! aliases: [rca]
//! tags: [statistics]
//! ---
//! # Procedure
//! ...
//! ```
//!
//! The body after the closing delimiter is the procedure the model
//! reads before first use.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillManifest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, rename = "allowed-tools", alias = "allowed_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Split a SKILL.md document into parsed front-matter and body.
///
/// Returns `(None, full_text)` when there is no front-matter block or
/// the YAML fails to parse.
pub fn parse_frontmatter(content: &str) -> (Option<SkillManifest>, &str) {
    let rest = match content.strip_prefix("---") {
        Some(rest) => rest,
        None => return (None, content),
    };
    // The opening delimiter must be its own line.
    let rest = match rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) {
        Some(rest) => rest,
        None => return (None, content),
    };

    let Some(end) = find_closing_delimiter(rest) else {
        return (None, content);
    };
    let yaml = &rest[..end];
    let body = rest[end..]
        .trim_start_matches("---")
        .trim_start_matches(['\r', '\n']);

    match serde_yaml::from_str::<SkillManifest>(yaml) {
        Ok(manifest) => (Some(manifest), body),
        Err(e) => {
            tracing::warn!(error = %e, "invalid SKILL.md front-matter");
            (None, content)
        }
    }
}

fn find_closing_delimiter(s: &str) -> Option<usize> {
    let mut offset = 0;
    for line in s.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\nname: root-analysis\ndescription: Guided RCA\nallowed-tools: [load_dataset, run_code]\naliases: [rca]\n---\n# Steps\n1. Load the dataset.\n";

    #[test]
    fn parses_name_and_allowed_tools() {
        let (manifest, body) = parse_frontmatter(DOC);
        let manifest = manifest.unwrap();
        assert_eq!(manifest.name.as_deref(), Some("root-analysis"));
        assert_eq!(manifest.allowed_tools, vec!["load_dataset", "run_code"]);
        assert_eq!(manifest.aliases, vec!["rca"]);
        assert!(body.starts_with("# Steps"));
    }

    #[test]
    fn missing_frontmatter_returns_full_text() {
        let (manifest, body) = parse_frontmatter("just a document");
        assert!(manifest.is_none());
        assert_eq!(body, "just a document");
    }

    #[test]
    fn unterminated_frontmatter_is_rejected() {
        let (manifest, _) = parse_frontmatter("---\nname: x\nno closing");
        assert!(manifest.is_none());
    }

    #[test]
    fn snake_case_allowed_tools_accepted() {
        let doc = "---\nname: s\nallowed_tools: [a]\n---\nbody";
        let (manifest, _) = parse_frontmatter(doc);
        assert_eq!(manifest.unwrap().allowed_tools, vec!["a"]);
    }
}
