//! ZIP bundling of selected workspace paths.
//!
//! The archive mirrors the workspace layout, so relative references in
//! Markdown keep resolving, and the files a bundled Markdown document
//! references ride along even when not explicitly selected.

use std::collections::BTreeSet;
use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use dp_domain::error::{Error, Result};

use crate::store::SessionWorkspace;

/// Build a ZIP archive of the selected paths (plus any workspace files
/// referenced from bundled Markdown). Returns the archive bytes.
pub fn bundle_zip(workspace: &SessionWorkspace, selected: &[String]) -> Result<Vec<u8>> {
    if selected.is_empty() {
        return Err(Error::Validation("no paths selected".into()));
    }

    // Resolve the closure of files to include.
    let mut include: BTreeSet<String> = BTreeSet::new();
    let mut queue: Vec<String> = selected.to_vec();
    while let Some(rel) = queue.pop() {
        if !include.insert(rel.clone()) {
            continue;
        }
        if is_markdown(&rel) {
            if let Ok(content) = workspace.read_file(&rel) {
                if let Some(text) = content.text() {
                    for referenced in markdown_references(&text) {
                        if workspace.read_file(&referenced).is_ok() {
                            queue.push(referenced);
                        }
                    }
                }
            }
        }
    }

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut cursor);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for rel in &include {
            let content = workspace
                .read_file(rel)
                .map_err(|_| Error::Validation(format!("cannot bundle {rel}")))?;
            writer
                .start_file(rel.as_str(), options)
                .map_err(|e| Error::Internal(format!("zip: {e}")))?;

            // Entries keep their workspace-relative paths, so Markdown
            // references resolve inside the archive unchanged.
            writer.write_all(&content.bytes)?;
        }
        writer
            .finish()
            .map_err(|e| Error::Internal(format!("zip: {e}")))?;
    }
    Ok(cursor.into_inner())
}

fn is_markdown(path: &str) -> bool {
    path.ends_with(".md") || path.ends_with(".markdown")
}

/// Workspace paths referenced by Markdown links and images.
pub fn markdown_references(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("](") {
        let tail = &rest[open + 2..];
        let Some(close) = tail.find(')') else { break };
        let target = tail[..close].trim();
        // Local workspace references only: no URLs, no anchors.
        if !target.is_empty()
            && !target.contains("://")
            && !target.starts_with('#')
            && !target.starts_with('/')
        {
            out.push(target.trim_start_matches("./").to_string());
        }
        rest = &tail[close + 1..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_domain::config::WorkspaceConfig;

    #[tokio::test]
    async fn bundle_includes_markdown_referenced_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = SessionWorkspace::open(tmp.path(), &WorkspaceConfig::default()).unwrap();
        ws.write_file("artifacts/plot.png", &[1, 2, 3]).await.unwrap();
        ws.write_file(
            "notes/report.md",
            b"# Report\n![chart](artifacts/plot.png)\n",
        )
        .await
        .unwrap();

        let bytes = bundle_zip(&ws, &["notes/report.md".to_string()]).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"notes/report.md".to_string()));
        assert!(names.contains(&"artifacts/plot.png".to_string()));
    }

    #[test]
    fn references_skip_urls_and_anchors() {
        let refs = markdown_references(
            "[a](artifacts/x.png) [b](https://example.com) [c](#section) [d](./notes/y.md)",
        );
        assert_eq!(refs, vec!["artifacts/x.png", "notes/y.md"]);
    }

    #[tokio::test]
    async fn empty_selection_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = SessionWorkspace::open(tmp.path(), &WorkspaceConfig::default()).unwrap();
        assert!(bundle_zip(&ws, &[]).is_err());
    }
}
