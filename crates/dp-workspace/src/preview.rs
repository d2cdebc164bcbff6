//! Preview contract: pick a render mode from extension and size.

use serde::Serialize;

use dp_domain::config::WorkspaceConfig;
use dp_domain::error::Result;

use crate::store::SessionWorkspace;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Preview {
    /// Served as an image by the transport.
    Image { path: String },
    /// First N lines of a text file.
    Text { lines: Vec<String>, truncated: bool },
    /// Rendered inside a sandboxed iframe client-side.
    HtmlSandbox { path: String },
    Pdf { path: String },
    /// Markdown source, rendered client-side.
    Markdown { text: String, truncated: bool },
    Unsupported { reason: String },
}

/// Build a preview for a workspace file.
pub fn preview(
    workspace: &SessionWorkspace,
    config: &WorkspaceConfig,
    relative: &str,
) -> Result<Preview> {
    let extension = relative
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    // Image / html / pdf previews reference the file; no size read.
    match extension.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" => {
            return Ok(Preview::Image {
                path: relative.to_string(),
            })
        }
        "html" | "htm" => {
            return Ok(Preview::HtmlSandbox {
                path: relative.to_string(),
            })
        }
        "pdf" => {
            return Ok(Preview::Pdf {
                path: relative.to_string(),
            })
        }
        _ => {}
    }

    let content = workspace.read_file(relative)?;
    if content.binary {
        return Ok(Preview::Unsupported {
            reason: "binary content".into(),
        });
    }
    if content.bytes.len() > config.preview_cap_bytes {
        return Ok(Preview::Unsupported {
            reason: "file exceeds the preview size threshold".into(),
        });
    }

    let text = content.text().unwrap_or_default();
    match extension.as_str() {
        "md" | "markdown" => Ok(Preview::Markdown {
            text: head_lines(&text, config.preview_text_lines).join("\n"),
            truncated: content.truncated
                || text.lines().count() > config.preview_text_lines,
        }),
        _ => {
            let lines = head_lines(&text, config.preview_text_lines);
            let truncated =
                content.truncated || text.lines().count() > config.preview_text_lines;
            Ok(Preview::Text { lines, truncated })
        }
    }
}

fn head_lines(text: &str, n: usize) -> Vec<String> {
    text.lines().take(n).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, SessionWorkspace, WorkspaceConfig) {
        let tmp = tempfile::tempdir().unwrap();
        let config = WorkspaceConfig {
            preview_text_lines: 3,
            ..Default::default()
        };
        let ws = SessionWorkspace::open(tmp.path(), &config).unwrap();
        (tmp, ws, config)
    }

    #[tokio::test]
    async fn image_preview_by_extension() {
        let (_tmp, ws, config) = setup();
        ws.write_file("artifacts/plot.png", &[1, 2, 3]).await.unwrap();
        let p = preview(&ws, &config, "artifacts/plot.png").unwrap();
        assert!(matches!(p, Preview::Image { .. }));
    }

    #[tokio::test]
    async fn text_preview_caps_lines() {
        let (_tmp, ws, config) = setup();
        ws.write_file("notes/long.txt", b"1\n2\n3\n4\n5\n").await.unwrap();
        match preview(&ws, &config, "notes/long.txt").unwrap() {
            Preview::Text { lines, truncated } => {
                assert_eq!(lines, vec!["1", "2", "3"]);
                assert!(truncated);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn markdown_gets_its_own_mode() {
        let (_tmp, ws, config) = setup();
        ws.write_file("notes/r.md", b"# Title\nbody\n").await.unwrap();
        assert!(matches!(
            preview(&ws, &config, "notes/r.md").unwrap(),
            Preview::Markdown { .. }
        ));
    }

    #[tokio::test]
    async fn binary_is_unsupported() {
        let (_tmp, ws, config) = setup();
        ws.write_file("artifacts/x.dat", &[0, 1, 2]).await.unwrap();
        assert!(matches!(
            preview(&ws, &config, "artifacts/x.dat").unwrap(),
            Preview::Unsupported { .. }
        ));
    }

    #[tokio::test]
    async fn html_is_sandboxed() {
        let (_tmp, ws, config) = setup();
        ws.write_file("artifacts/chart.html", b"<html/>").await.unwrap();
        assert!(matches!(
            preview(&ws, &config, "artifacts/chart.html").unwrap(),
            Preview::HtmlSandbox { .. }
        ));
    }
}
