//! Workspace file tools.

use serde_json::{json, Value};

use dp_domain::error::Error;
use dp_domain::event::EventBody;

use super::{ToolContext, ToolOutput};

pub(super) fn list_files(ctx: &ToolContext<'_>) -> ToolOutput {
    match ctx.workspace.list_tree() {
        Ok(tree) => {
            let count = tree.len();
            ToolOutput::ok(json!({ "files": tree, "count": count }))
        }
        Err(e) => ToolOutput::fail(&e),
    }
}

pub(super) fn read_file(args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    let path = args["path"].as_str().unwrap_or_default();
    match ctx.workspace.read_file(path) {
        Ok(content) => match content.text() {
            Some(text) => ToolOutput::ok(json!({
                "path": path,
                "content": text,
                "truncated": content.truncated,
            })),
            None => ToolOutput::fail(&Error::Validation(format!(
                "{path} is binary; use a preview instead"
            ))),
        },
        Err(e) => ToolOutput::fail(&e),
    }
}

pub(super) async fn write_note(args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    let path = args["path"].as_str().unwrap_or_default();
    let content = args["content"].as_str().unwrap_or_default();

    let relative = if path.starts_with("notes/") {
        path.to_string()
    } else {
        format!("notes/{path}")
    };

    match ctx.workspace.write_file(&relative, content.as_bytes()).await {
        Ok(meta) => ToolOutput::ok_with(
            json!({ "path": relative, "size": meta.size }),
            vec![EventBody::Artifact {
                path: relative.clone(),
                kind: "note".into(),
                meta: json!({ "size": meta.size }),
            }],
        ),
        Err(e) => ToolOutput::fail(&e),
    }
}
