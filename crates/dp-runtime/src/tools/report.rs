//! Report generator: titled Markdown sections referencing workspace
//! artifacts, stored under notes/.

use serde_json::{json, Value};

use dp_domain::event::EventBody;

use super::{ToolContext, ToolOutput};

pub(super) async fn generate_report(args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    let title = args["title"].as_str().unwrap_or("Report");
    let empty = Vec::new();
    let sections = args["sections"].as_array().unwrap_or(&empty);

    let mut doc = format!("# {title}\n");
    for section in sections {
        let heading = section["heading"].as_str().unwrap_or("");
        let body = section["body"].as_str().unwrap_or("");
        doc.push_str(&format!("\n## {heading}\n\n{body}\n"));

        if let Some(artifacts) = section["artifacts"].as_array() {
            for artifact in artifacts.iter().filter_map(Value::as_str) {
                // Images embed; everything else links.
                if artifact.ends_with(".png")
                    || artifact.ends_with(".jpg")
                    || artifact.ends_with(".svg")
                {
                    doc.push_str(&format!("\n![{heading}]({artifact})\n"));
                } else {
                    doc.push_str(&format!("\n[{artifact}]({artifact})\n"));
                }
            }
        }
    }

    let slug: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let relative = format!("notes/{slug}.md");

    match ctx.workspace.write_file(&relative, doc.as_bytes()).await {
        Ok(meta) => ToolOutput::ok_with(
            json!({ "path": relative, "sections": sections.len(), "size": meta.size }),
            vec![EventBody::Artifact {
                path: relative.clone(),
                kind: "report".into(),
                meta: json!({ "size": meta.size, "preview_format": "markdown" }),
            }],
        ),
        Err(e) => ToolOutput::fail(&e),
    }
}
