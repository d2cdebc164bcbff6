//! Chart builder: a Plotly-shaped payload for live rendering, with a
//! JSON artifact as the canonical stored format.

use serde_json::{json, Value};

use dp_domain::error::Error;
use dp_domain::event::EventBody;

use super::dataset::read_bound;
use super::{ToolContext, ToolOutput};

pub(super) async fn build_chart(args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    let dataset = args["dataset"].as_str().unwrap_or_default();
    let chart_type = args["chart_type"].as_str().unwrap_or("bar");
    let x_col = args["x"].as_str().unwrap_or_default();
    let y_col = args["y"].as_str().unwrap_or_default();
    let title = args["title"].as_str().unwrap_or("").to_string();

    let (columns, rows) = match read_bound(ctx, dataset) {
        Ok(table) => table,
        Err(e) => return ToolOutput::fail(&e),
    };

    let Some(x_idx) = columns.iter().position(|c| c == x_col) else {
        return ToolOutput::fail(&Error::Validation(format!(
            "no column \"{x_col}\" in dataset \"{dataset}\""
        )));
    };
    let Some(y_idx) = columns.iter().position(|c| c == y_col) else {
        return ToolOutput::fail(&Error::Validation(format!(
            "no column \"{y_col}\" in dataset \"{dataset}\""
        )));
    };

    let xs: Vec<Value> = rows
        .iter()
        .filter_map(|r| r.get(x_idx))
        .map(|v| match v.parse::<f64>() {
            Ok(n) => json!(n),
            Err(_) => json!(v),
        })
        .collect();
    let ys: Vec<Value> = rows
        .iter()
        .filter_map(|r| r.get(y_idx))
        .map(|v| match v.parse::<f64>() {
            Ok(n) => json!(n),
            Err(_) => json!(v),
        })
        .collect();

    let trace = json!({
        "type": chart_type,
        "x": xs,
        "y": ys,
        "mode": if chart_type == "scatter" { "markers" } else { "lines" },
        "name": y_col,
    });
    let layout = json!({
        "title": { "text": if title.is_empty() { format!("{y_col} by {x_col}") } else { title } },
        "xaxis": { "title": { "text": x_col } },
        "yaxis": { "title": { "text": y_col } },
    });
    let config = json!({ "responsive": true });

    // Canonical stored format: the full figure JSON under artifacts/.
    let figure = json!({ "data": [trace], "layout": layout, "config": config });
    let artifact_path = format!("artifacts/chart-{}-{}.json", dataset, chart_type);
    let meta = match ctx
        .workspace
        .write_file(&artifact_path, figure.to_string().as_bytes())
        .await
    {
        Ok(meta) => meta,
        Err(e) => return ToolOutput::fail(&e),
    };

    let derived = vec![
        EventBody::Chart {
            data: json!([trace]),
            layout: layout.clone(),
            config: config.clone(),
        },
        EventBody::Artifact {
            path: artifact_path.clone(),
            kind: "visualization".into(),
            meta: json!({ "size": meta.size, "preview_format": "json" }),
        },
    ];

    ToolOutput::ok_with(
        json!({
            "artifact": artifact_path,
            "points": xs.len(),
            "chart_type": chart_type,
        }),
        derived,
    )
}
