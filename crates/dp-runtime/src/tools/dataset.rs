//! Dataset tools: load/bind, describe, and the grouped-mean
//! aggregation. These cover the quick questions; anything heavier goes
//! through `run_code` and the scientific stack.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use dp_domain::error::Error;
use dp_domain::event::EventBody;
use dp_workspace::dataset::{profile_csv, split_csv_line};

use super::{ToolContext, ToolOutput};

pub(super) async fn load_dataset(args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    let name = args["name"].as_str().unwrap_or_default();
    let relative = args["path"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("datasets/{name}.csv"));

    let profile = match profile_csv(ctx.workspace, name, &relative) {
        Ok(profile) => profile,
        Err(e) => return ToolOutput::fail(&e),
    };

    // Bind the name in session metadata.
    if let Err(e) = ctx.sessions.update(ctx.session_id, |meta| {
        meta.datasets.insert(name.to_string(), relative.clone());
    }) {
        return ToolOutput::fail(&e);
    }

    let derived = vec![EventBody::Data {
        columns: profile.columns.clone(),
        rows: profile
            .sample
            .iter()
            .map(|row| row.iter().map(|cell| json!(cell)).collect())
            .collect(),
    }];

    ToolOutput::ok_with(
        json!({
            "name": profile.name,
            "path": profile.path,
            "columns": profile.columns,
            "row_count": profile.row_count,
        }),
        derived,
    )
}

pub(super) fn describe_dataset(args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    let name = args["name"].as_str().unwrap_or_default();
    let (columns, rows) = match read_bound(ctx, name) {
        Ok(table) => table,
        Err(e) => return ToolOutput::fail(&e),
    };

    let mut summary = Vec::new();
    for (index, column) in columns.iter().enumerate() {
        let values: Vec<&str> = rows
            .iter()
            .filter_map(|r| r.get(index).map(String::as_str))
            .collect();
        let numeric: Vec<f64> = values.iter().filter_map(|v| v.parse().ok()).collect();

        let mut entry = json!({
            "column": column,
            "count": values.len(),
            "non_empty": values.iter().filter(|v| !v.is_empty()).count(),
        });
        if !numeric.is_empty() && numeric.len() == values.iter().filter(|v| !v.is_empty()).count()
        {
            let sum: f64 = numeric.iter().sum();
            let min = numeric.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = numeric.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            entry["numeric"] = json!({
                "min": min,
                "mean": sum / numeric.len() as f64,
                "max": max,
            });
        }
        summary.push(entry);
    }

    let derived = vec![EventBody::Data {
        columns: vec!["column".into(), "count".into(), "summary".into()],
        rows: summary
            .iter()
            .map(|entry| {
                vec![
                    entry["column"].clone(),
                    entry["count"].clone(),
                    entry.get("numeric").cloned().unwrap_or(Value::Null),
                ]
            })
            .collect(),
    }];

    ToolOutput::ok_with(json!({ "name": name, "columns": summary }), derived)
}

pub(super) fn group_by_mean(args: &Value, ctx: &ToolContext<'_>) -> ToolOutput {
    let name = args["name"].as_str().unwrap_or_default();
    let group_by = args["group_by"].as_str().unwrap_or_default();
    let value = args["value"].as_str().unwrap_or_default();

    let (columns, rows) = match read_bound(ctx, name) {
        Ok(table) => table,
        Err(e) => return ToolOutput::fail(&e),
    };

    let Some(group_idx) = columns.iter().position(|c| c == group_by) else {
        return ToolOutput::fail(&Error::Validation(format!(
            "no column \"{group_by}\" in dataset \"{name}\" (has: {})",
            columns.join(", ")
        )));
    };
    let Some(value_idx) = columns.iter().position(|c| c == value) else {
        return ToolOutput::fail(&Error::Validation(format!(
            "no column \"{value}\" in dataset \"{name}\" (has: {})",
            columns.join(", ")
        )));
    };

    let mut groups: BTreeMap<String, (f64, u64)> = BTreeMap::new();
    let mut skipped = 0u64;
    for row in &rows {
        let (Some(key), Some(raw)) = (row.get(group_idx), row.get(value_idx)) else {
            skipped += 1;
            continue;
        };
        match raw.parse::<f64>() {
            Ok(v) => {
                let slot = groups.entry(key.clone()).or_insert((0.0, 0));
                slot.0 += v;
                slot.1 += 1;
            }
            Err(_) => skipped += 1,
        }
    }
    if groups.is_empty() {
        return ToolOutput::fail(&Error::Validation(format!(
            "column \"{value}\" has no numeric values"
        )));
    }

    let table: Vec<(String, f64)> = groups
        .into_iter()
        .map(|(key, (sum, n))| (key, sum / n as f64))
        .collect();

    let derived = vec![EventBody::Data {
        columns: vec![group_by.to_string(), format!("mean_{value}")],
        rows: table
            .iter()
            .map(|(key, mean)| vec![json!(key), json!(mean)])
            .collect(),
    }];

    ToolOutput::ok_with(
        json!({
            "name": name,
            "group_by": group_by,
            "value": value,
            "groups": table
                .iter()
                .map(|(key, mean)| json!({ "group": key, "mean": mean }))
                .collect::<Vec<_>>(),
            "rows_skipped": skipped,
        }),
        derived,
    )
}

/// Read a bound dataset fully into (columns, rows).
pub(super) fn read_bound(
    ctx: &ToolContext<'_>,
    name: &str,
) -> Result<(Vec<String>, Vec<Vec<String>>), Error> {
    let meta = ctx
        .sessions
        .get(ctx.session_id)
        .ok_or_else(|| Error::Validation(format!("no such session: {}", ctx.session_id)))?;
    let relative = meta
        .datasets
        .get(name)
        .ok_or_else(|| {
            Error::Validation(format!(
                "dataset \"{name}\" is not bound; call load_dataset first"
            ))
        })?
        .clone();

    let content = ctx.workspace.read_file(&relative)?;
    let text = content
        .text()
        .ok_or_else(|| Error::Validation(format!("dataset {relative} is not text")))?;

    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let columns = lines
        .next()
        .map(split_csv_line)
        .ok_or_else(|| Error::Validation(format!("dataset {relative} is empty")))?;
    let rows = lines.map(split_csv_line).collect();
    Ok((columns, rows))
}
