//! Dataset registration and lightweight profiling.
//!
//! Registering a dataset binds a name to a workspace path and records
//! a profile (columns, row count, sample head) used by tabular preview
//! events and compression descriptors. Profiling reads the file once,
//! line by line — the scientific stack in the sandbox does the real
//! work later.

use serde::{Deserialize, Serialize};

use dp_domain::error::{Error, Result};

use crate::store::SessionWorkspace;

/// Rows sampled into the profile head.
const SAMPLE_ROWS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub name: String,
    /// Workspace-relative path.
    pub path: String,
    pub columns: Vec<String>,
    pub row_count: u64,
    pub sample: Vec<Vec<String>>,
}

impl DatasetProfile {
    /// Short descriptor used when an inline payload is replaced by a
    /// reference during compression.
    pub fn descriptor(&self) -> String {
        format!(
            "[dataset \"{}\" at {}: {} rows × {} columns ({})]",
            self.name,
            self.path,
            self.row_count,
            self.columns.len(),
            self.columns.join(", ")
        )
    }
}

/// Register a CSV dataset already present in the workspace.
pub fn profile_csv(workspace: &SessionWorkspace, name: &str, relative: &str) -> Result<DatasetProfile> {
    let content = workspace.read_file(relative)?;
    if content.binary {
        return Err(Error::Validation(format!(
            "dataset {relative} is not a text CSV"
        )));
    }
    let text = content.text().unwrap_or_default();
    let mut lines = text.lines();

    let header = lines
        .next()
        .ok_or_else(|| Error::Validation(format!("dataset {relative} is empty")))?;
    let columns: Vec<String> = split_csv_line(header);

    let mut row_count: u64 = 0;
    let mut sample = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        row_count += 1;
        if sample.len() < SAMPLE_ROWS {
            sample.push(split_csv_line(line));
        }
    }

    // A capped read undercounts; the count is an estimate by contract.
    if content.truncated {
        tracing::debug!(path = relative, "dataset larger than read cap; row count is partial");
    }

    Ok(DatasetProfile {
        name: name.to_string(),
        path: relative.to_string(),
        columns,
        row_count,
        sample,
    })
}

/// Minimal CSV field splitting with quote support — enough for
/// profiling and the builtin aggregation tools; never a full parser.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
            }
            other => field.push(other),
        }
    }
    fields.push(field);
    fields.iter().map(|f| f.trim().to_string()).collect()
}
