//! Compression persistence under `workspace/.compression/`.
//!
//! Three artifacts live there: the monotone record log (audit trail),
//! the cumulative summary document, and offloaded payload copies.
//! Records reconstruct the pre-compression prompt for audit and are
//! never fed back to the model verbatim.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use dp_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub timestamp: String,
    /// Inclusive turn range the compressed prefix covered.
    pub turn_range: (u64, u64),
    pub summary_text: String,
    pub original_token_estimate: u32,
    pub compressed_token_estimate: u32,
    pub lossy: bool,
}

pub struct CompressionStore {
    dir: PathBuf,
}

impl CompressionStore {
    pub fn new(workspace_dir: &Path) -> Result<Self> {
        let dir = workspace_dir.join(".compression");
        std::fs::create_dir_all(dir.join("payloads"))?;
        Ok(Self { dir })
    }

    /// Append one record to the monotone log.
    pub fn append_record(&self, record: &CompressionRecord) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("records.jsonl"))
            .map_err(Error::Io)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes()).map_err(Error::Io)?;
        Ok(())
    }

    pub fn read_records(&self) -> Result<Vec<CompressionRecord>> {
        let path = self.dir.join("records.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Persist the cumulative summary (overwritten; history lives in
    /// the record log).
    pub fn write_summary(&self, summary: &str) -> Result<()> {
        std::fs::write(self.dir.join("summary.md"), summary)?;
        Ok(())
    }

    pub fn read_summary(&self) -> Result<String> {
        let path = self.dir.join("summary.md");
        if !path.exists() {
            return Ok(String::new());
        }
        Ok(std::fs::read_to_string(path)?)
    }

    /// Store an offloaded payload; returns the workspace-relative
    /// reference handle.
    pub fn offload_payload(&self, turn_id: u64, index: usize, payload: &str) -> Result<String> {
        let name = format!("turn{turn_id:06}-{index:03}.txt");
        std::fs::write(self.dir.join("payloads").join(&name), payload)?;
        Ok(format!(".compression/payloads/{name}"))
    }

    pub fn read_payload(&self, handle: &str) -> Result<String> {
        let name = handle
            .rsplit('/')
            .next()
            .ok_or_else(|| Error::Validation(format!("bad payload handle: {handle}")))?;
        Ok(std::fs::read_to_string(
            self.dir.join("payloads").join(name),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_monotone() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CompressionStore::new(tmp.path()).unwrap();

        for i in 0..3u64 {
            store
                .append_record(&CompressionRecord {
                    timestamp: format!("t{i}"),
                    turn_range: (i, i + 1),
                    summary_text: "s".into(),
                    original_token_estimate: 100,
                    compressed_token_estimate: 10,
                    lossy: false,
                })
                .unwrap();
        }

        let records = store.read_records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].turn_range, (2, 3));
    }

    #[test]
    fn payload_offload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CompressionStore::new(tmp.path()).unwrap();

        let handle = store.offload_payload(7, 0, "big tool payload").unwrap();
        assert!(handle.starts_with(".compression/payloads/"));
        assert_eq!(store.read_payload(&handle).unwrap(), "big tool payload");
    }

    #[test]
    fn summary_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CompressionStore::new(tmp.path()).unwrap();
        assert_eq!(store.read_summary().unwrap(), "");
        store.write_summary("## Decisions\n- use median").unwrap();
        assert!(store.read_summary().unwrap().contains("median"));
    }
}
