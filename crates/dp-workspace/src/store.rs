//! The session workspace store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use dp_domain::config::WorkspaceConfig;
use dp_domain::error::{Error, Result};

use crate::paths::{normalize_key, resolve_contained};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Dataset,
    Artifact,
    Note,
    ExecutionRecord,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileMeta {
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub modified: String,
    /// Retained historical versions.
    pub versions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<&'static str>,
}

/// One tree change, published to the update sink and carried by
/// `workspace_update` events.
#[derive(Debug, Clone, Serialize)]
pub struct TreeDelta {
    pub op: TreeOp,
    pub path: String,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeOp {
    Write,
    Delete,
    Rename,
    CreateFolder,
    RegisterDataset,
}

/// Where tree changes are published. The runtime wires this to its
/// event bus; the workspace never holds a runtime reference.
pub type UpdateSink = tokio::sync::mpsc::UnboundedSender<TreeDelta>;

/// Contents of a read, size-capped and binary-detected.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub binary: bool,
}

impl FileContent {
    pub fn text(&self) -> Option<String> {
        if self.binary {
            None
        } else {
            Some(String::from_utf8_lossy(&self.bytes).into_owned())
        }
    }
}

/// Append-only record of one sandbox call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub timestamp: String,
    pub language: String,
    pub code: String,
    pub status: String,
    pub stdout_tail: String,
    pub elapsed_ms: u64,
    pub artifacts: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionWorkspace {
    workspace_dir: PathBuf,
    retention: usize,
    read_cap: usize,
    /// Per-path advisory write locks. Readers never take these.
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Exclusive lock taken briefly by delete/rename to keep the tree
    /// index coherent.
    tree_lock: tokio::sync::Mutex<()>,
    sink: RwLock<Option<UpdateSink>>,
}

impl SessionWorkspace {
    /// Open (creating on demand) the workspace under a session root.
    pub fn open(session_root: &Path, config: &WorkspaceConfig) -> Result<Self> {
        let workspace_dir = session_root.join("workspace");
        for sub in ["datasets", "artifacts", "executions", "notes"] {
            std::fs::create_dir_all(workspace_dir.join(sub))?;
        }
        Ok(Self {
            workspace_dir,
            retention: config.artifact_retention_versions,
            read_cap: config.read_cap_bytes,
            write_locks: Mutex::new(HashMap::new()),
            tree_lock: tokio::sync::Mutex::new(()),
            sink: RwLock::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn set_sink(&self, sink: UpdateSink) {
        *self.sink.write() = Some(sink);
    }

    fn publish(&self, delta: TreeDelta) {
        if let Some(sink) = self.sink.read().as_ref() {
            let _ = sink.send(delta);
        }
    }

    /// Classify a path by its top-level folder.
    pub fn kind_of(&self, relative: &str) -> FileKind {
        match normalize_key(relative).split('/').next() {
            Some("datasets") => FileKind::Dataset,
            Some("artifacts") => FileKind::Artifact,
            Some("notes") => FileKind::Note,
            Some("executions") => FileKind::ExecutionRecord,
            _ => FileKind::Other,
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Atomic write: temp file in the target directory, then rename.
    /// An existing file is versioned first. Writers to the same path
    /// are serialized; a partial write is never observable.
    pub async fn write_file(&self, relative: &str, bytes: &[u8]) -> Result<FileMeta> {
        let key = normalize_key(relative);
        let path = resolve_contained(&self.workspace_dir, relative)?;
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            self.push_version(&key, &path)?;
        }

        let parent = path
            .parent()
            .ok_or_else(|| Error::Validation(format!("no parent for {relative}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut tmp, bytes)?;
        tmp.persist(&path)
            .map_err(|e| Error::Io(e.error))?;

        let meta = self.stat(&key, &path)?;
        self.publish(TreeDelta {
            op: TreeOp::Write,
            path: key,
            kind: meta.kind,
        });
        Ok(meta)
    }

    /// Copy an external file into the workspace (dataset import).
    pub async fn import_file(&self, source: &Path, relative: &str) -> Result<FileMeta> {
        let bytes = std::fs::read(source)?;
        self.write_file(relative, &bytes).await
    }

    pub async fn create_folder(&self, relative: &str) -> Result<()> {
        let path = resolve_contained(&self.workspace_dir, relative)?;
        std::fs::create_dir_all(&path)?;
        self.publish(TreeDelta {
            op: TreeOp::CreateFolder,
            path: normalize_key(relative),
            kind: self.kind_of(relative),
        });
        Ok(())
    }

    pub async fn delete(&self, relative: &str) -> Result<()> {
        let path = resolve_contained(&self.workspace_dir, relative)?;
        let _tree = self.tree_lock.lock().await;
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else if path.exists() {
            std::fs::remove_file(&path)?;
        } else {
            return Err(Error::Validation(format!("no such file: {relative}")));
        }
        self.publish(TreeDelta {
            op: TreeOp::Delete,
            path: normalize_key(relative),
            kind: self.kind_of(relative),
        });
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<FileMeta> {
        let src = resolve_contained(&self.workspace_dir, from)?;
        let dst = resolve_contained(&self.workspace_dir, to)?;
        let _tree = self.tree_lock.lock().await;
        if !src.exists() {
            return Err(Error::Validation(format!("no such file: {from}")));
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&src, &dst)?;
        let key = normalize_key(to);
        let meta = self.stat(&key, &dst)?;
        self.publish(TreeDelta {
            op: TreeOp::Rename,
            path: key,
            kind: meta.kind,
        });
        Ok(meta)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Read a file, capped and binary-detected. Reads are lock-free
    /// and observe the last committed rename.
    pub fn read_file(&self, relative: &str) -> Result<FileContent> {
        let path = resolve_contained(&self.workspace_dir, relative)?;
        if !path.is_file() {
            return Err(Error::Validation(format!("no such file: {relative}")));
        }
        let size = std::fs::metadata(&path)?.len() as usize;
        let truncated = size > self.read_cap;

        let bytes = if truncated {
            use std::io::Read;
            let mut buf = vec![0u8; self.read_cap];
            let mut file = std::fs::File::open(&path)?;
            file.read_exact(&mut buf)?;
            buf
        } else {
            std::fs::read(&path)?
        };

        let binary = is_binary(&bytes);
        Ok(FileContent {
            bytes,
            truncated,
            binary,
        })
    }

    /// Walk the tree, skipping internal dot-directories.
    pub fn list_tree(&self) -> Result<Vec<FileMeta>> {
        let mut out = Vec::new();
        let mut stack = vec![self.workspace_dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let key = path
                    .strip_prefix(&self.workspace_dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push(self.stat(&key, &path)?);
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn stat(&self, key: &str, path: &Path) -> Result<FileMeta> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata
            .modified()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_default();
        Ok(FileMeta {
            path: key.to_string(),
            kind: self.kind_of(key),
            size: metadata.len(),
            modified,
            versions: self.version_count(key),
            mime: mime_hint(key),
        })
    }

    // ── Version history ────────────────────────────────────────────

    fn versions_dir(&self, key: &str) -> PathBuf {
        self.workspace_dir
            .join(".versions")
            .join(key.replace('/', "__"))
    }

    /// Move the current contents aside before an overwrite. Versions
    /// are numbered by creation order and pruned FIFO beyond the
    /// retention limit.
    fn push_version(&self, key: &str, current: &Path) -> Result<()> {
        if self.retention == 0 {
            return Ok(());
        }
        let dir = self.versions_dir(key);
        std::fs::create_dir_all(&dir)?;

        let next = self
            .version_numbers(key)
            .last()
            .copied()
            .unwrap_or(0)
            + 1;
        std::fs::copy(current, dir.join(format!("{next:06}")))?;

        // FIFO prune: drop oldest beyond the retention limit.
        let numbers = self.version_numbers(key);
        if numbers.len() > self.retention {
            for stale in &numbers[..numbers.len() - self.retention] {
                let _ = std::fs::remove_file(dir.join(format!("{stale:06}")));
            }
        }
        Ok(())
    }

    fn version_numbers(&self, key: &str) -> Vec<u64> {
        let dir = self.versions_dir(key);
        let mut numbers: Vec<u64> = std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        numbers.sort_unstable();
        numbers
    }

    pub fn version_count(&self, key: &str) -> usize {
        self.version_numbers(key).len()
    }

    /// Read a historical version (1-based creation order).
    pub fn read_version(&self, key: &str, number: u64) -> Result<Vec<u8>> {
        let path = self.versions_dir(key).join(format!("{number:06}"));
        std::fs::read(&path)
            .map_err(|_| Error::Validation(format!("no version {number} for {key}")))
    }

    // ── Execution records ──────────────────────────────────────────

    /// Append one record per sandbox call under `executions/`.
    pub async fn record_execution(&self, record: &ExecutionRecord) -> Result<String> {
        let rel = format!("executions/{}-{}.json", record.timestamp_key(), record.id);
        let bytes = serde_json::to_vec_pretty(record)?;
        self.write_file(&rel, &bytes).await?;
        Ok(rel)
    }
}

impl ExecutionRecord {
    /// Filesystem-friendly timestamp prefix for ordering.
    fn timestamp_key(&self) -> String {
        self.timestamp
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|b| *b == 0)
}

fn mime_hint(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    Some(match ext.to_ascii_lowercase().as_str() {
        "csv" => "text/csv",
        "json" => "application/json",
        "md" => "text/markdown",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "html" => "text/html",
        "pdf" => "application/pdf",
        _ => return None,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
