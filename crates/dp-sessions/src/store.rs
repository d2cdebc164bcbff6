//! Session metadata store: one directory per session under the
//! configured root, carrying `meta.json`, `memory.jsonl`, and the
//! workspace tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use dp_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub title: String,
    pub created_at: String,
    /// Research profile reference attached to prompt assembly.
    #[serde(default)]
    pub profile_ref: Option<String>,
    /// Active dataset bindings (name → workspace-relative path).
    #[serde(default)]
    pub datasets: HashMap<String, String>,
    /// Cumulative token counters, mutated only by the runtime loop.
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub message_count: u64,
}

pub struct SessionStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, SessionMeta>>,
}

impl SessionStore {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = Self {
            root: root.to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        };
        store.load_existing()?;
        Ok(store)
    }

    fn load_existing(&self) -> Result<()> {
        let mut cache = self.cache.write();
        for entry in std::fs::read_dir(&self.root)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let meta_path = dir.join("meta.json");
            if !meta_path.exists() {
                continue;
            }
            match std::fs::read_to_string(&meta_path)
                .map_err(Error::Io)
                .and_then(|raw| serde_json::from_str::<SessionMeta>(&raw).map_err(Error::Json))
            {
                Ok(meta) => {
                    cache.insert(meta.id.clone(), meta);
                }
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable session");
                }
            }
        }
        Ok(())
    }

    pub fn session_root(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Create a session; the directory appears on first persist.
    pub fn create(&self, title: Option<String>) -> Result<SessionMeta> {
        let id = uuid::Uuid::new_v4().to_string();
        let meta = SessionMeta {
            id: id.clone(),
            title: title.unwrap_or_else(|| "Untitled analysis".into()),
            created_at: Utc::now().to_rfc3339(),
            profile_ref: None,
            datasets: HashMap::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            message_count: 0,
        };
        self.persist(&meta)?;
        self.cache.write().insert(id, meta.clone());
        Ok(meta)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMeta> {
        self.cache.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<SessionMeta> {
        let mut sessions: Vec<_> = self.cache.read().values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Apply a mutation and persist the result.
    pub fn update<F>(&self, session_id: &str, mutate: F) -> Result<SessionMeta>
    where
        F: FnOnce(&mut SessionMeta),
    {
        let mut cache = self.cache.write();
        let meta = cache
            .get_mut(session_id)
            .ok_or_else(|| Error::Validation(format!("no such session: {session_id}")))?;
        mutate(meta);
        let snapshot = meta.clone();
        drop(cache);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    pub fn record_usage(&self, session_id: &str, prompt: u64, completion: u64) -> Result<()> {
        self.update(session_id, |meta| {
            meta.prompt_tokens += prompt;
            meta.completion_tokens += completion;
        })
        .map(|_| ())
    }

    /// Destroy a session: metadata, turn log, and workspace.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let removed = self.cache.write().remove(session_id);
        if removed.is_none() {
            return Err(Error::Validation(format!("no such session: {session_id}")));
        }
        let dir = self.session_root(session_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        tracing::info!(session_id, "session deleted");
        Ok(())
    }

    fn persist(&self, meta: &SessionMeta) -> Result<()> {
        let dir = self.session_root(&meta.id);
        std::fs::create_dir_all(&dir)?;
        let tmp = dir.join("meta.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
        std::fs::rename(&tmp, dir.join("meta.json"))?;
        Ok(())
    }
}
