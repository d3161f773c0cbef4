//! Durable cache handle map
//!
//! A flat JSON object mapping cache keys to remote handles. It is read once
//! when the store is opened and rewritten after every mutation.

use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Persisted key → handle map
pub struct CacheStore {
    /// Backing file; `None` keeps the map in memory only
    path: Option<PathBuf>,

    /// Current entries
    entries: RwLock<BTreeMap<String, String>>,
}

impl CacheStore {
    /// Create a store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open a store backed by `path`
    ///
    /// A missing file starts an empty map. A file that is not a JSON object
    /// of strings is logged and ignored; it is overwritten on the next
    /// mutation.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable cache map");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), entries = entries.len(), "Loaded persisted cache map");

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persisted handle for `key`
    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    /// Store `handle` under `key` and flush
    pub async fn insert(&self, key: &str, handle: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), handle.to_string());
        self.flush(&entries).await
    }

    /// Remove `key` and flush; returns whether an entry was removed
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.flush(&entries).await?;
        Ok(true)
    }

    /// Copy of all entries
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.read().await.clone()
    }

    /// Write the map through a temporary file so readers never see a torn file
    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_string_pretty(entries)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
