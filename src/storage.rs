//! Persistence collaborator.
//!
//! Components persist their state as one JSON blob per storage key. The
//! store is deliberately minimal: no partial-field updates, no
//! transactions across keys. Every mutating component operation issues its
//! write before returning, which under the single-writer model is all the
//! durability this system needs.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;

use crate::error::{CoreError, Result};

/// Key → JSON blob store.
pub trait Storage: Send + Sync {
    /// Fetch the blob stored under `key`, or `None` if the key has never
    /// been written.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Replace the blob stored under `key`.
    fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

/// File-backed store: one `<key>.json` file per key inside a data
/// directory, written atomically.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Platform default data directory for the store.
    pub fn default_dir() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "sitegate")
            .context("Could not determine data directory")?;
        Ok(dirs.data_local_dir().to_path_buf())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let value = serde_json::from_str(&content)?;
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let content = serde_json::to_string_pretty(&value)?;
        atomic_write(&self.path_for(key), content.as_bytes())
    }
}

/// Atomically write content to a file.
///
/// Writes to a temporary file in the same directory, syncs to disk, then
/// renames to the target path. The rename is atomic on Unix and NTFS
/// filesystems.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    std::fs::rename(&temp_path, path).map_err(CoreError::Io)?;

    Ok(())
}

/// In-memory store, for tests and embedding.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}
