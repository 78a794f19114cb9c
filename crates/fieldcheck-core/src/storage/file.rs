use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::KeyValueStore;

/// On-disk envelope: the value plus when it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

/// One JSON file per key in a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            bail!("Invalid storage key: {:?}", key);
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    fn load(&self, key: &str) -> Result<Option<StoredValue>> {
        let path = self.path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read storage file: {}", key))?;
        let stored: StoredValue = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse storage file: {}", key))?;
        Ok(Some(stored))
    }

    /// When `key` was last written, if present.
    pub fn stored_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.load(key)?.map(|s| s.stored_at))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.load(key)?.map(|s| s.value))
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let path = self.path(key)?;
        let stored = StoredValue {
            value,
            stored_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&stored)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write storage file: {}", key))?;
        debug!(key, "Stored value");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{load_json, save_json};

    #[test]
    fn test_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        save_json(&store, "version_marker", &"1.0.0").unwrap();
        assert!(store.stored_at("version_marker").unwrap().is_some());

        let reopened = FileStore::new(dir.path().to_path_buf()).unwrap();
        let value: Option<String> = load_json(&reopened, "version_marker").unwrap();
        assert_eq!(value.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_missing_and_removed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested")).unwrap();
        assert!(store.get("absent").unwrap().is_none());

        store.set("k", serde_json::json!(1)).unwrap();
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
        store.remove("k").unwrap();
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.set("../escape", serde_json::json!(1)).is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        assert!(store.get("broken").is_err());
    }
}
