//! Persisted local key-value storage.
//!
//! Values are JSON. `FileStore` keeps one file per key under the cache
//! directory and survives restarts; `MemoryStore` is process-local.
//!
//! Keys in use:
//! - `version_marker`: last build seen by the version watcher
//! - `last_session_at`: last time a signed-in session was observed

pub mod file;
pub mod memory;

pub use file::{FileStore, StoredValue};
pub use memory::MemoryStore;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Durable key-value storage collaborator.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Load and decode a typed value.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(value) => {
            let decoded = serde_json::from_value(value)
                .with_context(|| format!("Failed to decode stored value: {}", key))?;
            Ok(Some(decoded))
        }
        None => Ok(None),
    }
}

/// Encode and save a typed value.
pub fn save_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let encoded = serde_json::to_value(value)
        .with_context(|| format!("Failed to encode value for: {}", key))?;
    store.set(key, encoded)
}
