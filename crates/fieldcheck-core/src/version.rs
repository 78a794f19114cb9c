//! Build-version drift detection.
//!
//! On start, the running build is compared with the marker persisted by the
//! previous session. A difference flags an update once; the marker is then
//! overwritten so the notification does not repeat for the same transition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::{self, KeyValueStore};

/// Local storage key of the persisted marker.
pub const VERSION_MARKER_KEY: &str = "version_marker";

/// Identity of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct VersionMarker {
    pub version: String,
    #[serde(default)]
    pub build_time: Option<String>,
    #[serde(default)]
    pub build_hash: Option<String>,
}

impl VersionMarker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            build_time: None,
            build_hash: None,
        }
    }

    /// The running build. Time and hash are injected at build time through
    /// `FIELDCHECK_BUILD_TIME` and `FIELDCHECK_BUILD_HASH` when available.
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_time: option_env!("FIELDCHECK_BUILD_TIME").map(str::to_string),
            build_hash: option_env!("FIELDCHECK_BUILD_HASH").map(str::to_string),
        }
    }

    /// Versions differ, or both carry a build hash and the hashes differ.
    pub fn differs_from(&self, other: &VersionMarker) -> bool {
        if self.version != other.version {
            return true;
        }
        matches!((&self.build_hash, &other.build_hash), (Some(a), Some(b)) if a != b)
    }

    pub fn display(&self) -> String {
        match self.build_hash.as_deref() {
            Some(hash) => format!("v{} ({})", self.version, hash.chars().take(7).collect::<String>()),
            None => format!("v{}", self.version),
        }
    }
}

/// Persisted form. Older clients stored the bare version string.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredMarker {
    Full(VersionMarker),
    Legacy(String),
}

impl From<StoredMarker> for VersionMarker {
    fn from(stored: StoredMarker) -> Self {
        match stored {
            StoredMarker::Full(marker) => marker,
            StoredMarker::Legacy(version) => VersionMarker::new(version),
        }
    }
}

/// Outcome of a version check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct VersionCheck {
    pub should_update: bool,
    pub version_info: VersionMarker,
    pub previous: Option<VersionMarker>,
}

impl VersionCheck {
    /// One-time notification text, present only when an update was detected.
    pub fn notification(&self) -> Option<String> {
        if !self.should_update {
            return None;
        }
        let from = self
            .previous
            .as_ref()
            .map(VersionMarker::display)
            .unwrap_or_else(|| "a previous version".to_string());
        Some(format!(
            "Updated from {} to {}. Reload to use the latest build.",
            from,
            self.version_info.display()
        ))
    }
}

/// Compares the running build with the persisted marker.
pub struct VersionWatcher {
    store: Arc<dyn KeyValueStore>,
    running: VersionMarker,
}

impl VersionWatcher {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_running(store, VersionMarker::current())
    }

    pub fn with_running(store: Arc<dyn KeyValueStore>, running: VersionMarker) -> Self {
        Self { store, running }
    }

    pub fn running(&self) -> &VersionMarker {
        &self.running
    }

    /// Compare with the stored marker, then overwrite it with the running build.
    ///
    /// A missing or unreadable marker counts as a first run.
    pub fn check_version(&self) -> VersionCheck {
        let previous = match storage::load_json::<StoredMarker>(self.store.as_ref(), VERSION_MARKER_KEY) {
            Ok(stored) => stored.map(VersionMarker::from),
            Err(e) => {
                warn!(error = %e, "Unreadable version marker, treating as first run");
                None
            }
        };

        let should_update = previous
            .as_ref()
            .is_some_and(|prev| prev.differs_from(&self.running));
        if should_update {
            info!(
                from = previous.as_ref().map(|p| p.version.as_str()),
                to = %self.running.version,
                "New build detected"
            );
        }

        if let Err(e) = storage::save_json(self.store.as_ref(), VERSION_MARKER_KEY, &self.running) {
            warn!(error = %e, "Failed to persist version marker");
        }

        VersionCheck {
            should_update,
            version_info: self.running.clone(),
            previous,
        }
    }
}
