//! Application configuration management.
//!
//! Configuration is stored at `~/.config/fieldcheck/config.json`. The backend
//! location and credentials can be overridden from the environment (or a
//! `.env` file loaded by the binary).

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "fieldcheck";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_URL: &str = "FIELDCHECK_URL";
pub const ENV_ANON_KEY: &str = "FIELDCHECK_ANON_KEY";
pub const ENV_EMAIL: &str = "FIELDCHECK_EMAIL";
pub const ENV_PASSWORD: &str = "FIELDCHECK_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    pub backend_url: Option<String>,
    /// Public project key sent as `apikey` on every request.
    pub anon_key: Option<String>,
    pub last_email: Option<String>,
    /// Branch of the last signed-in user.
    pub filial: Option<String>,
}

impl Config {
    /// Load from disk, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Override fields from `lookup`; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get(ENV_URL) {
            self.backend_url = Some(url);
        }
        if let Some(key) = get(ENV_ANON_KEY) {
            self.anon_key = Some(key);
        }
        if let Some(email) = get(ENV_EMAIL) {
            self.last_email = Some(email);
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn backend(&self) -> Result<(&str, &str)> {
        let url = self
            .backend_url
            .as_deref()
            .with_context(|| format!("Backend URL not configured (set {ENV_URL})"))?;
        let key = self
            .anon_key
            .as_deref()
            .with_context(|| format!("Backend key not configured (set {ENV_ANON_KEY})"))?;
        Ok((url, key))
    }
}

/// Password from the environment, for non-interactive use.
pub fn password_from_env() -> Option<String> {
    std::env::var(ENV_PASSWORD).ok().filter(|p| !p.is_empty())
}
