//! Settings loaded from `config/herdsync.toml`.
//!
//! Every section and key is optional. Precedence, lowest first: built-in
//! defaults, the TOML file, the `HERDSYNC_DB` environment variable (also
//! read from `.env`), the `--db` flag.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use herdsync_store::{CacheConfig, QueryCacheConfig};
use herdsync_sync::QueueConfig;
use serde::{Deserialize, Serialize};

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/herdsync.toml";

/// Environment variable overriding `storage.db_path`.
pub const DB_ENV_VAR: &str = "HERDSYNC_DB";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/herdsync.db"),
        }
    }
}

/// Aggregated configuration for every herdsync component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub cache: CacheConfig,
    pub query_cache: QueryCacheConfig,
    pub queue: QueueConfig,
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid herdsync configuration")
    }

    /// Load from `path`, or from [`DEFAULT_CONFIG_PATH`] if `None`.
    ///
    /// An explicitly named file must exist; a missing default file just
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if !path.exists() {
            if required {
                anyhow::bail!("config file {} not found", path.display());
            }
            return Ok((Self::default(), None));
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings = Self::from_toml_str(&content)
            .with_context(|| format!("in {}", path.display()))?;
        Ok((settings, Some(path)))
    }

    /// Apply the environment value and the command-line flag, in that order.
    pub fn apply_overrides(&mut self, env_db: Option<String>, flag_db: Option<PathBuf>) {
        if let Some(db) = env_db.filter(|s| !s.trim().is_empty()) {
            self.storage.db_path = PathBuf::from(db);
        }
        if let Some(db) = flag_db {
            self.storage.db_path = db;
        }
    }
}
