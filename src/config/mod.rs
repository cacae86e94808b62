//! Configuration management.
//!
//! neuropipe configuration can come from:
//! - Config file (~/.config/neuropipe/config.toml)
//! - Environment variables (NEUROPIPE_*)
//!
//! Command-line flags override both.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::workflow::HashMethod;

/// Working directory root when nothing else is configured.
pub const DEFAULT_BASE_DIR: &str = "neuropipe-work";

/// neuropipe configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Execution defaults
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database holding execution history
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Execution defaults, applied when neither the CLI nor the workflow sets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Root of node working directories and cached results
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// Maximum number of node instances running at once
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// How file inputs are fingerprinted for cache keys
    #[serde(default)]
    pub hash_method: Option<HashMethod>,

    /// Abort the whole run at the first node failure
    #[serde(default)]
    pub stop_on_first_crash: Option<bool>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("neuropipe"))
            .unwrap_or_else(|| PathBuf::from(".neuropipe"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("neuropipe"))
            .unwrap_or_else(|| PathBuf::from(".neuropipe"))
    }

    /// Database path, falling back to the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("neuropipe.db"))
    }

    /// Working directory root, falling back to `./neuropipe-work`.
    pub fn base_dir(&self) -> PathBuf {
        self.execution
            .base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("NEUROPIPE_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("NEUROPIPE_BASE_DIR") {
            self.execution.base_dir = Some(PathBuf::from(dir));
        }
        if let Ok(value) = std::env::var("NEUROPIPE_MAX_CONCURRENCY") {
            if let Ok(parsed) = value.parse::<usize>() {
                self.execution.max_concurrency = Some(parsed);
            }
        }
        if let Ok(value) = std::env::var("NEUROPIPE_HASH_METHOD") {
            if let Ok(parsed) = value.parse::<HashMethod>() {
                self.execution.hash_method = Some(parsed);
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        Self::parse_partial(&content)
    }

    fn parse_partial(content: &str) -> std::result::Result<PartialConfig, ()> {
        toml::from_str(content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(execution) = partial.execution {
            self.execution = execution;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    storage: Option<StorageConfig>,
    execution: Option<ExecutionConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_applies_sections() {
        let partial = Config::parse_partial(
            r#"
[storage]
database_path = "/tmp/np.db"

[execution]
base_dir = "/scratch/work"
max_concurrency = 8
hash_method = "content"
"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_partial(partial);

        assert_eq!(config.database_path(), PathBuf::from("/tmp/np.db"));
        assert_eq!(config.base_dir(), PathBuf::from("/scratch/work"));
        assert_eq!(config.execution.max_concurrency, Some(8));
        assert_eq!(config.execution.hash_method, Some(HashMethod::Content));
    }

    #[test]
    fn test_invalid_toml_is_ignored() {
        assert!(Config::parse_partial("[execution\nbase_dir = ").is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("NEUROPIPE_MAX_CONCURRENCY", "7");
        std::env::set_var("NEUROPIPE_HASH_METHOD", "content");
        std::env::set_var("NEUROPIPE_BASE_DIR", "/scratch/env-work");

        let mut config = Config::default();
        config.execution.max_concurrency = Some(2);
        config.apply_env_overrides();

        std::env::remove_var("NEUROPIPE_MAX_CONCURRENCY");
        std::env::remove_var("NEUROPIPE_HASH_METHOD");
        std::env::remove_var("NEUROPIPE_BASE_DIR");

        assert_eq!(config.execution.max_concurrency, Some(7));
        assert_eq!(config.execution.hash_method, Some(HashMethod::Content));
        assert_eq!(config.base_dir(), PathBuf::from("/scratch/env-work"));

        // unparseable values leave the setting alone
        std::env::set_var("NEUROPIPE_HASH_METHOD", "md5");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("NEUROPIPE_HASH_METHOD");
        assert_eq!(config.execution.hash_method, None);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.base_dir(), PathBuf::from("neuropipe-work"));
        assert!(config.database_path().ends_with("neuropipe.db"));
    }
}
