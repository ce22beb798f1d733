//! Configuration for synchronization runs.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (crawler-sync.toml)
//! ```toml
//! security_mode = "insert"
//! identifiables = "identifiables.json"
//!
//! [query]
//! prefix_length = 200
//!
//! [pending_cache]
//! path = "/var/lib/crawler-sync/pending"
//!
//! [restrictions]
//! no_insert_types = ["Person"]
//! ```

mod defaults;

pub use defaults::*;

use crate::sync::SecurityMode;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration of a synchronization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Which remote writes are executed directly
    pub security_mode: SecurityMode,
    /// Ask the remote to enforce unique names on writes
    pub unique_names: bool,
    /// `false` performs a dry run without remote writes
    pub commit_changes: bool,
    /// Path to the registered identifiable definitions (JSON)
    pub identifiables: Option<PathBuf>,
    pub query: QueryConfig,
    pub pending_cache: PendingCacheConfig,
    pub notifications: NotificationConfig,
    pub restrictions: RestrictionConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::default(),
            unique_names: DEFAULT_UNIQUE_NAMES,
            commit_changes: DEFAULT_COMMIT_CHANGES,
            identifiables: None,
            query: QueryConfig::default(),
            pending_cache: PendingCacheConfig::default(),
            notifications: NotificationConfig::default(),
            restrictions: RestrictionConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(SyncConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with CRAWLER_SYNC_ prefix
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Identifying query settings of the remote adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Characters kept for prefix matches of long text values
    pub prefix_length: usize,
    /// Capacity of the query result cache
    pub cache_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            prefix_length: DEFAULT_QUERY_PREFIX_LENGTH,
            cache_capacity: DEFAULT_QUERY_CACHE_CAPACITY,
        }
    }
}

/// Where suppressed writes are kept until they are authorized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingCacheConfig {
    /// RocksDB directory; in-memory when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub send_crawler_notifications: bool,
    /// Base URL shown in notifications about pending changes
    pub public_host_url: Option<String>,
}

/// Record types that must not be inserted or updated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictionConfig {
    pub no_insert_types: Vec<String>,
    pub no_update_types: Vec<String>,
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_mode: Option<SecurityMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_changes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifiables: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_cache: Option<PendingCacheOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingCacheOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.security_mode, SecurityMode::Retrieve);
        assert!(config.commit_changes);
        assert!(config.unique_names);
        assert_eq!(config.query.prefix_length, DEFAULT_QUERY_PREFIX_LENGTH);
        assert!(config.pending_cache.path.is_none());
    }

    #[test]
    fn test_file_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler-sync.toml");
        std::fs::write(
            &path,
            r#"
security_mode = "insert"
commit_changes = false

[query]
prefix_length = 50

[restrictions]
no_update_types = ["Person"]
"#,
        )
        .unwrap();
        let path = path.to_string_lossy().into_owned();

        let config = SyncConfig::from_env(Some(&path)).unwrap();
        assert_eq!(config.security_mode, SecurityMode::Insert);
        assert!(!config.commit_changes);
        assert_eq!(config.query.prefix_length, 50);
        assert_eq!(config.query.cache_capacity, DEFAULT_QUERY_CACHE_CAPACITY);
        assert_eq!(config.restrictions.no_update_types, vec!["Person".to_string()]);

        let overrides = ConfigOverrides {
            security_mode: Some(SecurityMode::Update),
            ..ConfigOverrides::default()
        };
        let config = SyncConfig::load(Some(&path), overrides).unwrap();
        assert_eq!(config.security_mode, SecurityMode::Update);
        assert!(!config.commit_changes);
    }

    #[test]
    fn test_security_mode_serde() {
        let json = serde_json::to_string(&SecurityMode::Insert).unwrap();
        assert_eq!(json, "\"insert\"");
        let mode: SecurityMode = serde_json::from_str("\"update\"").unwrap();
        assert_eq!(mode, SecurityMode::Update);
    }
}
