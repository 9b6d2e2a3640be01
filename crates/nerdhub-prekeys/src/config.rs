use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PreKeyError;

pub const ENV_SERVER_URL: &str = "NERDHUB_SERVER_URL";
pub const ENV_DATABASE_PATH: &str = "NERDHUB_DATABASE_PATH";
pub const ENV_KEYS_DIR: &str = "NERDHUB_KEYS_DIR";
pub const ENV_LOG_LEVEL: &str = "NERDHUB_LOG_LEVEL";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the participant directory.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Local SQLite database holding encrypted key material.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Directory holding the per-user local encryption key containers.
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub prekeys: PoolConfig,
}

/// Onetime prekey pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Replenish when the local count is at or below this.
    #[serde(default = "default_stock_threshold")]
    pub stock_threshold: usize,
    /// Keys generated per replenishment or flush.
    #[serde(default = "default_upload_batch_size")]
    pub upload_batch_size: usize,
}

fn default_server_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("nerdhub.db")
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stock_threshold() -> usize {
    10
}

fn default_upload_batch_size() -> usize {
    100
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            stock_threshold: default_stock_threshold(),
            upload_batch_size: default_upload_batch_size(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PreKeyError> {
        if self.upload_batch_size == 0 {
            return Err(PreKeyError::Config(
                "prekeys.upload_batch_size must be greater than zero".into(),
            ));
        }
        if self.upload_batch_size <= self.stock_threshold {
            return Err(PreKeyError::Config(format!(
                "prekeys.upload_batch_size ({}) must exceed prekeys.stock_threshold ({})",
                self.upload_batch_size, self.stock_threshold
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            database_path: default_database_path(),
            keys_dir: default_keys_dir(),
            log_level: default_log_level(),
            prekeys: PoolConfig::default(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `NERDHUB_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, PreKeyError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    PreKeyError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, PreKeyError> {
        toml::from_str(content).map_err(|e| PreKeyError::Config(format!("invalid config: {e}")))
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_SERVER_URL) {
            self.server_url = url;
        }
        if let Some(path) = lookup(ENV_DATABASE_PATH) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(ENV_KEYS_DIR) {
            self.keys_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<(), PreKeyError> {
        url::Url::parse(&self.server_url)
            .map_err(|e| PreKeyError::Config(format!("server_url `{}`: {e}", self.server_url)))?;
        self.prekeys.validate()
    }
}
