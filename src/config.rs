//! Runtime configuration loaded from TOML.
//!
//! ```toml
//! base_dir = "${HOME}/.packrun"
//! bearer_token = "${PACKRUN_TOKEN}"
//! log_buffer_capacity = 500
//! secret_env_prefix = "PACKRUN_SECRET_"
//!
//! [download]
//! max_archive_size = 268435456
//! timeout_secs = 600
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 1000
//! max_delay_ms = 10000
//! ```
//!
//! `${VAR}` references are expanded from the environment before parsing.
//! Every field is optional; hard security bounds stay in
//! [`constants`](crate::constants) and cannot be raised here beyond them.

use crate::constants::{
    DEFAULT_LOG_BUFFER_CAPACITY, DOWNLOAD_TIMEOUT, MAX_ARCHIVE_SIZE, RETRY_INITIAL_DELAY,
    RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY, RETRY_MULTIPLIER,
};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_archive_size: u64,
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_archive_size: MAX_ARCHIVE_SIZE,
            timeout_secs: DOWNLOAD_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            initial_delay_ms: RETRY_INITIAL_DELAY.as_millis() as u64,
            max_delay_ms: RETRY_MAX_DELAY.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root for the pack store, key-value data and history.
    pub base_dir: PathBuf,
    /// Bearer token sent on artifact downloads.
    pub bearer_token: Option<String>,
    pub log_buffer_capacity: usize,
    /// Prefix under which pack secrets are looked up in the environment.
    pub secret_env_prefix: String,
    pub download: DownloadConfig,
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            bearer_token: None,
            log_buffer_capacity: DEFAULT_LOG_BUFFER_CAPACITY,
            secret_env_prefix: String::new(),
            download: DownloadConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".packrun"))
        .unwrap_or_else(|| PathBuf::from(".packrun"))
}

impl RuntimeConfig {
    /// Loads a config file, expanding `${VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = shellexpand::env(content)
            .map_err(|e| Error::Config(format!("variable expansion failed: {}", e)))?;
        let mut config: RuntimeConfig =
            toml::from_str(&expanded).map_err(|e| Error::Config(e.to_string()))?;
        config.clamp();
        Ok(config)
    }

    /// Loads `path` if given, else the default location if it exists, else
    /// defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = default_base_dir().join("config.toml");
                if default.is_file() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn clamp(&mut self) {
        self.download.max_archive_size = self.download.max_archive_size.min(MAX_ARCHIVE_SIZE);
        self.log_buffer_capacity = self.log_buffer_capacity.max(1);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
    }

    pub fn store_dir(&self) -> PathBuf {
        self.base_dir.join("store")
    }

    pub fn kv_dir(&self) -> PathBuf {
        self.base_dir.join("kv")
    }

    pub fn history_path(&self) -> PathBuf {
        self.base_dir.join("history.jsonl")
    }

    pub fn instances_path(&self) -> PathBuf {
        self.base_dir.join("instances.json")
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: RETRY_MULTIPLIER,
        }
    }
}
