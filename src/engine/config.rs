//! DFU Configuration Module
//! Handles loading and validating dfu.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::updater::download::{DEFAULT_CHUNK_SIZE, DEFAULT_RETRIES};
use super::updater::session::{Settings, DEFAULT_MODE_TIMEOUT_MS};
use super::updater::watchdog::DEFAULT_WATCHDOG_PERIOD_MS;

pub const CONFIG_FILE: &str = "dfu.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfuConfig {
    /// Device node of the companion module
    pub port: PathBuf,
    /// Informational only
    #[serde(default)]
    pub product_uid: Option<String>,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub extract_root: Option<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
    #[serde(default = "default_mode_timeout_secs")]
    pub mode_timeout_secs: u64,
    #[serde(default)]
    pub suppress_watchdog: bool,
    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,
    #[serde(default = "default_active_poll_ms")]
    pub active_poll_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_mode_timeout_secs() -> u64 {
    DEFAULT_MODE_TIMEOUT_MS / 1000
}

fn default_watchdog_period_ms() -> u64 {
    DEFAULT_WATCHDOG_PERIOD_MS
}

fn default_active_poll_ms() -> u64 {
    1000
}

fn default_idle_poll_ms() -> u64 {
    5000
}

impl DfuConfig {
    /// Load `dfu.config.json` from `dir`, or the file itself if `path` is one.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILE)
        } else {
            path.to_path_buf()
        };
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: DfuConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as `dfu.config.json` in `dir`
    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        let config_path = dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Reject values the updater cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than zero".to_string()));
        }
        if self.chunk_retries == 0 {
            return Err(ConfigError::Invalid("chunk_retries must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Defaults for a module on `port`
    pub fn default_for_port(port: impl Into<PathBuf>) -> Self {
        Self {
            port: port.into(),
            product_uid: None,
            download_dir: default_download_dir(),
            extract_root: None,
            chunk_size: default_chunk_size(),
            chunk_retries: default_chunk_retries(),
            mode_timeout_secs: default_mode_timeout_secs(),
            suppress_watchdog: false,
            watchdog_period_ms: default_watchdog_period_ms(),
            active_poll_ms: default_active_poll_ms(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }

    /// Updater tunables derived from this file.
    pub fn settings(&self) -> Settings {
        Settings {
            chunk_size: self.chunk_size,
            chunk_retries: self.chunk_retries,
            mode_timeout_ms: self.mode_timeout_secs * 1000,
            watchdog_period_ms: self.watchdog_period_ms,
            suppress_watchdog: self.suppress_watchdog,
            download_dir: self.download_dir.clone(),
            extract_root: self.extract_root.clone(),
        }
    }

    /// Poll period for the host loop.
    pub fn poll_interval_ms(&self, in_progress: bool) -> u64 {
        if in_progress {
            self.active_poll_ms
        } else {
            self.idle_poll_ms
        }
    }
}
