//! Configuration loading and data folder resolution
//!
//! Resolution order for every setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing TOML file is not an error: the service logs a warning and
//! starts with compiled defaults. A TOML file that exists but cannot be
//! parsed is reported as [`Error::Config`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the data folder
pub const DATA_FOLDER_ENV: &str = "TABSORT_DATA_FOLDER";

/// Environment variable overriding the config file location
pub const CONFIG_FILE_ENV: &str = "TABSORT_CONFIG";

/// Shared secret the browser extension sends as its first message
pub const DEFAULT_TOKEN: &str = "EKSTENSI_FIREFOX_1234";

/// Candidate ports, tried in order at every (re)start
pub const DEFAULT_PORTS: [u16; 5] = [8001, 8002, 8003, 8004, 8005];

pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_LOOKUP_ATTEMPTS: u32 = 2;
pub const DEFAULT_LOOKUP_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT_LOOKUPS: usize = 2;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;
pub const DEFAULT_EMPTY_POOL_RETRY_SECS: u64 = 5;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 20;
pub const DEFAULT_YT_DLP: &str = "yt-dlp";

/// Music bucket log file name
pub const MUSIC_LOG_FILE: &str = "tab_log.txt";

/// Non-music bucket log file name
pub const NON_MUSIC_LOG_FILE: &str = "un_log.txt";

/// Logging section of the TOML config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional diagnostic log file (in addition to stderr)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_file: None,
        }
    }
}

/// On-disk TOML configuration; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_lookups: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_pool_retry_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yt_dlp_path: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Fully resolved runtime configuration for the listener service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub data_folder: PathBuf,
    pub token: String,
    pub ports: Vec<u16>,
    pub bind_host: String,
    pub handshake_timeout: Duration,
    pub lookup_attempts: u32,
    pub lookup_backoff: Duration,
    /// Upper bound for one metadata tool invocation
    pub lookup_timeout: Duration,
    pub max_concurrent_lookups: usize,
    pub restart_delay: Duration,
    pub empty_pool_retry: Duration,
    /// Zero disables keepalive pings
    pub keepalive: Duration,
    pub yt_dlp_path: PathBuf,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Apply compiled defaults to a (possibly empty) TOML config
    pub fn from_toml(toml: TomlConfig) -> Self {
        Self {
            data_folder: toml.data_folder.unwrap_or_else(default_data_folder),
            token: toml.token.unwrap_or_else(|| DEFAULT_TOKEN.to_string()),
            ports: toml
                .ports
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_PORTS.to_vec()),
            bind_host: toml
                .bind_host
                .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            handshake_timeout: Duration::from_secs(
                toml.handshake_timeout_secs
                    .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            ),
            lookup_attempts: toml
                .lookup_attempts
                .unwrap_or(DEFAULT_LOOKUP_ATTEMPTS)
                .max(1),
            lookup_backoff: Duration::from_millis(
                toml.lookup_backoff_ms.unwrap_or(DEFAULT_LOOKUP_BACKOFF_MS),
            ),
            lookup_timeout: Duration::from_secs(
                toml.lookup_timeout_secs.unwrap_or(DEFAULT_LOOKUP_TIMEOUT_SECS),
            ),
            max_concurrent_lookups: toml
                .max_concurrent_lookups
                .unwrap_or(DEFAULT_MAX_CONCURRENT_LOOKUPS),
            restart_delay: Duration::from_millis(
                toml.restart_delay_ms.unwrap_or(DEFAULT_RESTART_DELAY_MS),
            ),
            empty_pool_retry: Duration::from_secs(
                toml.empty_pool_retry_secs
                    .unwrap_or(DEFAULT_EMPTY_POOL_RETRY_SECS),
            ),
            keepalive: Duration::from_secs(toml.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS)),
            yt_dlp_path: toml
                .yt_dlp_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP)),
            logging: toml.logging,
        }
    }

    /// Fully populated TOML form of this config (for `--write-config`)
    pub fn to_toml(&self) -> TomlConfig {
        TomlConfig {
            data_folder: Some(self.data_folder.clone()),
            token: Some(self.token.clone()),
            ports: Some(self.ports.clone()),
            bind_host: Some(self.bind_host.clone()),
            handshake_timeout_secs: Some(self.handshake_timeout.as_secs()),
            lookup_attempts: Some(self.lookup_attempts),
            lookup_backoff_ms: Some(self.lookup_backoff.as_millis() as u64),
            lookup_timeout_secs: Some(self.lookup_timeout.as_secs()),
            max_concurrent_lookups: Some(self.max_concurrent_lookups),
            restart_delay_ms: Some(self.restart_delay.as_millis() as u64),
            empty_pool_retry_secs: Some(self.empty_pool_retry.as_secs()),
            keepalive_secs: Some(self.keepalive.as_secs()),
            yt_dlp_path: Some(self.yt_dlp_path.clone()),
            logging: self.logging.clone(),
        }
    }

    /// Path of the music bucket log
    pub fn music_log_path(&self) -> PathBuf {
        self.data_folder.join(MUSIC_LOG_FILE)
    }

    /// Path of the non-music bucket log
    pub fn non_music_log_path(&self) -> PathBuf {
        self.data_folder.join(NON_MUSIC_LOG_FILE)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::Config("token must not be empty".to_string()));
        }
        if self.ports.iter().any(|&p| p == 0) {
            return Err(Error::Config("port 0 is not allowed".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.ports.iter().find(|p| !seen.insert(**p)) {
            return Err(Error::Config(format!("duplicate port {}", dup)));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config(
                "handshake_timeout_secs must be positive".to_string(),
            ));
        }
        if self.lookup_timeout.is_zero() {
            return Err(Error::Config(
                "lookup_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_concurrent_lookups == 0 {
            return Err(Error::Config(
                "max_concurrent_lookups must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default())
    }
}

/// Resolve the config file path: CLI argument, then environment, then platform default
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    default_config_path()
}

/// Platform default config file: `<config dir>/tabsort/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tabsort").join("config.toml"))
}

/// OS-dependent default data folder
pub fn default_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tabsort"))
        .unwrap_or_else(|| PathBuf::from("./tabsort_data"))
}

/// Load a TOML config file; a missing file yields defaults with a warning
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!("Config file not found at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Write a TOML config file, creating parent directories as needed
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Data folder priority: CLI argument, environment, TOML, compiled default
pub fn resolve_data_folder(cli_arg: Option<&Path>, toml: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(DATA_FOLDER_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    toml.data_folder.clone().unwrap_or_else(default_data_folder)
}

/// Create the data folder if it is missing
pub fn ensure_data_folder(path: &Path) -> Result<()> {
    if !path.exists() {
        info!("Creating data folder: {}", path.display());
        std::fs::create_dir_all(path)?;
    } else if !path.is_dir() {
        return Err(Error::Config(format!(
            "data folder {} exists but is not a directory",
            path.display()
        )));
    }
    Ok(())
}
