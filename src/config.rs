//! Configuration management for Writing Center.
//!
//! This module handles loading and saving application configuration to/from
//! a JSON file. The config directory can be customized.
//!
//! Sections:
//! - database_file: SQLite database location
//! - server: HTTP API bind address
//! - drive: Google Drive endpoints, timeouts and retry policy

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WritingError, WritingResult};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Google Drive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Base URL of the Drive v3 metadata API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Base URL of the Drive v3 media upload API
    #[serde(default = "default_upload_base_url")]
    pub upload_base_url: String,
    /// OAuth token endpoint used for refresh-token exchange
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    /// Name of the per-user root folder created on first sync
    #[serde(default = "default_root_folder_name")]
    pub root_folder_name: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Extra attempts for transient failures (0 disables retry)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff between retries, doubled on each attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Tokens expiring within this many seconds are refreshed up front
    #[serde(default = "default_token_expiry_skew_secs")]
    pub token_expiry_skew_secs: i64,
}

fn default_api_base_url() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_upload_base_url() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_root_folder_name() -> String {
    "Writing Center Documents".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_token_expiry_skew_secs() -> i64 {
    60
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            upload_base_url: default_upload_base_url(),
            token_uri: default_token_uri(),
            root_folder_name: default_root_folder_name(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            token_expiry_skew_secs: default_token_expiry_skew_secs(),
        }
    }
}

impl DriveConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Point every endpoint at a single base URL (local emulators, tests)
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            api_base_url: format!("{}/drive/v3", base),
            upload_base_url: format!("{}/upload/drive/v3", base),
            token_uri: format!("{}/token", base),
            retry_backoff_ms: 1,
            ..Self::default()
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub drive: DriveConfig,
}

impl ConfigData {
    fn with_defaults_in(config_dir: &Path) -> Self {
        Self {
            database_file: config_dir
                .join("writing_center.db")
                .to_string_lossy()
                .to_string(),
            ..Self::default()
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// Without an explicit `config_dir` the platform config directory is used.
    pub fn new(config_dir: Option<PathBuf>) -> WritingResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .ok_or_else(|| {
                    WritingError::Config("could not determine the config directory".to_string())
                })?
                .join("writing-center"),
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let data = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            match serde_json::from_str::<ConfigData>(&content) {
                Ok(mut data) => {
                    if data.database_file.is_empty() {
                        data.database_file = ConfigData::with_defaults_in(&config_dir).database_file;
                    }
                    data
                }
                Err(e) => {
                    tracing::warn!(
                        path = %config_file.display(),
                        error = %e,
                        "Config file is not valid JSON, using defaults"
                    );
                    ConfigData::with_defaults_in(&config_dir)
                }
            }
        } else {
            ConfigData::with_defaults_in(&config_dir)
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> WritingResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    pub fn server(&self) -> &ServerConfig {
        &self.data.server
    }

    pub fn drive(&self) -> &DriveConfig {
        &self.data.drive
    }

    /// Set the server port
    pub fn set_server_port(&mut self, port: u16) -> WritingResult<()> {
        self.data.server.port = port;
        self.save()
    }

    /// Replace the Drive section
    pub fn set_drive(&mut self, drive: DriveConfig) -> WritingResult<()> {
        self.data.drive = drive;
        self.save()
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "server.host" => Some(self.data.server.host.clone()),
            "server.port" => Some(self.data.server.port.to_string()),
            "drive.root_folder_name" => Some(self.data.drive.root_folder_name.clone()),
            "drive.max_retries" => Some(self.data.drive.max_retries.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> WritingResult<()> {
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "server.host" => self.data.server.host = value.to_string(),
            "server.port" => {
                self.data.server.port = value
                    .parse()
                    .map_err(|_| WritingError::Config(format!("Invalid port: {}", value)))?
            }
            "drive.root_folder_name" => {
                if value.trim().is_empty() {
                    return Err(WritingError::validation(
                        "drive.root_folder_name",
                        "cannot be empty",
                    ));
                }
                self.data.drive.root_folder_name = value.to_string()
            }
            "drive.max_retries" => {
                self.data.drive.max_retries = value.parse().map_err(|_| {
                    WritingError::Config(format!("Invalid retry count: {}", value))
                })?
            }
            _ => return Err(WritingError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}
