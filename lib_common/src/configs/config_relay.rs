use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use thiserror::Error;

/// Remote directory searched for `dayDDMMYY.dat` files when none is configured.
pub const DEFAULT_REMOTE_DIR: &str = "/CFDisk/mindata/";
const DEFAULT_POLL_INTERVAL: u64 = 300;
const DEFAULT_RETRY_INTERVAL: u64 = 120;
const DEFAULT_LOG_MAX_BYTES: u64 = 1024 * 1024;
const DEFAULT_LOG_BACKUPS: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not open config file {}: {source}", .path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config file {} is not valid JSON: {source}", .path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Incomplete {section} configuration in {}: missing {keys}", .path.display())]
    Incomplete {
        section: &'static str,
        path: PathBuf,
        keys: String,
    },

    #[error("{key} must be at least 1 second, got {value}")]
    InvalidInterval { key: &'static str, value: u64 },
}

/// # Relay Configuration
///
/// Flat key/value settings for the FTP source, the MQTT broker and the loop
/// timing. Keys are upper snake case on disk (`FTP_HOST`, `POLL_INTERVAL`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RelayConfig {
    #[serde(default)]
    pub ftp_host: String,
    #[serde(default)]
    pub ftp_user: String,
    #[serde(default)]
    pub ftp_pass: String,
    #[serde(default)]
    pub local_file: PathBuf,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    #[serde(default)]
    pub mqtt_server: String,
    #[serde(default)]
    pub mqtt_client_id: String,
    #[serde(default)]
    pub mqtt_topic: String,
    #[serde(default)]
    pub mqtt_user: String,
    #[serde(default)]
    pub mqtt_pass: String,

    /// Seconds to sleep after a cycle that discovered and downloaded a file.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds to sleep after a discovery or transfer failure.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,
    #[serde(default = "default_log_backups")]
    pub log_backups: usize,
}

fn default_remote_dir() -> String {
    DEFAULT_REMOTE_DIR.to_string()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL
}

fn default_retry_interval() -> u64 {
    DEFAULT_RETRY_INTERVAL
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_bytes() -> u64 {
    DEFAULT_LOG_MAX_BYTES
}

fn default_log_backups() -> usize {
    DEFAULT_LOG_BACKUPS
}

impl RelayConfig {
    /// Reads, parses and validates the configuration file at `path`.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw, path)
    }

    /// Parses and validates configuration text. `origin` is only used in error messages.
    pub fn from_json(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: RelayConfig =
            serde_json::from_str(raw).map_err(|source| ConfigError::ParseError {
                path: origin.to_path_buf(),
                source,
            })?;
        config.validate(origin)?;
        Ok(config)
    }

    /// Checks that both the FTP and the MQTT sections are usable.
    pub fn validate(&self, origin: &Path) -> Result<(), ConfigError> {
        let mut missing_ftp = Vec::new();
        if self.ftp_host.trim().is_empty() {
            missing_ftp.push("FTP_HOST");
        }
        if self.ftp_user.trim().is_empty() {
            missing_ftp.push("FTP_USER");
        }
        if self.ftp_pass.is_empty() {
            missing_ftp.push("FTP_PASS");
        }
        if self.local_file.as_os_str().is_empty() {
            missing_ftp.push("LOCAL_FILE");
        }
        if !missing_ftp.is_empty() {
            return Err(ConfigError::Incomplete {
                section: "FTP",
                path: origin.to_path_buf(),
                keys: missing_ftp.join(", "),
            });
        }

        let mut missing_mqtt = Vec::new();
        if self.mqtt_server.trim().is_empty() {
            missing_mqtt.push("MQTT_SERVER");
        }
        if self.mqtt_topic.trim().is_empty() {
            missing_mqtt.push("MQTT_TOPIC");
        }
        if !missing_mqtt.is_empty() {
            return Err(ConfigError::Incomplete {
                section: "MQTT",
                path: origin.to_path_buf(),
                keys: missing_mqtt.join(", "),
            });
        }

        if self.poll_interval == 0 {
            return Err(ConfigError::InvalidInterval {
                key: "POLL_INTERVAL",
                value: self.poll_interval,
            });
        }
        if self.retry_interval == 0 {
            return Err(ConfigError::InvalidInterval {
                key: "RETRY_INTERVAL",
                value: self.retry_interval,
            });
        }

        Ok(())
    }
}

impl fmt::Display for RelayConfig {
    /// Secrets are never printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelayConfig
    FTP host: {},
    FTP user: {},
    Remote dir: {},
    Local file: {},
    MQTT server: {},
    MQTT topic: {},
    MQTT client id: {},
    Poll interval: {}s,
    Retry interval: {}s,
    Log file: {}
",
            self.ftp_host,
            self.ftp_user,
            self.remote_dir,
            self.local_file.display(),
            self.mqtt_server,
            self.mqtt_topic,
            if self.mqtt_client_id.is_empty() { "<generated>" } else { self.mqtt_client_id.as_str() },
            self.poll_interval,
            self.retry_interval,
            self.log_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<stdout only>".to_string()),
        )
    }
}
