//! Configuration file support for otaflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (OTAFLASH_*)
//! 3. Local config file (./otaflash.toml)
//! 4. Global config file (~/.config/otaflash/config.toml)
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//! response_timeout_ms = 1000
//!
//! [transfer]
//! inter_byte_delay_us = 10
//! inter_frame_delay_ms = 3
//! ```

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::CliError;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "otaflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Serial device path used when no port index is given.
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// How long to wait for each response, in milliseconds.
    pub response_timeout_ms: Option<u64>,
}

/// Transfer pacing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferConfig {
    /// Pause before each byte, in microseconds.
    pub inter_byte_delay_us: Option<u64>,
    /// Pause after the header and each data chunk, in milliseconds.
    pub inter_frame_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Unreadable or invalid files are skipped with a warning.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike [`load`](Self::load), an explicitly named file must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("invalid config file {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a specific file, if present and valid.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "otaflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set fields in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            transfer,
        } = other;

        if connection.port.is_some() {
            self.connection.port = connection.port;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }
        if connection.response_timeout_ms.is_some() {
            self.connection.response_timeout_ms = connection.response_timeout_ms;
        }

        if transfer.inter_byte_delay_us.is_some() {
            self.transfer.inter_byte_delay_us = transfer.inter_byte_delay_us;
        }
        if transfer.inter_frame_delay_ms.is_some() {
            self.transfer.inter_frame_delay_ms = transfer.inter_frame_delay_ms;
        }
    }
}
