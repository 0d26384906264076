//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/blockpull/blockpull.toml`
//! - Windows: `%APPDATA%/blockpull/blockpull.toml`
//!
//! A path given with `--config` is used instead and must exist.

use std::path::{Path, PathBuf};

use blockpull_protocol::constants::DEFAULT_PORT;
use blockpull_transfer::{TransferConfig, TransferError};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid transfer settings: {0}")]
    Invalid(#[from] TransferError),
}

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address `send` listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Directory `receive` writes files into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            output_dir: default_output_dir(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `explicit`, or from the platform path.
    ///
    /// A missing platform file is created with defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Some(path) => Self::read(path)?,
            None => {
                let path = config_path();
                if path.exists() {
                    Self::read(&path)?
                } else {
                    let config = Config::default();
                    // A read-only home should not stop a transfer.
                    if let Err(e) = config.save(&path) {
                        tracing::debug!(
                            path = %path.display(),
                            "could not write default config: {e}"
                        );
                    }
                    config
                }
            }
        };
        config.transfer.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("blockpull")
            .join("blockpull.toml")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("blockpull").join("blockpull.toml")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/blockpull/blockpull.toml")
    }
}
