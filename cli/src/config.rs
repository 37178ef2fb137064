// Configuration management for the Courier CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/courier/config.json
// - Linux: ~/.config/courier/config.json
// - Windows: %APPDATA%\courier\config.json

use anyhow::{Context, Result};
use courier_core::{DispatchConfig, DispatchMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// JSON snapshot replaced atomically on each send
    File,
    /// Single-key snapshot in a sled database
    Sled,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(StorageBackend::File),
            "sled" => Ok(StorageBackend::Sled),
            other => anyhow::bail!("Unknown storage backend: {} (expected file or sled)", other),
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::File => f.write_str("file"),
            StorageBackend::Sled => f.write_str("sled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage path for messages, accounts and groups
    pub storage_path: Option<String>,

    /// Where the message log is kept
    pub backend: StorageBackend,

    /// Address the server binds to
    pub listen_address: String,

    /// Port the server listens on
    pub listen_port: u16,

    /// Directory for rolling log files (stderr only when unset)
    pub log_dir: Option<String>,

    /// Delivery handler settings
    pub dispatch: DispatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: None,
            backend: StorageBackend::File,
            listen_address: "0.0.0.0".to_string(),
            listen_port: 6543,
            log_dir: None,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("courier");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the default data directory path (cross-platform)
    pub fn default_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("courier");
        Ok(data_dir)
    }

    /// Data directory honoring `storage_path`, created if missing
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = match &self.storage_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_data_dir()?,
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value (does not save)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "backend" => {
                self.backend = value.parse()?;
            }
            "listen_address" => {
                self.listen_address = value.to_string();
            }
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "dispatch_mode" => {
                self.dispatch.mode = match value {
                    "inline" => DispatchMode::Inline,
                    "background" => DispatchMode::Background,
                    other => anyhow::bail!(
                        "Invalid dispatch mode: {} (expected inline or background)",
                        other
                    ),
                };
            }
            "slow_handler_ms" => {
                self.dispatch.slow_handler_ms = value.parse().context("Invalid number")?;
            }
            "handler_timeout_ms" => {
                self.dispatch.handler_timeout_ms = value.parse().context("Invalid number")?;
            }
            "drain_timeout_ms" => {
                self.dispatch.drain_timeout_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "storage_path" => self.storage_path.clone(),
            "backend" => Some(self.backend.to_string()),
            "listen_address" => Some(self.listen_address.clone()),
            "listen_port" => Some(self.listen_port.to_string()),
            "log_dir" => self.log_dir.clone(),
            "dispatch_mode" => Some(dispatch_mode_name(self.dispatch.mode).to_string()),
            "slow_handler_ms" => Some(self.dispatch.slow_handler_ms.to_string()),
            "handler_timeout_ms" => Some(self.dispatch.handler_timeout_ms.to_string()),
            "drain_timeout_ms" => Some(self.dispatch.drain_timeout_ms.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("backend".to_string(), self.backend.to_string()),
            ("listen_address".to_string(), self.listen_address.clone()),
            ("listen_port".to_string(), self.listen_port.to_string()),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(stderr)".to_string()),
            ),
            (
                "dispatch_mode".to_string(),
                dispatch_mode_name(self.dispatch.mode).to_string(),
            ),
            (
                "slow_handler_ms".to_string(),
                format!("{}ms", self.dispatch.slow_handler_ms),
            ),
            (
                "handler_timeout_ms".to_string(),
                format!("{}ms", self.dispatch.handler_timeout_ms),
            ),
            (
                "drain_timeout_ms".to_string(),
                format!("{}ms", self.dispatch.drain_timeout_ms),
            ),
        ]
    }
}

fn dispatch_mode_name(mode: DispatchMode) -> &'static str {
    match mode {
        DispatchMode::Inline => "inline",
        DispatchMode::Background => "background",
    }
}
