//! Configuration management for updraft-helper
//!
//! The helper reads one TOML file holding the installer settings plus a
//! `[logging]` table.
//!
//! # Configuration File Locations
//!
//! - Linux: `~/.config/updraft/helper.toml`
//! - macOS: `~/Library/Application Support/org.updraft.updraft/helper.toml`
//! - Windows: `%APPDATA%\updraft\updraft\config\helper.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use updraft_install::{ConfigError, InstallerConfig};

/// Helper configuration
///
/// # Example TOML
///
/// ```toml
/// allow_downgrades = false
///
/// [security]
/// require_platform_signature = false
/// additional_public_keys = []
///
/// [staging]
/// normalize_installed_name = false
/// remove_source_after_install = true
/// clear_quarantine = true
///
/// [authorization]
/// prompt = "An update needs administrator permission to be installed."
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Installer settings
    #[serde(flatten)]
    pub installer: InstallerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        match custom_path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        }
    }

    /// Default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "updraft", "updraft")
            .map(|dirs| dirs.config_dir().join("helper.toml"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.installer.security.parse_additional_keys()?;
        Ok(())
    }
}
