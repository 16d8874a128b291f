//! Configuration structures for the installer.
//!
//! Defines downgrade policy, trust settings, staging behavior and the
//! authorization prompt.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid TOML for this schema
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A public key entry is malformed
    #[error("invalid public key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
}

/// Main installer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Accept candidates that are older than or equal to the installed version
    #[serde(default)]
    pub allow_downgrades: bool,

    /// Trust configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Staging and swap configuration
    #[serde(default)]
    pub staging: StagingConfig,

    /// Administrator authorization configuration
    #[serde(default)]
    pub authorization: AuthorizationConfig,
}

impl InstallerConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Trust configuration for candidate verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Refuse the legacy key path; only platform code signatures are accepted
    #[serde(default)]
    pub require_platform_signature: bool,

    /// Extra Ed25519 public keys trusted alongside the host's own key, for
    /// key rotation.
    /// Format: "ed25519:<hex_public_key>"
    #[serde(default)]
    pub additional_public_keys: Vec<String>,
}

impl SecurityConfig {
    /// Parse the additional keys into Ed25519 verifying keys.
    pub fn parse_additional_keys(&self) -> Result<Vec<ed25519_dalek::VerifyingKey>, ConfigError> {
        self.additional_public_keys
            .iter()
            .map(|key| parse_ed25519_key(key))
            .collect()
    }
}

/// Staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Where downloaded updates are extracted (empty = per-user cache directory)
    #[serde(default)]
    pub update_folder: Option<PathBuf>,

    /// Where replaced bundles are moved (empty = platform trash)
    #[serde(default)]
    pub trash_dir: Option<PathBuf>,

    /// Install under the host's name rather than keeping the destination name
    #[serde(default)]
    pub normalize_installed_name: bool,

    /// Delete the source folder after a successful install
    #[serde(default = "default_true")]
    pub remove_source_after_install: bool,

    /// Clear the macOS quarantine attribute from the installed bundle
    #[serde(default = "default_true")]
    pub clear_quarantine: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            update_folder: None,
            trash_dir: None,
            normalize_installed_name: false,
            remove_source_after_install: true,
            clear_quarantine: true,
        }
    }
}

/// Administrator authorization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Message shown in the authorization prompt
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_prompt() -> String {
    "An update needs administrator permission to be installed.".to_string()
}

/// Parse an Ed25519 public key from string format.
///
/// Supports `ed25519:<hex_encoded_32_bytes>`. A bare hex string is also
/// accepted.
pub fn parse_ed25519_key(s: &str) -> Result<ed25519_dalek::VerifyingKey, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidKey {
        key: s.to_string(),
        reason,
    };

    let hex_str = s.trim();
    let hex_str = hex_str.strip_prefix("ed25519:").unwrap_or(hex_str);
    if hex_str.contains(':') {
        return Err(invalid("key must start with 'ed25519:'".to_string()));
    }

    let bytes = hex::decode(hex_str).map_err(|e| invalid(format!("invalid hex: {}", e)))?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| invalid("Ed25519 public key must be 32 bytes".to_string()))?;

    ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| invalid(format!("invalid Ed25519 public key: {}", e)))
}
