//! Bundle metadata.
//!
//! A bundle is a directory holding one versioned installable unit of an
//! application. Its identity lives in `Contents/Info.json`:
//!
//! ```json
//! {
//!   "identifier": "com.example.app",
//!   "name": "Example",
//!   "version": "1207",
//!   "display_version": "2.4.1",
//!   "public_ed_key": "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"
//! }
//! ```
//!
//! `public_ed_key_file` may name a file under `Contents/Resources` holding the
//! hex key instead of embedding it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BundleError;

/// Directory inside a bundle that holds its metadata.
pub const CONTENTS_DIR: &str = "Contents";
/// Metadata file name inside [`CONTENTS_DIR`].
pub const INFO_FILE: &str = "Info.json";
/// Legacy signature file name inside [`CONTENTS_DIR`].
pub const SIGNATURE_FILE: &str = "_UpdateSignature";
/// Resources directory inside [`CONTENTS_DIR`].
pub const RESOURCES_DIR: &str = "Resources";

/// Read-only view over a bundle's identity.
///
/// Implemented by [`BundleReference`]; other providers (for example a host
/// application that keeps its metadata elsewhere) can implement it to feed
/// the verifier.
pub trait BundleMetadata {
    /// Stable identifier shared by every version of the application.
    fn identifier(&self) -> &str;
    /// Raw, signer-assigned version string.
    fn version(&self) -> &str;
    /// Location of the bundle directory.
    fn path(&self) -> &Path;
    /// Embedded Ed25519 public key, if any.
    fn public_key_material(&self) -> Option<&[u8]>;
}

/// On-disk form of `Contents/Info.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleInfo {
    /// Stable application identifier
    pub identifier: String,
    /// Human-readable name (defaults to the directory stem)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw version string
    pub version: String,
    /// Version shown to users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_version: Option<String>,
    /// Hex-encoded Ed25519 public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ed_key: Option<String>,
    /// File under `Contents/Resources` holding the hex public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ed_key_file: Option<String>,
}

impl BundleInfo {
    /// Create metadata with the required fields.
    pub fn new(identifier: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            version: version.into(),
            display_version: None,
            public_ed_key: None,
            public_ed_key_file: None,
        }
    }

    /// Write this metadata into `bundle/Contents/Info.json`.
    pub fn write_to(&self, bundle: &Path) -> Result<(), BundleError> {
        let contents = bundle.join(CONTENTS_DIR);
        fs::create_dir_all(&contents)?;
        let json = serde_json::to_string_pretty(self).map_err(|source| BundleError::InvalidInfo {
            path: contents.join(INFO_FILE),
            source,
        })?;
        fs::write(contents.join(INFO_FILE), json)?;
        Ok(())
    }
}

/// Identity of an installed or candidate bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReference {
    identifier: String,
    name: String,
    version: String,
    display_version: String,
    path: PathBuf,
    public_key: Option<Vec<u8>>,
}

impl BundleReference {
    /// Load a bundle's metadata from disk.
    ///
    /// # Errors
    ///
    /// Fails if `path` is not a directory, has no readable `Contents/Info.json`,
    /// the identifier or version is empty, or the public key is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BundleError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(BundleError::NotADirectory(path.to_path_buf()));
        }

        let info_path = info_path(path);
        let raw = match fs::read(&info_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::MissingInfo(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let info: BundleInfo = serde_json::from_slice(&raw).map_err(|source| {
            BundleError::InvalidInfo {
                path: info_path.clone(),
                source,
            }
        })?;

        if info.identifier.trim().is_empty() {
            return Err(BundleError::EmptyField {
                path: info_path,
                field: "identifier",
            });
        }
        if info.version.trim().is_empty() {
            return Err(BundleError::EmptyField {
                path: info_path,
                field: "version",
            });
        }

        let public_key = load_public_key(path, &info)?;
        let name = info.name.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| info.identifier.clone())
        });
        let display_version = info
            .display_version
            .clone()
            .unwrap_or_else(|| info.version.clone());

        debug!(
            identifier = %info.identifier,
            version = %info.version,
            path = %path.display(),
            has_public_key = public_key.is_some(),
            "Loaded bundle metadata"
        );

        Ok(Self {
            identifier: info.identifier,
            name,
            version: info.version,
            display_version,
            path: path.to_path_buf(),
            public_key,
        })
    }

    /// Locate and load the bundle enclosing the running executable.
    pub fn for_current_executable() -> Result<Self, BundleError> {
        let exe = std::env::current_exe()?;
        let bundle = enclosing_bundle(&exe).ok_or_else(|| BundleError::NotInBundle(exe.clone()))?;
        Self::load(bundle)
    }

    /// Human-readable application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version shown to users.
    pub fn display_version(&self) -> &str {
        &self.display_version
    }

    /// Whether this bundle carries a public key.
    pub fn has_public_key(&self) -> bool {
        self.public_key.is_some()
    }

    /// File extension of the bundle directory (e.g. `app`), if any.
    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }
}

impl BundleMetadata for BundleReference {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn public_key_material(&self) -> Option<&[u8]> {
        self.public_key.as_deref()
    }
}

/// Whether `path` looks like a bundle (a directory with `Contents/Info.json`).
pub fn is_bundle(path: &Path) -> bool {
    path.is_dir() && info_path(path).is_file()
}

/// Path to the legacy signature file inside a bundle.
pub fn signature_path(bundle: &Path) -> PathBuf {
    bundle.join(CONTENTS_DIR).join(SIGNATURE_FILE)
}

/// Walk up from `path` to the nearest enclosing bundle directory.
pub fn enclosing_bundle(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .find(|ancestor| is_bundle(ancestor))
        .map(Path::to_path_buf)
}

fn info_path(bundle: &Path) -> PathBuf {
    bundle.join(CONTENTS_DIR).join(INFO_FILE)
}

fn load_public_key(bundle: &Path, info: &BundleInfo) -> Result<Option<Vec<u8>>, BundleError> {
    let encoded = match (&info.public_ed_key, &info.public_ed_key_file) {
        (Some(key), _) => key.trim().to_string(),
        (None, Some(file)) => {
            let key_path = bundle.join(CONTENTS_DIR).join(RESOURCES_DIR).join(file);
            fs::read_to_string(&key_path)
                .map_err(|e| BundleError::InvalidPublicKey {
                    path: bundle.to_path_buf(),
                    reason: format!("cannot read {}: {}", key_path.display(), e),
                })?
                .trim()
                .to_string()
        }
        (None, None) => return Ok(None),
    };

    let bytes = hex::decode(&encoded).map_err(|e| BundleError::InvalidPublicKey {
        path: bundle.to_path_buf(),
        reason: e.to_string(),
    })?;
    if bytes.len() != ed25519_dalek::PUBLIC_KEY_LENGTH {
        return Err(BundleError::InvalidPublicKey {
            path: bundle.to_path_buf(),
            reason: format!(
                "expected {} bytes, got {}",
                ed25519_dalek::PUBLIC_KEY_LENGTH,
                bytes.len()
            ),
        });
    }
    Ok(Some(bytes))
}
