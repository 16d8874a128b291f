//! Ed25519 signing keys for legacy bundle signatures
//!
//! A private key file holds the 32-byte seed, hex encoded, on one line.
//! Public keys are printed in the `ed25519:<hex>` form accepted by the
//! `[security] additional_public_keys` setting.

use std::fs;
use std::io::Write;
use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use thiserror::Error;

/// Key file errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key data: {0}")]
    InvalidKeyData(String),

    #[error("Key file already exists: {0}")]
    AlreadyExists(String),
}

/// Generate a fresh signing key from the OS random source.
pub fn generate_signing_key() -> SigningKey {
    let mut rng = rand_core::OsRng;
    SigningKey::generate(&mut rng)
}

/// Read a signing key seed from `path`.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, KeyError> {
    let contents = fs::read_to_string(path)?;
    let seed_bytes = hex::decode(contents.trim())
        .map_err(|e| KeyError::InvalidKeyData(format!("Invalid key hex: {e}")))?;

    let seed: [u8; 32] = seed_bytes.try_into().map_err(|bytes: Vec<u8>| {
        KeyError::InvalidKeyData(format!(
            "Invalid key length: expected 32, got {}",
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Write a signing key seed to `path`, refusing to overwrite.
pub fn save_signing_key(key: &SigningKey, path: &Path) -> Result<(), KeyError> {
    if path.exists() {
        return Err(KeyError::AlreadyExists(path.display().to_string()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Write atomically using a temp file
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(hex::encode(key.to_bytes()).as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Public key in `ed25519:<hex>` form.
pub fn public_key_string(key: &VerifyingKey) -> String {
    format!("ed25519:{}", hex::encode(key.to_bytes()))
}
