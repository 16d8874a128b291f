//! Candidate bundle verification.
//!
//! A candidate is trusted when either
//!
//! 1. the platform code-signing mechanism reports a signing identity for both
//!    the candidate and the running application, and the identities match; or
//! 2. no such identity decides the question, and a legacy Ed25519 signature
//!    over the candidate's canonical content digest validates against the
//!    running application's public key (or a configured rotation key).
//!
//! Verification never succeeds by default: when neither mechanism is
//! available the result is [`VerificationFailure::AnchorUnavailable`].
//!
//! # Canonical digest
//!
//! The digest is SHA-256 over every entry below the bundle root, visited in
//! a deterministic order (siblings sorted by file name). Each entry
//! contributes a type tag, its relative path and
//!
//! - for files: length, executable bit and contents
//! - for symlinks: the link target
//!
//! `Contents/_UpdateSignature` is excluded so the signature can live inside
//! the bundle it signs.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path};
use std::process::Command;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::bundle::{self, BundleMetadata, CONTENTS_DIR, SIGNATURE_FILE};
use crate::config::{ConfigError, SecurityConfig};
use crate::error::VerificationFailure;

/// Buffer size for hashing file contents.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Identity reported by the platform code-signing mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SigningIdentity {
    /// Developer team identifier, when the platform reports one
    pub team_identifier: Option<String>,
    /// Certificate chain, leaf first
    pub authorities: Vec<String>,
}

impl SigningIdentity {
    /// Whether two identities were produced by the same signer.
    ///
    /// Team identifiers decide when both sides have one; otherwise the full
    /// authority chains must be equal and non-empty.
    pub fn same_signer(&self, other: &SigningIdentity) -> bool {
        match (&self.team_identifier, &other.team_identifier) {
            (Some(a), Some(b)) => a == b,
            _ => !self.authorities.is_empty() && self.authorities == other.authorities,
        }
    }

    /// Short label for logs: the team identifier or the leaf authority.
    pub fn describe(&self) -> String {
        match (&self.team_identifier, self.authorities.first()) {
            (Some(team), _) => team.clone(),
            (None, Some(leaf)) => leaf.clone(),
            (None, None) => "ad-hoc signature".to_string(),
        }
    }
}

/// Platform code-signing check.
pub trait CodeSigningVerifier: Send + Sync {
    /// Signing identity of the bundle at `path`.
    ///
    /// Returns `Ok(None)` when the bundle is not signed at all, and an error
    /// when a signature is present but broken.
    fn signing_identity(&self, path: &Path) -> Result<Option<SigningIdentity>, VerificationFailure>;

    /// Get a description of this verifier for logging.
    fn description(&self) -> &str;
}

/// Verifier for platforms without a code-signing mechanism.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCodeSigning;

impl CodeSigningVerifier for NoCodeSigning {
    fn signing_identity(&self, _path: &Path) -> Result<Option<SigningIdentity>, VerificationFailure> {
        Ok(None)
    }

    fn description(&self) -> &str {
        "none"
    }
}

/// macOS `codesign` verifier.
///
/// Runs `codesign --verify --deep --strict`, then reads the team identifier
/// and authority chain from `codesign -dv --verbose=4`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codesign;

impl CodeSigningVerifier for Codesign {
    fn signing_identity(&self, path: &Path) -> Result<Option<SigningIdentity>, VerificationFailure> {
        let verify_output = Command::new("codesign")
            .args(["--verify", "--deep", "--strict"])
            .arg(path)
            .output()
            .map_err(|e| {
                VerificationFailure::SignatureInvalid(format!("failed to run codesign: {}", e))
            })?;

        if !verify_output.status.success() {
            let stderr = String::from_utf8_lossy(&verify_output.stderr);
            if stderr.contains("not signed at all") {
                debug!(path = %path.display(), "Bundle has no code signature");
                return Ok(None);
            }
            return Err(VerificationFailure::SignatureInvalid(format!(
                "codesign verification failed: {}",
                stderr.trim()
            )));
        }

        let display_output = Command::new("codesign")
            .args(["-dv", "--verbose=4"])
            .arg(path)
            .output()
            .map_err(|e| {
                VerificationFailure::SignatureInvalid(format!(
                    "failed to get signature details: {}",
                    e
                ))
            })?;

        // codesign writes the details to stderr
        let identity = parse_codesign_details(&String::from_utf8_lossy(&display_output.stderr));
        debug!(
            path = %path.display(),
            team_identifier = ?identity.team_identifier,
            authorities = identity.authorities.len(),
            "Read code signing identity"
        );
        Ok(Some(identity))
    }

    fn description(&self) -> &str {
        "macOS codesign"
    }
}

fn parse_codesign_details(details: &str) -> SigningIdentity {
    let mut identity = SigningIdentity::default();
    for line in details.lines() {
        if let Some(team) = line.strip_prefix("TeamIdentifier=") {
            let team = team.trim();
            if team != "not set" && !team.is_empty() {
                identity.team_identifier = Some(team.to_string());
            }
        } else if let Some(authority) = line.strip_prefix("Authority=") {
            identity.authorities.push(authority.trim().to_string());
        }
    }
    identity
}

/// The code-signing verifier for the current platform.
pub fn platform_verifier() -> Arc<dyn CodeSigningVerifier> {
    if cfg!(target_os = "macos") {
        Arc::new(Codesign)
    } else {
        Arc::new(NoCodeSigning)
    }
}

/// How a verified candidate was trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPath {
    /// Candidate and host share a platform signing identity
    CodeSigning(SigningIdentity),
    /// Legacy Ed25519 signature validated against this key
    LegacyKey(VerifyingKey),
}

/// Result of verifying a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Candidate is authentic
    Verified(TrustPath),
    /// Candidate must not be installed
    Failed(VerificationFailure),
}

impl VerificationOutcome {
    /// Whether the candidate was verified.
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationOutcome::Verified(_))
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> Result<TrustPath, VerificationFailure> {
        match self {
            VerificationOutcome::Verified(path) => Ok(path),
            VerificationOutcome::Failed(failure) => Err(failure),
        }
    }
}

/// Validates candidate bundles against the running application.
///
/// # Example
///
/// ```ignore
/// let verifier = SignatureVerifier::new();
/// let outcome = verifier.verify(&candidate, &host);
/// if let VerificationOutcome::Failed(reason) = outcome {
///     return Err(reason.into());
/// }
/// ```
#[derive(Clone)]
pub struct SignatureVerifier {
    platform: Arc<dyn CodeSigningVerifier>,
    additional_keys: Vec<VerifyingKey>,
    require_platform_signature: bool,
}

impl SignatureVerifier {
    /// Create a verifier using the platform code-signing mechanism and no
    /// additional keys.
    pub fn new() -> Self {
        Self::with_platform(platform_verifier())
    }

    /// Create a verifier with a specific code-signing mechanism.
    pub fn with_platform(platform: Arc<dyn CodeSigningVerifier>) -> Self {
        Self {
            platform,
            additional_keys: Vec::new(),
            require_platform_signature: false,
        }
    }

    /// Create a verifier from configuration.
    pub fn from_config(
        platform: Arc<dyn CodeSigningVerifier>,
        config: &SecurityConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self::with_platform(platform)
            .with_additional_keys(config.parse_additional_keys()?)
            .require_platform_signature(config.require_platform_signature))
    }

    /// Trust these keys in addition to the host's own key.
    pub fn with_additional_keys(mut self, keys: Vec<VerifyingKey>) -> Self {
        self.additional_keys = keys;
        self
    }

    /// Disable the legacy key path.
    pub fn require_platform_signature(mut self, required: bool) -> Self {
        self.require_platform_signature = required;
        self
    }

    /// Description of the platform mechanism, for logging.
    pub fn platform_description(&self) -> &str {
        self.platform.description()
    }

    /// Verify `candidate` against `anchor`, reading any legacy signature from
    /// the candidate bundle itself.
    pub fn verify(&self, candidate: &dyn BundleMetadata, anchor: &dyn BundleMetadata) -> VerificationOutcome {
        self.verify_with_signature(candidate, anchor, None)
    }

    /// Verify `candidate` against `anchor`.
    ///
    /// `feed_signature` is the hex legacy signature carried by the update
    /// feed; when absent, `Contents/_UpdateSignature` inside the candidate
    /// is used. Neither bundle is modified.
    pub fn verify_with_signature(
        &self,
        candidate: &dyn BundleMetadata,
        anchor: &dyn BundleMetadata,
        feed_signature: Option<&str>,
    ) -> VerificationOutcome {
        match self.check(candidate, anchor, feed_signature) {
            Ok(trust) => {
                info!(
                    candidate = %candidate.path().display(),
                    trust = trust_label(&trust),
                    "Update signature verified"
                );
                VerificationOutcome::Verified(trust)
            }
            Err(failure) => {
                warn!(
                    candidate = %candidate.path().display(),
                    error = %failure,
                    "Update signature verification failed"
                );
                VerificationOutcome::Failed(failure)
            }
        }
    }

    fn check(
        &self,
        candidate: &dyn BundleMetadata,
        anchor: &dyn BundleMetadata,
        feed_signature: Option<&str>,
    ) -> Result<TrustPath, VerificationFailure> {
        if !bundle::is_bundle(candidate.path()) {
            return Err(VerificationFailure::MalformedBundle(format!(
                "{} is not a bundle",
                candidate.path().display()
            )));
        }
        if candidate.identifier() != anchor.identifier() {
            return Err(VerificationFailure::IdentityMismatch {
                expected: anchor.identifier().to_string(),
                found: candidate.identifier().to_string(),
            });
        }

        let host_identity = match self.platform.signing_identity(anchor.path()) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(
                    host = %anchor.path().display(),
                    error = %e,
                    "Host code signature is not valid, ignoring it"
                );
                None
            }
        };
        let candidate_identity = self.platform.signing_identity(candidate.path())?;

        match (&host_identity, &candidate_identity) {
            (Some(host), Some(update)) => {
                return if host.same_signer(update) {
                    Ok(TrustPath::CodeSigning(update.clone()))
                } else {
                    Err(VerificationFailure::IdentityMismatch {
                        expected: host.describe(),
                        found: update.describe(),
                    })
                };
            }
            (Some(host), None) if self.require_platform_signature => {
                return Err(VerificationFailure::IdentityMismatch {
                    expected: host.describe(),
                    found: "unsigned".to_string(),
                });
            }
            (None, _) if self.require_platform_signature => {
                return Err(VerificationFailure::AnchorUnavailable);
            }
            (Some(_), None) => {
                debug!("Host is code signed but the update is not, using the legacy key");
            }
            _ => {}
        }

        self.check_legacy(candidate, anchor, feed_signature)
    }

    fn check_legacy(
        &self,
        candidate: &dyn BundleMetadata,
        anchor: &dyn BundleMetadata,
        feed_signature: Option<&str>,
    ) -> Result<TrustPath, VerificationFailure> {
        let mut keys = Vec::with_capacity(self.additional_keys.len() + 1);
        if let Some(material) = anchor.public_key_material() {
            match verifying_key_from_bytes(material) {
                Some(key) => keys.push(key),
                None => warn!(host = %anchor.path().display(), "Host public key is not a valid Ed25519 key"),
            }
        }
        keys.extend(self.additional_keys.iter().copied());
        if keys.is_empty() {
            return Err(VerificationFailure::AnchorUnavailable);
        }

        let encoded = match feed_signature {
            Some(signature) => signature.to_string(),
            None => read_bundle_signature(candidate.path())?
                .ok_or(VerificationFailure::SignatureMissing)?,
        };
        let signature = decode_signature(&encoded)?;
        let digest = bundle_digest(candidate.path())?;

        keys.into_iter()
            .find(|key| key.verify_strict(&digest, &signature).is_ok())
            .map(TrustPath::LegacyKey)
            .ok_or_else(|| {
                VerificationFailure::SignatureInvalid(
                    "signature does not match any trusted key".to_string(),
                )
            })
    }
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("platform", &self.platform.description())
            .field("additional_keys", &self.additional_keys.len())
            .field("require_platform_signature", &self.require_platform_signature)
            .finish()
    }
}

fn trust_label(trust: &TrustPath) -> &'static str {
    match trust {
        TrustPath::CodeSigning(_) => "code_signing",
        TrustPath::LegacyKey(_) => "legacy_key",
    }
}

fn verifying_key_from_bytes(material: &[u8]) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = material.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn decode_signature(encoded: &str) -> Result<Signature, VerificationFailure> {
    let bytes = hex::decode(encoded.trim()).map_err(|e| {
        VerificationFailure::SignatureInvalid(format!("signature is not valid hex: {}", e))
    })?;
    let bytes: [u8; 64] = bytes.try_into().map_err(|_| {
        VerificationFailure::SignatureInvalid("signature must be 64 bytes".to_string())
    })?;
    Ok(Signature::from_bytes(&bytes))
}

/// Read the legacy signature stored inside a bundle, if any.
pub fn read_bundle_signature(bundle: &Path) -> Result<Option<String>, VerificationFailure> {
    match std::fs::read_to_string(bundle::signature_path(bundle)) {
        Ok(s) if s.trim().is_empty() => Ok(None),
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VerificationFailure::MalformedBundle(format!(
            "cannot read signature file: {}",
            e
        ))),
    }
}

/// Compute the canonical content digest of a bundle.
///
/// # Errors
///
/// Returns [`VerificationFailure::MalformedBundle`] if any entry cannot be
/// read.
pub fn bundle_digest(bundle: &Path) -> Result<[u8; 32], VerificationFailure> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    for entry in WalkDir::new(bundle)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(malformed)?;
        let relative = entry.path().strip_prefix(bundle).map_err(malformed)?;
        if is_signature_file(relative) {
            continue;
        }
        let relative = portable_path(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(malformed)?;
            hasher.update(b"l");
            hash_str(&mut hasher, &relative);
            hash_str(&mut hasher, &target.to_string_lossy());
        } else if file_type.is_dir() {
            hasher.update(b"d");
            hash_str(&mut hasher, &relative);
        } else {
            let metadata = entry.metadata().map_err(malformed)?;
            hasher.update(b"f");
            hash_str(&mut hasher, &relative);
            hasher.update(metadata.len().to_le_bytes());
            hasher.update([u8::from(is_executable(&metadata))]);

            let mut file = File::open(entry.path()).map_err(malformed)?;
            loop {
                let n = file.read(&mut buffer).map_err(malformed)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
        }
    }

    Ok(hasher.finalize().into())
}

fn malformed(e: impl std::fmt::Display) -> VerificationFailure {
    VerificationFailure::MalformedBundle(e.to_string())
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn portable_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_signature_file(relative: &Path) -> bool {
    relative == Path::new(CONTENTS_DIR).join(SIGNATURE_FILE)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Sign a bundle's canonical digest, returning the hex signature.
pub fn sign_bundle(signing_key: &SigningKey, bundle: &Path) -> Result<String, VerificationFailure> {
    let digest = bundle_digest(bundle)?;
    Ok(hex::encode(signing_key.sign(&digest).to_bytes()))
}

/// Sign a bundle and store the signature in `Contents/_UpdateSignature`.
pub fn write_bundle_signature(
    signing_key: &SigningKey,
    bundle: &Path,
) -> Result<String, VerificationFailure> {
    let signature = sign_bundle(signing_key, bundle)?;
    std::fs::write(bundle::signature_path(bundle), &signature).map_err(|e| {
        VerificationFailure::MalformedBundle(format!("cannot write signature file: {}", e))
    })?;
    Ok(signature)
}
