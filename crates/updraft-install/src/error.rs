//! Error types for the install core.
//!
//! Every failure an install attempt can surface maps onto a small, closed
//! [`ErrorKind`] so callers can switch on the kind instead of parsing
//! messages.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Closed classification of install failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Zero or several candidate bundles in the update folder
    AmbiguousOrMissingCandidate,
    /// Candidate signature missing, invalid, mismatched, or bundle malformed
    SignatureInvalid,
    /// Neither a platform signing identity nor a public key is available
    SignatureAnchorUnavailable,
    /// Candidate is not newer than the installed version
    DowngradeRejected,
    /// Escalation was refused or cancelled by the user
    PermissionDeniedUnrecoverable,
    /// Copying (or removing) bundle files failed
    FileCopyFailure,
    /// Moving the old bundle to the trash failed (logged, never fatal)
    TrashFailure,
    /// No administrator authorization mechanism is available
    AuthorizationToolMissing,
    /// The attempt was cancelled before staging began
    Cancelled,
    /// The attempt stopped without producing a result, such as after a panic
    Aborted,
}

impl ErrorKind {
    /// Stable identifier for logs and machine-readable output.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::AmbiguousOrMissingCandidate => "AMBIGUOUS_OR_MISSING_CANDIDATE",
            ErrorKind::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorKind::SignatureAnchorUnavailable => "SIGNATURE_ANCHOR_UNAVAILABLE",
            ErrorKind::DowngradeRejected => "DOWNGRADE_REJECTED",
            ErrorKind::PermissionDeniedUnrecoverable => "PERMISSION_DENIED",
            ErrorKind::FileCopyFailure => "FILE_COPY_FAILURE",
            ErrorKind::TrashFailure => "TRASH_FAILURE",
            ErrorKind::AuthorizationToolMissing => "AUTHORIZATION_TOOL_MISSING",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reasons a candidate bundle fails signature verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    /// No legacy signature in the feed or the bundle, and no platform signature
    #[error("update is not signed")]
    SignatureMissing,

    /// A signature is present but does not validate
    #[error("signature is invalid: {0}")]
    SignatureInvalid(String),

    /// Candidate is signed by a different identity than the host
    #[error("signing identity mismatch: host is {expected}, update is {found}")]
    IdentityMismatch { expected: String, found: String },

    /// Candidate is not a readable, well-formed bundle
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    /// The host carries neither a platform signature nor a public key
    #[error("no trust anchor available: host has no code signature and no public key")]
    AnchorUnavailable,
}

impl VerificationFailure {
    /// Classify this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VerificationFailure::AnchorUnavailable => ErrorKind::SignatureAnchorUnavailable,
            _ => ErrorKind::SignatureInvalid,
        }
    }
}

/// Errors raised while reading bundle metadata from disk.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Path does not exist or is not a directory
    #[error("{0} is not a bundle directory")]
    NotADirectory(PathBuf),

    /// Bundle metadata file is missing
    #[error("bundle at {0} has no Contents/Info.json")]
    MissingInfo(PathBuf),

    /// Bundle metadata could not be parsed
    #[error("invalid bundle metadata at {path}: {source}")]
    InvalidInfo {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A required metadata field is empty
    #[error("bundle metadata at {path} has an empty {field}")]
    EmptyField { path: PathBuf, field: &'static str },

    /// Embedded public key is not a valid hex Ed25519 key
    #[error("invalid public key in bundle at {path}: {reason}")]
    InvalidPublicKey { path: PathBuf, reason: String },

    /// The running executable is not inside a bundle
    #[error("not running from an application bundle: {0}")]
    NotInBundle(PathBuf),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that terminate an install attempt (or a single file operation).
#[derive(Debug, Error)]
pub enum InstallError {
    /// No candidate bundle with the expected identifier
    #[error("no update bundle with identifier {identifier} in {folder}")]
    MissingCandidate { folder: PathBuf, identifier: String },

    /// More than one candidate bundle with the expected identifier
    #[error("{} update bundles with identifier {identifier} in {folder}", .candidates.len())]
    AmbiguousCandidate {
        folder: PathBuf,
        identifier: String,
        candidates: Vec<PathBuf>,
    },

    /// Update folder could not be read
    #[error("cannot read update folder {folder}: {source}")]
    UnreadableUpdateFolder {
        folder: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Signature verification failed
    #[error("update signature check failed: {0}")]
    Signature(#[from] VerificationFailure),

    /// Candidate is older than or equal to the installed version
    #[error("update version {candidate} is not newer than installed version {installed}")]
    Downgrade { installed: String, candidate: String },

    /// User refused or cancelled the authorization prompt
    #[error("administrator authorization denied: {0}")]
    AuthorizationDenied(String),

    /// No authorization tool on this system
    #[error("no administrator authorization tool available: {0}")]
    AuthorizationToolMissing(String),

    /// Copy into the installation location failed
    #[error("failed to copy {src} to {dst}{}: {source}", restore_note(.restored))]
    FileCopy {
        src: PathBuf,
        dst: PathBuf,
        /// Whether the previous bundle was put back after the failure
        restored: Option<bool>,
        #[source]
        source: std::io::Error,
    },

    /// Removing an item failed
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Moving an item to the trash failed
    #[error("failed to move {path} to the trash: {source}")]
    Trash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The attempt was cancelled before staging
    #[error("installation cancelled")]
    Cancelled,

    /// The attempt ended without reporting a result
    #[error("installation aborted before it could report a result")]
    Aborted,
}

fn restore_note(restored: &Option<bool>) -> &'static str {
    match restored {
        Some(true) => " (previous version restored)",
        Some(false) => " (previous version could not be restored, it remains in the trash)",
        None => "",
    }
}

impl InstallError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstallError::MissingCandidate { .. }
            | InstallError::AmbiguousCandidate { .. }
            | InstallError::UnreadableUpdateFolder { .. } => ErrorKind::AmbiguousOrMissingCandidate,
            InstallError::Signature(failure) => failure.kind(),
            InstallError::Downgrade { .. } => ErrorKind::DowngradeRejected,
            InstallError::AuthorizationDenied(_) => ErrorKind::PermissionDeniedUnrecoverable,
            InstallError::AuthorizationToolMissing(_) => ErrorKind::AuthorizationToolMissing,
            InstallError::FileCopy { .. } | InstallError::Remove { .. } => {
                ErrorKind::FileCopyFailure
            }
            InstallError::Trash { .. } => ErrorKind::TrashFailure,
            InstallError::Cancelled => ErrorKind::Cancelled,
            InstallError::Aborted => ErrorKind::Aborted,
        }
    }

    /// Short message suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::AmbiguousOrMissingCandidate => {
                "The update could not be found in the downloaded files."
            }
            ErrorKind::SignatureInvalid => {
                "The update is improperly signed and could not be validated."
            }
            ErrorKind::SignatureAnchorUnavailable => {
                "The update could not be validated because the application has no signing key."
            }
            ErrorKind::DowngradeRejected => "The update is not newer than the installed version.",
            ErrorKind::PermissionDeniedUnrecoverable => {
                "The update needs administrator permission to install."
            }
            ErrorKind::FileCopyFailure => "The update could not be copied into place.",
            ErrorKind::TrashFailure => "The previous version could not be moved to the trash.",
            ErrorKind::AuthorizationToolMissing => {
                "This system provides no way to request administrator permission."
            }
            ErrorKind::Cancelled => "The update was cancelled.",
            ErrorKind::Aborted => "The update stopped unexpectedly.",
        }
    }

    /// Whether the attempt failed before touching the filesystem.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AmbiguousOrMissingCandidate
                | ErrorKind::SignatureInvalid
                | ErrorKind::SignatureAnchorUnavailable
                | ErrorKind::DowngradeRejected
                | ErrorKind::Cancelled
        )
    }
}
