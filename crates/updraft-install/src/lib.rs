//! # updraft-install
//!
//! Trust-and-install core for desktop application self-update.
//!
//! Given an already-extracted candidate bundle, this crate handles:
//! - Locating the candidate in the update folder
//! - Verifying it against the running application's code signature or
//!   Ed25519 public key
//! - Rejecting downgrades
//! - Replacing the installed bundle, escalating privileges only when the
//!   install location is not writable
//! - Moving the previous version to the trash instead of deleting it
//!
//! ## Security
//!
//! - A candidate is never installed unless verification positively succeeds
//! - Nothing on disk changes until verification and the downgrade guard pass
//! - Administrator authorization is requested per operation and released
//!   immediately afterwards

pub mod authority;
pub mod bundle;
pub mod config;
pub mod error;
pub mod fileops;
pub mod install;
#[cfg(test)]
mod proptests;
pub mod trash;
pub mod verify;
pub mod version;

// Re-export main types for convenience
pub use authority::{
    Authority, Authorization, AuthorizationGuard, CommandAuthority, ElevatedOp, NoAuthority,
};
pub use bundle::{BundleInfo, BundleMetadata, BundleReference};
pub use config::{
    AuthorizationConfig, ConfigError, InstallerConfig, SecurityConfig, StagingConfig,
};
pub use error::{BundleError, ErrorKind, InstallError, VerificationFailure};
pub use fileops::FileOperations;
pub use install::{
    locate_candidate, update_folder, InstallHandle, InstallState, InstallStatus,
    InstallationOutcome, InstallationRequest, Installer, InstallerDelegate,
};
pub use trash::{Trash, TrashLayout, TrashedItem};
pub use verify::{
    bundle_digest, sign_bundle, write_bundle_signature, CodeSigningVerifier, Codesign,
    NoCodeSigning, SignatureVerifier, SigningIdentity, TrustPath, VerificationOutcome,
};
pub use version::{SemverComparator, StandardVersionComparator, VersionComparator};
