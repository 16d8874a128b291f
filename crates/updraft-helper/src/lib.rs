//! Updraft helper - command-line front end over `updraft-install`
//!
//! This crate provides a command-line interface for:
//! - Installing an extracted update over an application bundle
//! - Verifying a candidate bundle without installing it
//! - Signing bundles and generating Ed25519 signing keys
//! - Inspecting update folders, digests and version ordering

pub mod cli;
pub mod config;
pub mod keys;

pub use cli::Cli;
pub use config::Config;

use updraft_install::ErrorKind;

/// Exit codes for helper operations
///
/// Exit codes provide machine-readable status for scripting:
/// - 0: Success - operation completed successfully
/// - 1: General error - unspecified error occurred
/// - 2: Signature - candidate failed verification or has no trust anchor
/// - 3: Downgrade - candidate is not newer than the installed bundle
/// - 4: Candidate - update bundle missing or ambiguous
/// - 5: Authorization - administrator authorization denied or unavailable
/// - 6: File operation - copying the update into place failed
/// - 7: Invalid input - bad arguments or data provided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Signature verification failed (exit code 2)
    Signature = 2,
    /// Downgrade rejected (exit code 3)
    Downgrade = 3,
    /// Candidate missing or ambiguous (exit code 4)
    Candidate = 4,
    /// Authorization denied or unavailable (exit code 5)
    Authorization = 5,
    /// File operation failed (exit code 6)
    FileOperation = 6,
    /// Invalid input provided (exit code 7)
    InvalidInput = 7,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<ErrorKind> for ExitCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::SignatureInvalid | ErrorKind::SignatureAnchorUnavailable => {
                ExitCode::Signature
            }
            ErrorKind::DowngradeRejected => ExitCode::Downgrade,
            ErrorKind::AmbiguousOrMissingCandidate => ExitCode::Candidate,
            ErrorKind::PermissionDeniedUnrecoverable | ErrorKind::AuthorizationToolMissing => {
                ExitCode::Authorization
            }
            ErrorKind::FileCopyFailure | ErrorKind::TrashFailure => ExitCode::FileOperation,
            ErrorKind::Cancelled | ErrorKind::Aborted => ExitCode::GeneralError,
        }
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Get the exit code name as a string
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::Signature => "SIGNATURE",
            ExitCode::Downgrade => "DOWNGRADE",
            ExitCode::Candidate => "CANDIDATE",
            ExitCode::Authorization => "AUTHORIZATION",
            ExitCode::FileOperation => "FILE_OPERATION",
            ExitCode::InvalidInput => "INVALID_INPUT",
        }
    }

    /// Get a human-readable description of the exit code
    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Operation completed successfully",
            ExitCode::GeneralError => "An unspecified error occurred",
            ExitCode::Signature => "The update failed signature verification",
            ExitCode::Downgrade => "The update is not newer than the installed version",
            ExitCode::Candidate => "The update bundle is missing or ambiguous",
            ExitCode::Authorization => "Administrator authorization was denied or is unavailable",
            ExitCode::FileOperation => "The update could not be copied into place",
            ExitCode::InvalidInput => "Invalid arguments or data provided",
        }
    }
}
