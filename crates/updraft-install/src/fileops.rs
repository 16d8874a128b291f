//! Privileged file operations.
//!
//! Every mutating operation is first attempted as the current user. Only a
//! permission-denied failure leads to a retry with administrator rights, and
//! that retry happens at most once per call under a freshly acquired
//! [`AuthorizationGuard`](crate::authority::AuthorizationGuard) that is
//! released as soon as the retry finishes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::authority::{Authority, CommandAuthority, ElevatedOp};
use crate::config::InstallerConfig;
use crate::error::InstallError;
use crate::trash::{relocate, Trash, TrashedItem};

/// Prefix of the staging directory created next to a copy destination.
const STAGING_PREFIX: &str = ".updraft-staging";
/// Extended attribute set on downloaded files by macOS.
const QUARANTINE_ATTRIBUTE: &str = "com.apple.quarantine";

/// Copy, remove and trash with transparent privilege escalation.
#[derive(Clone)]
pub struct FileOperations {
    authority: Arc<dyn Authority>,
    trash: Trash,
    prompt: String,
}

impl FileOperations {
    /// Create file operations using `authority` for escalation and `trash`
    /// for non-destructive removal.
    pub fn new(authority: Arc<dyn Authority>, trash: Trash) -> Self {
        Self {
            authority,
            trash,
            prompt: crate::config::AuthorizationConfig::default().prompt,
        }
    }

    /// Create file operations from configuration, using the system
    /// authorization tool.
    pub fn from_config(config: &InstallerConfig) -> io::Result<Self> {
        Ok(Self::new(
            Arc::new(CommandAuthority::detect()),
            Trash::from_config(&config.staging)?,
        )
        .with_prompt(config.authorization.prompt.clone()))
    }

    /// Set the message shown in the authorization prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// The trash used by [`move_to_trash`](Self::move_to_trash).
    pub fn trash(&self) -> &Trash {
        &self.trash
    }

    /// Recursively copy `src` to `dst`, replacing whatever is at `dst`.
    ///
    /// The copy is staged in a sibling of `dst` and renamed into place, so
    /// `dst` never holds a partial copy. Permissions and symlinks are
    /// preserved.
    ///
    /// # Errors
    ///
    /// - [`InstallError::FileCopy`] if the copy fails for a reason other than
    ///   permissions, or the elevated retry fails
    /// - [`InstallError::AuthorizationDenied`] /
    ///   [`InstallError::AuthorizationToolMissing`] if escalation is needed
    ///   but cannot be obtained
    pub fn copy(&self, src: &Path, dst: &Path) -> Result<(), InstallError> {
        debug!(src = %src.display(), dst = %dst.display(), "Copying");
        self.run_with_escalation(
            ElevatedOp::Copy {
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
            },
            || copy_staged(src, dst),
        )
    }

    /// Recursively delete `path`. A missing path is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), InstallError> {
        debug!(path = %path.display(), "Removing");
        self.run_with_escalation(
            ElevatedOp::Remove {
                path: path.to_path_buf(),
            },
            || remove_path(path),
        )
    }

    /// Move `path` to the trash. Returns `None` if there was nothing to move.
    ///
    /// The trash slot is claimed as the current user. Only the move itself is
    /// retried with administrator rights, when the item's parent directory
    /// does not let the user take it out. Callers treat failures as
    /// non-fatal.
    pub fn move_to_trash(&self, path: &Path) -> Result<Option<TrashedItem>, InstallError> {
        if fs::symlink_metadata(path).is_err() {
            return Ok(None);
        }
        let item = self.trash.reserve(path).map_err(|source| InstallError::Trash {
            path: path.to_path_buf(),
            source,
        })?;

        let moved = self.run_with_escalation(
            ElevatedOp::Move {
                src: item.original_path.clone(),
                dst: item.trashed_path.clone(),
            },
            || relocate(&item.original_path, &item.trashed_path),
        );
        if let Err(e) = moved {
            item.release_reservation();
            return Err(e);
        }

        info!(
            path = %item.original_path.display(),
            trashed = %item.trashed_path.display(),
            "Moved item to trash"
        );
        Ok(Some(item))
    }

    /// Put a trashed item back, escalating like
    /// [`move_to_trash`](Self::move_to_trash) when the original parent
    /// directory is not writable.
    pub fn restore(&self, item: &TrashedItem) -> Result<(), InstallError> {
        let trash_error = |source| InstallError::Trash {
            path: item.trashed_path.clone(),
            source,
        };
        item.check_restorable().map_err(trash_error)?;
        self.run_with_escalation(
            ElevatedOp::Move {
                src: item.trashed_path.clone(),
                dst: item.original_path.clone(),
            },
            || relocate(&item.trashed_path, &item.original_path),
        )?;
        item.forget();
        Ok(())
    }

    /// Run `attempt`; on permission denial, acquire authorization once and
    /// run `op` with it.
    pub(crate) fn run_with_escalation<F>(&self, op: ElevatedOp, attempt: F) -> Result<(), InstallError>
    where
        F: FnOnce() -> io::Result<()>,
    {
        match attempt() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                info!(op = ?op, error = %e, "Permission denied, retrying with administrator authorization");
                let mut guard = self.authority.acquire(&self.prompt)?;
                let result = guard.perform(&op);
                drop(guard);
                result
            }
            Err(e) => Err(op.failure(e)),
        }
    }
}

impl std::fmt::Debug for FileOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOperations")
            .field("trash", &self.trash)
            .field("prompt", &self.prompt)
            .finish()
    }
}

/// Clear the macOS quarantine attribute from `path`, recursively.
///
/// Best-effort; does nothing on other platforms.
pub fn clear_quarantine(path: &Path) {
    if !cfg!(target_os = "macos") {
        return;
    }
    match Command::new("xattr")
        .args(["-dr", QUARANTINE_ATTRIBUTE])
        .arg(path)
        .output()
    {
        Ok(output) if output.status.success() => {
            debug!(path = %path.display(), "Cleared quarantine attribute");
        }
        Ok(output) => warn!(
            path = %path.display(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Failed to clear quarantine attribute"
        ),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to run xattr"),
    }
}

fn copy_staged(src: &Path, dst: &Path) -> io::Result<()> {
    fs::symlink_metadata(src)?;
    let name = dst.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name")
    })?;
    let parent = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(&parent)?;
    let staged = staging.path().join(name);
    copy_tree(src, &staged)?;
    remove_path(dst)?;
    fs::rename(&staged, dst)?;
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recursively copy `src` to `dst` (which must not exist), preserving
/// permissions and symlinks.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let mut directories = Vec::new();

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = if relative.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(relative)
        };
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else if file_type.is_dir() {
            fs::create_dir(&target)?;
            directories.push((target, entry.metadata().map_err(io::Error::from)?.permissions()));
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    // Directory permissions go last so read-only directories can be filled.
    for (dir, permissions) in directories.into_iter().rev() {
        fs::set_permissions(&dir, permissions)?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(link)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    if fs::metadata(link)?.is_dir() {
        copy_tree(&fs::canonicalize(link)?, target)
    } else {
        fs::copy(link, target).map(|_| ())
    }
}
