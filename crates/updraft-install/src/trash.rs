//! Non-destructive removal.
//!
//! Replaced bundles are moved aside rather than deleted, so the user (or the
//! installer, after a failed copy) can put them back.
//!
//! ## Layouts
//!
//! ```text
//! ~/.Trash/                      macOS: items placed directly in the trash
//! $XDG_DATA_HOME/Trash/          freedesktop.org:
//! ├── files/Example.app              the trashed item
//! └── info/Example.app.trashinfo     original path and deletion date
//! <holding dir>/                 elsewhere, or when configured explicitly
//! ```

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::config::StagingConfig;
use crate::fileops::copy_tree;

/// Extension of freedesktop.org trash info records.
const TRASHINFO_EXTENSION: &str = "trashinfo";
/// Upper bound on numbered name attempts before giving up.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// How a trash directory is organized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrashLayout {
    /// Items sit directly in the trash directory (`~/.Trash`)
    MacOs,
    /// `files/` plus `info/*.trashinfo` records
    Freedesktop,
    /// Private holding directory with no metadata
    Holding,
}

/// A trash location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trash {
    root: PathBuf,
    layout: TrashLayout,
}

/// An item that was moved to the trash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashedItem {
    /// Where the item was before it was trashed
    pub original_path: PathBuf,
    /// Where the item is now
    pub trashed_path: PathBuf,
    /// Trash info record, for the freedesktop.org layout
    pub info_path: Option<PathBuf>,
}

impl Trash {
    /// Trash at `root` with the given layout.
    pub fn new(root: impl Into<PathBuf>, layout: TrashLayout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    /// The current user's platform trash.
    pub fn platform() -> io::Result<Self> {
        let dirs = directories::BaseDirs::new().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "cannot determine home directory")
        })?;

        let trash = if cfg!(target_os = "macos") {
            Self::new(dirs.home_dir().join(".Trash"), TrashLayout::MacOs)
        } else if cfg!(unix) {
            Self::new(dirs.data_dir().join("Trash"), TrashLayout::Freedesktop)
        } else {
            Self::new(
                dirs.data_local_dir().join("updraft").join("Trash"),
                TrashLayout::Holding,
            )
        };
        Ok(trash)
    }

    /// Trash selected by configuration: the configured holding directory, or
    /// the platform trash.
    pub fn from_config(config: &StagingConfig) -> io::Result<Self> {
        match &config.trash_dir {
            Some(dir) => Ok(Self::new(dir.clone(), TrashLayout::Holding)),
            None => Self::platform(),
        }
    }

    /// Root directory of this trash.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Layout of this trash.
    pub fn layout(&self) -> TrashLayout {
        self.layout
    }

    fn files_dir(&self) -> PathBuf {
        match self.layout {
            TrashLayout::Freedesktop => self.root.join("files"),
            TrashLayout::MacOs | TrashLayout::Holding => self.root.clone(),
        }
    }

    fn info_dir(&self) -> Option<PathBuf> {
        match self.layout {
            TrashLayout::Freedesktop => Some(self.root.join("info")),
            TrashLayout::MacOs | TrashLayout::Holding => None,
        }
    }

    /// Move `path` into the trash under a name that does not collide with
    /// anything already there.
    ///
    /// # Errors
    ///
    /// Fails if `path` does not exist, the trash cannot be created, or the
    /// item cannot be moved. On failure `path` is left where it was.
    pub fn move_to_trash(&self, path: &Path) -> io::Result<TrashedItem> {
        let item = self.reserve(path)?;
        if let Err(e) = relocate(&item.original_path, &item.trashed_path) {
            item.release_reservation();
            return Err(e);
        }

        info!(
            path = %item.original_path.display(),
            trashed = %item.trashed_path.display(),
            "Moved item to trash"
        );
        Ok(item)
    }

    /// Claim a slot in the trash for `path` without moving it. The info
    /// record, if the layout has one, is written now.
    ///
    /// The returned item describes where `path` will go. Callers that move
    /// it some other way must call [`TrashedItem::release_reservation`] if
    /// the move fails.
    pub fn reserve(&self, path: &Path) -> io::Result<TrashedItem> {
        fs::symlink_metadata(path)?;
        let original_path = absolute(path)?;
        let file_name = original_path.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "cannot trash a filesystem root")
        })?;

        let files_dir = self.files_dir();
        fs::create_dir_all(&files_dir)?;
        let info_dir = self.info_dir();
        if let Some(info_dir) = &info_dir {
            fs::create_dir_all(info_dir)?;
        }

        let (name, info_path) = self.reserve_name(&files_dir, info_dir.as_deref(), file_name, &original_path)?;
        Ok(TrashedItem {
            trashed_path: files_dir.join(&name),
            original_path,
            info_path,
        })
    }

    /// Pick a free name in the trash. For the freedesktop.org layout the info
    /// record is created here, which claims the name.
    fn reserve_name(
        &self,
        files_dir: &Path,
        info_dir: Option<&Path>,
        file_name: &OsStr,
        original_path: &Path,
    ) -> io::Result<(String, Option<PathBuf>)> {
        let file_name = file_name.to_string_lossy();
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let candidate = numbered_name(&file_name, attempt);
            if fs::symlink_metadata(files_dir.join(&candidate)).is_ok() {
                continue;
            }
            let Some(info_dir) = info_dir else {
                return Ok((candidate, None));
            };

            let info_path = info_dir.join(format!("{}.{}", candidate, TRASHINFO_EXTENSION));
            match OpenOptions::new().write(true).create_new(true).open(&info_path) {
                Ok(mut file) => {
                    file.write_all(trash_info(original_path).as_bytes())?;
                    return Ok((candidate, Some(info_path)));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free name for {} in {}", file_name, files_dir.display()),
        ))
    }
}

impl TrashedItem {
    /// Put the item back where it came from.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyExists` if something now occupies the original
    /// location.
    pub fn restore(&self) -> io::Result<()> {
        self.check_restorable()?;
        relocate(&self.trashed_path, &self.original_path)?;
        self.forget();
        Ok(())
    }

    /// Fail with `AlreadyExists` if the original location is taken.
    pub fn check_restorable(&self) -> io::Result<()> {
        if fs::symlink_metadata(&self.original_path).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", self.original_path.display()),
            ));
        }
        Ok(())
    }

    /// Drop the info record of a reservation whose item never arrived.
    pub fn release_reservation(&self) {
        if let Some(info_path) = &self.info_path {
            let _ = fs::remove_file(info_path);
        }
    }

    /// Bookkeeping after the item went back to its original location.
    pub(crate) fn forget(&self) {
        if let Some(info_path) = &self.info_path {
            if let Err(e) = fs::remove_file(info_path) {
                warn!(path = %info_path.display(), error = %e, "Failed to remove trash info record");
            }
        }
        info!(path = %self.original_path.display(), "Restored item from trash");
    }
}

/// Rename, falling back to copy-and-delete across filesystems.
pub(crate) fn relocate(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.kind(), io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound) => {
            Err(e)
        }
        Err(e) => {
            debug!(from = %from.display(), to = %to.display(), error = %e, "Rename failed, copying instead");
            copy_tree(from, to)?;
            let removed = if fs::symlink_metadata(from)?.is_dir() {
                fs::remove_dir_all(from)
            } else {
                fs::remove_file(from)
            };
            if let Err(e) = removed {
                let _ = fs::remove_dir_all(to).or_else(|_| fs::remove_file(to));
                return Err(e);
            }
            Ok(())
        }
    }
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.canonicalize()?,
        _ => std::env::current_dir()?,
    };
    match path.file_name() {
        Some(name) => Ok(parent.join(name)),
        None => path.canonicalize(),
    }
}

/// `Example.app`, `Example 2.app`, `Example 3.app`, ...
fn numbered_name(file_name: &str, attempt: u32) -> String {
    if attempt == 1 {
        return file_name.to_string();
    }
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} {}{}", &file_name[..dot], attempt, &file_name[dot..]),
        _ => format!("{} {}", file_name, attempt),
    }
}

fn trash_info(original_path: &Path) -> String {
    format!(
        "[Trash Info]\nPath={}\nDeletionDate={}\n",
        encode_trash_path(original_path),
        Local::now().format("%Y-%m-%dT%H:%M:%S")
    )
}

/// Percent-encode each component of an absolute path, keeping the
/// separators.
fn encode_trash_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if component == Component::RootDir {
            continue;
        }
        out.push('/');
        out.push_str(&encode_component(component.as_os_str()));
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(unix)]
fn encode_component(name: &OsStr) -> String {
    use std::os::unix::ffi::OsStrExt;
    urlencoding::encode_binary(name.as_bytes()).into_owned()
}

#[cfg(not(unix))]
fn encode_component(name: &OsStr) -> String {
    urlencoding::encode(&name.to_string_lossy()).into_owned()
}
