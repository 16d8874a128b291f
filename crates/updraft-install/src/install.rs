//! Install orchestration.
//!
//! An install attempt walks through
//!
//! ```text
//! Idle → LocatingCandidate → VerifyingSignature → StagingSwap → Completed
//! ```
//!
//! Nothing on disk changes before `StagingSwap`. Locate, signature and
//! downgrade failures all end the attempt earlier. Attempts against the same
//! destination are serialized process-wide; a second attempt waits for the
//! first to finish.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bundle::{self, BundleMetadata, BundleReference};
use crate::config::{ConfigError, InstallerConfig};
use crate::error::{ErrorKind, InstallError};
use crate::fileops::{self, FileOperations};
use crate::trash::TrashedItem;
use crate::verify::{self, SignatureVerifier};
use crate::version::{StandardVersionComparator, VersionComparator};

/// Terminal result of an attempt, as seen through [`InstallState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    /// Installed at this path
    Succeeded(PathBuf),
    /// Failed with this kind
    Failed(ErrorKind),
}

/// Progress of an install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstallState {
    /// Not started
    #[default]
    Idle,
    /// Looking for the candidate bundle in the source folder
    LocatingCandidate,
    /// Checking the candidate's signature and version
    VerifyingSignature,
    /// Replacing the installed bundle
    StagingSwap,
    /// Finished
    Completed(InstallStatus),
}

impl InstallState {
    /// Whether the attempt has finished.
    pub fn is_completed(&self) -> bool {
        matches!(self, InstallState::Completed(_))
    }
}

/// One install request.
#[derive(Clone)]
pub struct InstallationRequest {
    /// Folder holding the extracted candidate bundle
    pub source_folder: PathBuf,
    /// The installed application, used as trust anchor and version baseline
    pub host: Arc<BundleReference>,
    /// Where the candidate is installed
    pub destination: PathBuf,
    /// Ordering used by the downgrade guard
    pub comparator: Arc<dyn VersionComparator>,
    /// Block the caller until the attempt completes
    pub synchronous: bool,
    /// Legacy signature carried by the update feed
    pub update_signature: Option<String>,
    /// Accept candidates that are not newer than the host
    pub allow_downgrade: bool,
}

impl InstallationRequest {
    /// Request installing the candidate in `source_folder` over `host`, in
    /// place, synchronously, with the standard comparator.
    pub fn new(source_folder: impl Into<PathBuf>, host: Arc<BundleReference>) -> Self {
        Self {
            source_folder: source_folder.into(),
            destination: host.path().to_path_buf(),
            host,
            comparator: Arc::new(StandardVersionComparator),
            synchronous: true,
            update_signature: None,
            allow_downgrade: false,
        }
    }

    /// Install somewhere other than the host's own location.
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Use a different version ordering.
    pub fn with_comparator(mut self, comparator: Arc<dyn VersionComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Choose between blocking and background execution.
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Verify against this feed signature instead of the bundle's own.
    pub fn with_update_signature(mut self, signature: impl Into<String>) -> Self {
        self.update_signature = Some(signature.into());
        self
    }

    /// Permit installing an older or equal version.
    pub fn allow_downgrade(mut self, allow: bool) -> Self {
        self.allow_downgrade = allow;
        self
    }
}

impl std::fmt::Debug for InstallationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationRequest")
            .field("source_folder", &self.source_folder)
            .field("host", &self.host)
            .field("destination", &self.destination)
            .field("synchronous", &self.synchronous)
            .field("update_signature", &self.update_signature.is_some())
            .field("allow_downgrade", &self.allow_downgrade)
            .finish()
    }
}

/// Result of an install attempt.
#[derive(Debug)]
pub enum InstallationOutcome {
    /// Installed at this path
    Success(PathBuf),
    /// Attempt failed
    Failed(InstallError),
}

impl InstallationOutcome {
    /// Whether the candidate was installed.
    pub fn is_success(&self) -> bool {
        matches!(self, InstallationOutcome::Success(_))
    }

    /// Failure kind, if the attempt failed.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            InstallationOutcome::Success(_) => None,
            InstallationOutcome::Failed(e) => Some(e.kind()),
        }
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> Result<PathBuf, InstallError> {
        match self {
            InstallationOutcome::Success(path) => Ok(path),
            InstallationOutcome::Failed(e) => Err(e),
        }
    }

    fn status(&self) -> InstallStatus {
        match self {
            InstallationOutcome::Success(path) => InstallStatus::Succeeded(path.clone()),
            InstallationOutcome::Failed(e) => InstallStatus::Failed(e.kind()),
        }
    }
}

/// Receives the result of an install attempt. Exactly one method is called,
/// exactly once, per attempt.
pub trait InstallerDelegate: Send + Sync {
    /// The candidate is installed at `installed_path`.
    fn installation_succeeded(&self, host: &BundleReference, installed_path: &Path);

    /// The attempt failed.
    fn installation_failed(&self, host: &BundleReference, error: &InstallError);
}

/// Delivers the outcome to the delegate. Consumed on delivery; dropped
/// undelivered (an unwinding attempt) it reports [`InstallError::Aborted`].
struct Completion {
    delegate: Arc<dyn InstallerDelegate>,
    host: Arc<BundleReference>,
    state: watch::Sender<InstallState>,
    delivered: bool,
}

impl Completion {
    fn new(
        delegate: Arc<dyn InstallerDelegate>,
        host: Arc<BundleReference>,
        state: watch::Sender<InstallState>,
    ) -> Self {
        Self {
            delegate,
            host,
            state,
            delivered: false,
        }
    }

    fn complete(mut self, outcome: InstallationOutcome) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: InstallationOutcome) {
        self.delivered = true;
        match &outcome {
            InstallationOutcome::Success(path) => {
                self.delegate.installation_succeeded(&self.host, path)
            }
            InstallationOutcome::Failed(e) => self.delegate.installation_failed(&self.host, e),
        }
        self.state.send_replace(InstallState::Completed(outcome.status()));
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.delivered {
            error!(
                identifier = %self.host.identifier(),
                "Install attempt ended without a result"
            );
            self.deliver(InstallationOutcome::Failed(InstallError::Aborted));
        }
    }
}

/// Handle to a running install attempt.
#[derive(Debug)]
pub struct InstallHandle {
    cancel: CancellationToken,
    state: watch::Receiver<InstallState>,
}

impl InstallHandle {
    /// Request cancellation. Honoured until staging begins.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current state of the attempt.
    pub fn state(&self) -> InstallState {
        self.state.borrow().clone()
    }

    /// Receiver for state changes.
    pub fn subscribe(&self) -> watch::Receiver<InstallState> {
        self.state.clone()
    }

    /// Wait until the attempt completes and return its final state.
    pub async fn completed(&mut self) -> InstallState {
        let completed = self
            .state
            .wait_for(InstallState::is_completed)
            .await
            .map(|state| state.clone());
        completed.unwrap_or_else(|_| self.state.borrow().clone())
    }
}

struct InstallerInner {
    verifier: SignatureVerifier,
    file_ops: FileOperations,
    config: InstallerConfig,
}

/// Verifies and installs candidate bundles.
///
/// # Example
///
/// ```ignore
/// let installer = Installer::from_config(InstallerConfig::default())?;
/// let host = Arc::new(BundleReference::for_current_executable()?);
/// let request = InstallationRequest::new(update_folder(host.as_ref(), installer.config())?, host);
/// let installed = installer.run(request).into_result()?;
/// ```
#[derive(Clone)]
pub struct Installer {
    inner: Arc<InstallerInner>,
}

impl Installer {
    /// Create an installer from its parts.
    pub fn new(verifier: SignatureVerifier, file_ops: FileOperations, config: InstallerConfig) -> Self {
        Self {
            inner: Arc::new(InstallerInner {
                verifier,
                file_ops,
                config,
            }),
        }
    }

    /// Create an installer using the platform code-signing mechanism, the
    /// system authorization tool and the configured trash.
    pub fn from_config(config: InstallerConfig) -> Result<Self, ConfigError> {
        let verifier = SignatureVerifier::from_config(verify::platform_verifier(), &config.security)?;
        let file_ops = FileOperations::from_config(&config)?;
        Ok(Self::new(verifier, file_ops, config))
    }

    /// Installer configuration.
    pub fn config(&self) -> &InstallerConfig {
        &self.inner.config
    }

    /// Start an install attempt.
    ///
    /// With `request.synchronous` the attempt runs on the calling thread and
    /// has completed when this returns. Otherwise it runs on the tokio
    /// blocking pool when called inside a runtime, or on a new thread.
    pub fn install(
        &self,
        request: InstallationRequest,
        delegate: Arc<dyn InstallerDelegate>,
    ) -> InstallHandle {
        let (state_tx, state_rx) = watch::channel(InstallState::Idle);
        let cancel = CancellationToken::new();
        let handle = InstallHandle {
            cancel: cancel.clone(),
            state: state_rx,
        };
        let completion = Completion::new(delegate, request.host.clone(), state_tx);

        if request.synchronous {
            self.execute(request, cancel, completion);
        } else {
            let installer = self.clone();
            let job = move || installer.execute(request, cancel, completion);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(job);
                }
                Err(_) => {
                    std::thread::spawn(job);
                }
            }
        }
        handle
    }

    /// Run an install attempt on the calling thread and return its outcome.
    pub fn run(&self, request: InstallationRequest) -> InstallationOutcome {
        let (state, _) = watch::channel(InstallState::Idle);
        self.run_attempt(&request, &CancellationToken::new(), &state)
    }

    fn execute(&self, request: InstallationRequest, cancel: CancellationToken, completion: Completion) {
        let outcome = self.run_attempt(&request, &cancel, &completion.state);
        completion.complete(outcome);
    }

    fn run_attempt(
        &self,
        request: &InstallationRequest,
        cancel: &CancellationToken,
        state: &watch::Sender<InstallState>,
    ) -> InstallationOutcome {
        info!(
            identifier = %request.host.identifier(),
            source = %request.source_folder.display(),
            destination = %request.destination.display(),
            "Starting install"
        );
        match self.attempt(request, cancel, state) {
            Ok(path) => {
                info!(path = %path.display(), "Install complete");
                InstallationOutcome::Success(path)
            }
            Err(e) => {
                error!(kind = %e.kind(), error = %e, "Install failed");
                InstallationOutcome::Failed(e)
            }
        }
    }

    fn attempt(
        &self,
        request: &InstallationRequest,
        cancel: &CancellationToken,
        state: &watch::Sender<InstallState>,
    ) -> Result<PathBuf, InstallError> {
        let target = self.install_target(request);
        let locks = destination_locks(&[request.destination.as_path(), target.as_path()]);
        let _serialized: Vec<_> = locks
            .iter()
            .map(|entry| entry.lock.lock().unwrap_or_else(PoisonError::into_inner))
            .collect();
        let host = request.host.as_ref();

        check_cancelled(cancel)?;
        transition(state, InstallState::LocatingCandidate);
        let candidate = locate_candidate(&request.source_folder, host.identifier())?;

        check_cancelled(cancel)?;
        transition(state, InstallState::VerifyingSignature);
        self.inner
            .verifier
            .verify_with_signature(&candidate, host, request.update_signature.as_deref())
            .into_result()?;

        let allow_downgrade = request.allow_downgrade || self.inner.config.allow_downgrades;
        let ordering = request
            .comparator
            .compare_versions(candidate.version(), host.version());
        if ordering != Ordering::Greater {
            if !allow_downgrade {
                return Err(InstallError::Downgrade {
                    installed: host.version().to_string(),
                    candidate: candidate.version().to_string(),
                });
            }
            warn!(
                installed = %host.version(),
                candidate = %candidate.version(),
                "Installing a version that is not newer"
            );
        }

        check_cancelled(cancel)?;
        transition(state, InstallState::StagingSwap);
        self.swap(request, &candidate, target)
    }

    /// Where the candidate ends up: the destination, or its normalized name.
    fn install_target(&self, request: &InstallationRequest) -> PathBuf {
        if self.inner.config.staging.normalize_installed_name {
            normalized_destination(&request.destination, &request.host)
        } else {
            request.destination.clone()
        }
    }

    fn swap(
        &self,
        request: &InstallationRequest,
        candidate: &BundleReference,
        target: PathBuf,
    ) -> Result<PathBuf, InstallError> {
        let staging = &self.inner.config.staging;
        let file_ops = &self.inner.file_ops;
        let destination = &request.destination;
        let mut trashed = Vec::new();

        // An unrelated item under the normalized name is never overwritten.
        if target != *destination {
            if let Some(item) = file_ops.move_to_trash(&target)? {
                warn!(
                    path = %target.display(),
                    trashed = %item.trashed_path.display(),
                    "Moved the item occupying the install name to the trash"
                );
                trashed.push(item);
            }
        }

        match file_ops.move_to_trash(destination) {
            Ok(item) => trashed.extend(item),
            Err(e) => {
                warn!(error = %e, "Could not move the previous version to the trash, replacing it");
            }
        }

        if let Err(e) = file_ops.copy(candidate.path(), &target) {
            let restored = if trashed.is_empty() {
                None
            } else {
                Some(
                    trashed
                        .iter()
                        .rev()
                        .fold(true, |all, item| self.restore_previous(item) && all),
                )
            };
            return Err(record_restore(e, restored));
        }

        if target != *destination && fs::symlink_metadata(destination).is_ok() {
            warn!(
                path = %destination.display(),
                "Previous version left in place under its old name"
            );
        }
        if staging.clear_quarantine {
            fileops::clear_quarantine(&target);
        }
        if staging.remove_source_after_install {
            if let Err(e) = file_ops.remove(&request.source_folder) {
                warn!(error = %e, "Failed to remove the update folder");
            }
        }
        Ok(target)
    }

    fn restore_previous(&self, item: &TrashedItem) -> bool {
        match self.inner.file_ops.restore(item) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    trashed = %item.trashed_path.display(),
                    error = %e,
                    "Could not restore the previous version"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for Installer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installer")
            .field("verifier", &self.inner.verifier)
            .field("file_ops", &self.inner.file_ops)
            .finish()
    }
}

fn transition(state: &watch::Sender<InstallState>, next: InstallState) {
    debug!(state = ?next, "Install state changed");
    state.send_replace(next);
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), InstallError> {
    if cancel.is_cancelled() {
        info!("Install cancelled before staging");
        return Err(InstallError::Cancelled);
    }
    Ok(())
}

fn record_restore(error: InstallError, restored: Option<bool>) -> InstallError {
    match error {
        InstallError::FileCopy {
            src, dst, source, ..
        } => InstallError::FileCopy {
            src,
            dst,
            restored,
            source,
        },
        other => {
            if let Some(restored) = restored {
                info!(restored = restored, "Previous version restore attempted after failure");
            }
            other
        }
    }
}

/// `<destination parent>/<host name>.<extension>`
fn normalized_destination(destination: &Path, host: &BundleReference) -> PathBuf {
    let extension = destination
        .extension()
        .or_else(|| host.path().extension())
        .map(|e| e.to_string_lossy().into_owned());
    let name = match extension {
        Some(ext) => format!("{}.{}", host.name(), ext),
        None => host.name().to_string(),
    };
    destination.with_file_name(name)
}

type LockTable = Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

fn lock_table() -> &'static LockTable {
    static LOCKS: OnceLock<LockTable> = OnceLock::new();
    LOCKS.get_or_init(Default::default)
}

/// A per-path lock registered in the process-wide table. The table entry is
/// dropped with the last handle.
struct DestinationLock {
    key: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl DestinationLock {
    fn register(key: PathBuf) -> Self {
        let mut locks = lock_table().lock().unwrap_or_else(PoisonError::into_inner);
        let lock = locks.entry(key.clone()).or_default().clone();
        Self { key, lock }
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        let mut locks = lock_table().lock().unwrap_or_else(PoisonError::into_inner);
        // Handles are only cloned under the table lock: the table plus this
        // handle means nobody else holds or waits on it.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Locks for every path, deduplicated and in a fixed order.
fn destination_locks(paths: &[&Path]) -> Vec<DestinationLock> {
    let mut keys: Vec<PathBuf> = paths.iter().map(|path| lock_key(path)).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter().map(DestinationLock::register).collect()
}

fn lock_key(destination: &Path) -> PathBuf {
    match (destination.parent(), destination.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| destination.to_path_buf()),
        _ => destination.to_path_buf(),
    }
}

/// Find the single top-level bundle in `folder` whose identifier is
/// `identifier`.
///
/// # Errors
///
/// - [`InstallError::MissingCandidate`] if there is none
/// - [`InstallError::AmbiguousCandidate`] if there are several
/// - [`InstallError::UnreadableUpdateFolder`] if `folder` cannot be listed
pub fn locate_candidate(folder: &Path, identifier: &str) -> Result<BundleReference, InstallError> {
    let unreadable = |source: io::Error| InstallError::UnreadableUpdateFolder {
        folder: folder.to_path_buf(),
        source,
    };

    let mut matches = Vec::new();
    for entry in fs::read_dir(folder).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if !bundle::is_bundle(&path) {
            continue;
        }
        match BundleReference::load(&path) {
            Ok(found) if found.identifier() == identifier => matches.push(found),
            Ok(found) => debug!(
                path = %path.display(),
                identifier = %found.identifier(),
                "Skipping bundle with another identifier"
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable bundle"),
        }
    }

    match matches.len() {
        0 => Err(InstallError::MissingCandidate {
            folder: folder.to_path_buf(),
            identifier: identifier.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        _ => {
            let mut candidates: Vec<PathBuf> =
                matches.iter().map(|b| b.path().to_path_buf()).collect();
            candidates.sort();
            Err(InstallError::AmbiguousCandidate {
                folder: folder.to_path_buf(),
                identifier: identifier.to_string(),
                candidates,
            })
        }
    }
}

/// Well-known folder where updates for `host` are extracted before install.
///
/// Defaults to `<user cache dir>/<identifier>/Updates`; the configured
/// `staging.update_folder` overrides it. Created if absent.
pub fn update_folder(host: &dyn BundleMetadata, config: &InstallerConfig) -> io::Result<PathBuf> {
    let folder = match &config.staging.update_folder {
        Some(folder) => folder.clone(),
        None => directories::BaseDirs::new()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cannot determine cache directory"))?
            .cache_dir()
            .join(host.identifier())
            .join("Updates"),
    };
    fs::create_dir_all(&folder)?;
    Ok(folder)
}
