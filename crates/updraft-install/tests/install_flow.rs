//! Integration tests for the install flow.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use tempfile::TempDir;

use updraft_install::{
    BundleInfo, BundleMetadata, BundleReference, CodeSigningVerifier, ErrorKind, FileOperations,
    InstallError, InstallState, InstallStatus, InstallationRequest, Installer, InstallerConfig,
    InstallerDelegate, NoAuthority, NoCodeSigning, SignatureVerifier, SigningIdentity, Trash,
    TrashLayout, VerificationFailure,
};

const IDENTIFIER: &str = "com.example.app";

/// Delegate that records every callback.
#[derive(Default)]
struct RecordingDelegate {
    succeeded: Mutex<Vec<PathBuf>>,
    failed: Mutex<Vec<ErrorKind>>,
}

impl RecordingDelegate {
    fn calls(&self) -> usize {
        self.succeeded.lock().unwrap().len() + self.failed.lock().unwrap().len()
    }
}

impl InstallerDelegate for RecordingDelegate {
    fn installation_succeeded(&self, host: &BundleReference, installed_path: &Path) {
        assert_eq!(host.identifier(), IDENTIFIER);
        self.succeeded.lock().unwrap().push(installed_path.to_path_buf());
    }

    fn installation_failed(&self, host: &BundleReference, error: &InstallError) {
        assert_eq!(host.identifier(), IDENTIFIER);
        self.failed.lock().unwrap().push(error.kind());
    }
}

/// Code-signing verifier that signs everything with one team, and tracks how
/// many checks run at once.
#[derive(Default)]
struct SlowTeamSigning {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CodeSigningVerifier for SlowTeamSigning {
    fn signing_identity(&self, _path: &Path) -> Result<Option<SigningIdentity>, VerificationFailure> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(SigningIdentity {
            team_identifier: Some("TEAM123456".to_string()),
            authorities: vec!["Developer ID Application: Example".to_string()],
        }))
    }

    fn description(&self) -> &str {
        "slow team signing"
    }
}

struct Fixture {
    temp: TempDir,
    key: SigningKey,
    host: Arc<BundleReference>,
}

impl Fixture {
    fn new(host_version: &str) -> Self {
        Self::with_host_name(host_version, "Example.app")
    }

    fn with_host_name(host_version: &str, bundle_name: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let host_path = temp.path().join("Applications").join(bundle_name);
        write_bundle(&host_path, host_version, Some(&key));
        let host = Arc::new(BundleReference::load(&host_path).unwrap());
        Self { temp, key, host }
    }

    fn updates(&self, name: &str) -> PathBuf {
        let folder = self.temp.path().join(name);
        fs::create_dir_all(&folder).unwrap();
        folder
    }

    fn add_candidate(&self, folder: &Path, version: &str, signed: bool) -> PathBuf {
        let path = folder.join("Example.app");
        write_bundle(&path, version, None);
        if signed {
            updraft_install::write_bundle_signature(&self.key, &path).unwrap();
        }
        path
    }

    fn trash_root(&self) -> PathBuf {
        self.temp.path().join("trash")
    }

    fn installer(&self, verifier: SignatureVerifier) -> Installer {
        self.installer_with(verifier, self.trash_root(), InstallerConfig::default())
    }

    fn installer_with(
        &self,
        verifier: SignatureVerifier,
        trash_root: PathBuf,
        mut config: InstallerConfig,
    ) -> Installer {
        config.staging.clear_quarantine = false;
        let file_ops = FileOperations::new(
            Arc::new(NoAuthority),
            Trash::new(trash_root, TrashLayout::Holding),
        );
        Installer::new(verifier, file_ops, config)
    }

    fn legacy_installer(&self) -> Installer {
        self.installer(SignatureVerifier::with_platform(Arc::new(NoCodeSigning)))
    }

    fn installed_version(&self) -> String {
        BundleReference::load(self.host.path())
            .unwrap()
            .version()
            .to_string()
    }

    fn trashed_count(&self) -> usize {
        fs::read_dir(self.trash_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn write_bundle(path: &Path, version: &str, key: Option<&SigningKey>) {
    let mut info = BundleInfo::new(IDENTIFIER, version);
    info.name = Some("Example".to_string());
    info.public_ed_key = key.map(|k| hex::encode(k.verifying_key().to_bytes()));
    info.write_to(path).unwrap();
    let bin = path.join("Contents").join("MacOS");
    fs::create_dir_all(&bin).unwrap();
    fs::write(bin.join("example"), format!("build {version}")).unwrap();
}

#[test]
fn test_sync_install_replaces_host() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let delegate = Arc::new(RecordingDelegate::default());

    let handle = fixture
        .legacy_installer()
        .install(InstallationRequest::new(&updates, fixture.host.clone()), delegate.clone());

    assert_eq!(
        handle.state(),
        InstallState::Completed(InstallStatus::Succeeded(fixture.host.path().to_path_buf()))
    );
    assert_eq!(fixture.installed_version(), "2.0");
    assert_eq!(
        fs::read_to_string(fixture.host.path().join("Contents/MacOS/example")).unwrap(),
        "build 2.0"
    );
    assert_eq!(fixture.trashed_count(), 1);
    assert!(!updates.exists(), "update folder is removed after install");
    assert_eq!(delegate.succeeded.lock().unwrap().len(), 1);
    assert_eq!(delegate.calls(), 1);
}

#[test]
fn test_downgrade_rejected_without_mutation() {
    let fixture = Fixture::new("2.0.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "1.9.0", true);
    let before = updraft_install::bundle_digest(fixture.host.path()).unwrap();
    let delegate = Arc::new(RecordingDelegate::default());

    let handle = fixture
        .legacy_installer()
        .install(InstallationRequest::new(&updates, fixture.host.clone()), delegate.clone());

    assert_eq!(
        handle.state(),
        InstallState::Completed(InstallStatus::Failed(ErrorKind::DowngradeRejected))
    );
    assert_eq!(updraft_install::bundle_digest(fixture.host.path()).unwrap(), before);
    assert!(updates.join("Example.app").exists());
    assert_eq!(fixture.trashed_count(), 0);
    assert_eq!(*delegate.failed.lock().unwrap(), vec![ErrorKind::DowngradeRejected]);
    assert_eq!(delegate.calls(), 1);
}

#[test]
fn test_equal_version_rejected() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "1.0", true);

    let outcome = fixture
        .legacy_installer()
        .run(InstallationRequest::new(&updates, fixture.host.clone()));
    assert_eq!(outcome.kind(), Some(ErrorKind::DowngradeRejected));
}

#[test]
fn test_downgrade_allowed_by_request() {
    let fixture = Fixture::new("2.0.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "1.9.0", true);

    let outcome = fixture.legacy_installer().run(
        InstallationRequest::new(&updates, fixture.host.clone()).allow_downgrade(true),
    );
    assert!(outcome.is_success());
    assert_eq!(fixture.installed_version(), "1.9.0");
}

#[test]
fn test_missing_candidate() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");

    let outcome = fixture
        .legacy_installer()
        .run(InstallationRequest::new(&updates, fixture.host.clone()));
    assert_eq!(outcome.kind(), Some(ErrorKind::AmbiguousOrMissingCandidate));
    assert_eq!(fixture.installed_version(), "1.0");
}

#[test]
fn test_two_candidates_are_ambiguous() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let second = updates.join("Example Copy.app");
    write_bundle(&second, "2.1", None);

    let outcome = fixture
        .legacy_installer()
        .run(InstallationRequest::new(&updates, fixture.host.clone()));
    assert!(matches!(
        outcome.into_result(),
        Err(InstallError::AmbiguousCandidate { ref candidates, .. }) if candidates.len() == 2
    ));
    assert_eq!(fixture.installed_version(), "1.0");
}

#[test]
fn test_unsigned_candidate_rejected_without_mutation() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", false);

    let outcome = fixture
        .legacy_installer()
        .run(InstallationRequest::new(&updates, fixture.host.clone()));
    assert_eq!(outcome.kind(), Some(ErrorKind::SignatureInvalid));
    assert_eq!(fixture.installed_version(), "1.0");
    assert_eq!(fixture.trashed_count(), 0);
}

#[test]
fn test_tampered_candidate_rejected() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    let candidate = fixture.add_candidate(&updates, "2.0", true);
    fs::write(candidate.join("Contents/MacOS/example"), "build 2.0 with extras").unwrap();

    let outcome = fixture
        .legacy_installer()
        .run(InstallationRequest::new(&updates, fixture.host.clone()));
    assert_eq!(outcome.kind(), Some(ErrorKind::SignatureInvalid));
}

#[test]
fn test_feed_signature_is_used() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    let candidate = fixture.add_candidate(&updates, "2.0", false);
    let signature = updraft_install::sign_bundle(&fixture.key, &candidate).unwrap();

    let outcome = fixture.legacy_installer().run(
        InstallationRequest::new(&updates, fixture.host.clone()).with_update_signature(signature),
    );
    assert!(outcome.is_success());
}

#[test]
fn test_install_to_new_destination() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let destination = fixture.temp.path().join("Elsewhere.app");

    let installed = fixture
        .legacy_installer()
        .run(InstallationRequest::new(&updates, fixture.host.clone()).with_destination(&destination))
        .into_result()
        .unwrap();

    assert_eq!(installed, destination);
    assert_eq!(fixture.trashed_count(), 0);
    assert_eq!(fixture.installed_version(), "1.0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_install_completes() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let delegate = Arc::new(RecordingDelegate::default());

    let mut handle = fixture.legacy_installer().install(
        InstallationRequest::new(&updates, fixture.host.clone()).synchronous(false),
        delegate.clone(),
    );
    let state = handle.completed().await;

    assert_eq!(
        state,
        InstallState::Completed(InstallStatus::Succeeded(fixture.host.path().to_path_buf()))
    );
    assert_eq!(delegate.succeeded.lock().unwrap().len(), 1);
    assert_eq!(delegate.calls(), 1);
    assert_eq!(fixture.installed_version(), "2.0");
}

#[test]
fn test_async_install_without_runtime() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let delegate = Arc::new(RecordingDelegate::default());

    let handle = fixture.legacy_installer().install(
        InstallationRequest::new(&updates, fixture.host.clone()).synchronous(false),
        delegate.clone(),
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.state().is_completed() {
        assert!(Instant::now() < deadline, "install did not complete");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(delegate.calls(), 1);
    assert_eq!(fixture.installed_version(), "2.0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_before_staging() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let delegate = Arc::new(RecordingDelegate::default());
    let platform = Arc::new(SlowTeamSigning {
        delay: Duration::from_millis(200),
        ..Default::default()
    });

    let mut handle = fixture.installer(SignatureVerifier::with_platform(platform)).install(
        InstallationRequest::new(&updates, fixture.host.clone()).synchronous(false),
        delegate.clone(),
    );
    handle.cancel();
    let state = handle.completed().await;

    assert_eq!(
        state,
        InstallState::Completed(InstallStatus::Failed(ErrorKind::Cancelled))
    );
    assert_eq!(*delegate.failed.lock().unwrap(), vec![ErrorKind::Cancelled]);
    assert_eq!(fixture.installed_version(), "1.0");
    assert_eq!(fixture.trashed_count(), 0);
}

#[test]
fn test_concurrent_installs_are_serialized() {
    let fixture = Fixture::new("1.0");
    let first = fixture.updates("updates-a");
    let second = fixture.updates("updates-b");
    fixture.add_candidate(&first, "2.0", true);
    fixture.add_candidate(&second, "2.0", true);
    let platform = Arc::new(SlowTeamSigning {
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    let installer = fixture.installer(SignatureVerifier::with_platform(platform.clone()));

    let threads: Vec<_> = [first, second]
        .into_iter()
        .map(|folder| {
            let installer = installer.clone();
            let request = InstallationRequest::new(folder, fixture.host.clone());
            std::thread::spawn(move || installer.run(request))
        })
        .collect();
    for thread in threads {
        assert!(thread.join().unwrap().is_success());
    }

    assert_eq!(platform.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.installed_version(), "2.0");
    assert_eq!(fixture.trashed_count(), 2);
}

#[cfg(unix)]
#[test]
fn test_failed_copy_restores_previous_version() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    let candidate = fixture.add_candidate(&updates, "2.0", false);
    // Sockets cannot be opened for reading, so the copy fails part way.
    let _socket =
        std::os::unix::net::UnixListener::bind(candidate.join("Contents").join("sock")).unwrap();

    let platform = Arc::new(SlowTeamSigning::default());
    let outcome = fixture
        .installer(SignatureVerifier::with_platform(platform))
        .run(InstallationRequest::new(&updates, fixture.host.clone()));

    match outcome.into_result() {
        Err(InstallError::FileCopy { restored, .. }) => assert_eq!(restored, Some(true)),
        other => panic!("expected a copy failure, got {other:?}"),
    }
    assert_eq!(fixture.installed_version(), "1.0");
    assert_eq!(fixture.trashed_count(), 0);
    assert!(updates.exists(), "update folder is kept after a failure");
}

#[test]
fn test_unusable_trash_does_not_block_install() {
    let fixture = Fixture::new("1.0");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let blocker = fixture.temp.path().join("not-a-directory");
    fs::write(&blocker, "plain file").unwrap();
    let delegate = Arc::new(RecordingDelegate::default());

    let handle = fixture
        .installer_with(
            SignatureVerifier::with_platform(Arc::new(NoCodeSigning)),
            blocker.join("trash"),
            InstallerConfig::default(),
        )
        .install(InstallationRequest::new(&updates, fixture.host.clone()), delegate.clone());

    assert_eq!(
        handle.state(),
        InstallState::Completed(InstallStatus::Succeeded(fixture.host.path().to_path_buf()))
    );
    assert_eq!(
        *delegate.succeeded.lock().unwrap(),
        vec![fixture.host.path().to_path_buf()]
    );
    assert_eq!(delegate.calls(), 1);
    assert_eq!(fixture.installed_version(), "2.0");
    assert!(blocker.is_file());
}

#[test]
fn test_normalized_name_trashes_existing_occupant() {
    let fixture = Fixture::with_host_name("1.0", "Example 1.0.app");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let applications = fixture.temp.path().join("Applications");
    let occupant = applications.join("Example.app");
    fs::create_dir_all(occupant.join("Contents")).unwrap();
    fs::write(occupant.join("Contents").join("user-data"), "keep me").unwrap();

    let mut config = InstallerConfig::default();
    config.staging.normalize_installed_name = true;
    let installed = fixture
        .installer_with(
            SignatureVerifier::with_platform(Arc::new(NoCodeSigning)),
            fixture.trash_root(),
            config,
        )
        .run(InstallationRequest::new(&updates, fixture.host.clone()))
        .into_result()
        .unwrap();

    assert_eq!(installed, occupant);
    assert_eq!(BundleReference::load(&occupant).unwrap().version(), "2.0");
    assert!(!fixture.host.path().exists());
    assert_eq!(fixture.trashed_count(), 2);
    let kept = fixture.trash_root().join("Example.app").join("Contents").join("user-data");
    assert_eq!(fs::read_to_string(kept).unwrap(), "keep me");
}

#[test]
fn test_normalized_name_refuses_when_occupant_cannot_be_trashed() {
    let fixture = Fixture::with_host_name("1.0", "Example 1.0.app");
    let updates = fixture.updates("updates");
    fixture.add_candidate(&updates, "2.0", true);
    let occupant = fixture.temp.path().join("Applications").join("Example.app");
    fs::create_dir_all(occupant.join("Contents")).unwrap();
    fs::write(occupant.join("Contents").join("user-data"), "keep me").unwrap();
    let blocker = fixture.temp.path().join("not-a-directory");
    fs::write(&blocker, "plain file").unwrap();

    let mut config = InstallerConfig::default();
    config.staging.normalize_installed_name = true;
    let outcome = fixture
        .installer_with(
            SignatureVerifier::with_platform(Arc::new(NoCodeSigning)),
            blocker.join("trash"),
            config,
        )
        .run(InstallationRequest::new(&updates, fixture.host.clone()));

    assert_eq!(outcome.kind(), Some(ErrorKind::TrashFailure));
    assert_eq!(
        fs::read_to_string(occupant.join("Contents").join("user-data")).unwrap(),
        "keep me"
    );
    assert_eq!(fixture.installed_version(), "1.0");
}
