//! CLI command definitions and argument parsing

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use updraft_install::verify::platform_verifier;
use updraft_install::{
    bundle_digest, locate_candidate, sign_bundle, update_folder, write_bundle_signature,
    BundleMetadata, BundleReference, InstallError, InstallState, InstallStatus,
    InstallationRequest, Installer, InstallerDelegate, SemverComparator, SignatureVerifier,
    StandardVersionComparator, TrustPath, VerificationOutcome, VersionComparator,
};

use crate::config::Config;
use crate::keys;
use crate::ExitCode;

/// Updraft helper - verify and install application updates
#[derive(Parser, Debug)]
#[command(name = "updraft-helper")]
#[command(version, about = "Updraft helper - verify and install application updates")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug mode (full tracing of every step)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true, env = "UPDRAFT_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Execute the CLI command with the default configuration
    pub async fn execute(self) -> anyhow::Result<ExitCode> {
        let config = Config::load_default().unwrap_or_default();
        self.execute_with_config(config).await
    }

    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        match self.command {
            Commands::Install(args) => args.execute(&config).await,
            Commands::Verify(args) => args.execute(&config),
            Commands::Locate(args) => args.execute(&config),
            Commands::UpdateFolder(args) => args.execute(&config),
            Commands::Compare(args) => Ok(args.execute()),
            Commands::Digest(args) => args.execute(),
            Commands::Sign(args) => args.execute(),
            Commands::Keygen(args) => args.execute(),
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify and install an extracted update over the application bundle
    Install(InstallArgs),
    /// Verify a candidate bundle against the application without installing
    Verify(VerifyArgs),
    /// Find the update bundle in an update folder
    Locate(LocateArgs),
    /// Print (and create) the update folder for the application
    UpdateFolder(HostArgs),
    /// Compare two version strings
    Compare(CompareArgs),
    /// Print the canonical digest of a bundle
    Digest(DigestArgs),
    /// Sign a bundle with an Ed25519 private key
    Sign(SignArgs),
    /// Generate an Ed25519 signing key
    Keygen(KeygenArgs),
}

/// Selects the installed application bundle
#[derive(Args, Debug, Clone, Default)]
pub struct HostArgs {
    /// Installed application bundle (default: the bundle enclosing this executable)
    #[arg(long)]
    pub host: Option<PathBuf>,
}

impl HostArgs {
    /// Load the host bundle.
    pub fn load(&self) -> anyhow::Result<BundleReference> {
        match &self.host {
            Some(path) => BundleReference::load(path)
                .with_context(|| format!("cannot load host bundle {}", path.display())),
            None => BundleReference::for_current_executable()
                .context("not running inside an application bundle; pass --host"),
        }
    }

    fn execute(self, config: &Config) -> anyhow::Result<ExitCode> {
        let host = self.load()?;
        let folder = update_folder(&host, &config.installer)
            .context("cannot prepare the update folder")?;
        println!("{}", folder.display());
        Ok(ExitCode::Success)
    }
}

/// Arguments for `install`
#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Folder holding the extracted update (default: the application's update folder)
    pub source: Option<PathBuf>,

    #[command(flatten)]
    pub host: HostArgs,

    /// Install location (default: the host bundle's path)
    #[arg(long)]
    pub destination: Option<PathBuf>,

    /// Install even if the update is not newer than the installed version
    #[arg(long)]
    pub allow_downgrade: bool,

    /// Hex Ed25519 signature published alongside the update
    #[arg(long)]
    pub signature: Option<String>,

    /// Compare versions with semantic-versioning rules
    #[arg(long)]
    pub semver: bool,
}

/// Reports the outcome of an install on the console.
struct ConsoleDelegate;

impl InstallerDelegate for ConsoleDelegate {
    fn installation_succeeded(&self, host: &BundleReference, installed_path: &Path) {
        println!(
            "Installed update for {} at {}",
            host.name(),
            installed_path.display()
        );
    }

    fn installation_failed(&self, host: &BundleReference, error: &InstallError) {
        eprintln!("{} ({})", error.user_message(), host.name());
        eprintln!("Error: {error}");
    }
}

impl InstallArgs {
    /// Build the install request for `host`.
    pub fn request(
        &self,
        host: Arc<BundleReference>,
        config: &Config,
    ) -> anyhow::Result<InstallationRequest> {
        let source = match &self.source {
            Some(source) => source.clone(),
            None => update_folder(host.as_ref(), &config.installer)
                .context("cannot prepare the update folder")?,
        };

        let mut request = InstallationRequest::new(source, host)
            .synchronous(false)
            .allow_downgrade(self.allow_downgrade);
        if let Some(destination) = &self.destination {
            request = request.with_destination(destination.clone());
        }
        if let Some(signature) = &self.signature {
            request = request.with_update_signature(signature.clone());
        }
        if self.semver {
            request = request.with_comparator(Arc::new(SemverComparator));
        }
        Ok(request)
    }

    async fn execute(self, config: &Config) -> anyhow::Result<ExitCode> {
        let host = Arc::new(self.host.load()?);
        let request = self.request(host, config)?;
        let installer = Installer::from_config(config.installer.clone())
            .context("invalid installer configuration")?;

        let mut handle = installer.install(request, Arc::new(ConsoleDelegate));

        let mut progress = handle.subscribe();
        tokio::select! {
            _ = progress.wait_for(InstallState::is_completed) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling install");
                handle.cancel();
            }
        }

        Ok(match handle.completed().await {
            InstallState::Completed(InstallStatus::Succeeded(_)) => ExitCode::Success,
            InstallState::Completed(InstallStatus::Failed(kind)) => ExitCode::from(kind),
            _ => ExitCode::GeneralError,
        })
    }
}

/// Arguments for `verify`
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Candidate bundle to check
    pub candidate: PathBuf,

    #[command(flatten)]
    pub host: HostArgs,

    /// Hex Ed25519 signature published alongside the update
    #[arg(long)]
    pub signature: Option<String>,
}

impl VerifyArgs {
    fn execute(self, config: &Config) -> anyhow::Result<ExitCode> {
        let host = self.host.load()?;
        let candidate = BundleReference::load(&self.candidate)
            .with_context(|| format!("cannot load candidate {}", self.candidate.display()))?;
        let verifier =
            SignatureVerifier::from_config(platform_verifier(), &config.installer.security)
                .context("invalid security configuration")?;

        match verifier.verify_with_signature(&candidate, &host, self.signature.as_deref()) {
            VerificationOutcome::Verified(TrustPath::CodeSigning(identity)) => {
                println!("Verified: code signature from {}", identity.describe());
                Ok(ExitCode::Success)
            }
            VerificationOutcome::Verified(TrustPath::LegacyKey(key)) => {
                println!("Verified: Ed25519 signature from {}", keys::public_key_string(&key));
                Ok(ExitCode::Success)
            }
            VerificationOutcome::Failed(failure) => {
                eprintln!("Verification failed: {failure}");
                Ok(ExitCode::from(failure.kind()))
            }
        }
    }
}

/// Arguments for `locate`
#[derive(Args, Debug)]
pub struct LocateArgs {
    /// Folder to search (default: the application's update folder)
    pub folder: Option<PathBuf>,

    #[command(flatten)]
    pub host: HostArgs,

    /// Bundle identifier to look for (default: the host's identifier)
    #[arg(long)]
    pub identifier: Option<String>,
}

impl LocateArgs {
    fn execute(self, config: &Config) -> anyhow::Result<ExitCode> {
        let (folder, identifier) = match (self.folder, self.identifier) {
            (Some(folder), Some(identifier)) => (folder, identifier),
            (folder, identifier) => {
                let host = self.host.load()?;
                let folder = match folder {
                    Some(folder) => folder,
                    None => update_folder(&host, &config.installer)
                        .context("cannot prepare the update folder")?,
                };
                (folder, identifier.unwrap_or_else(|| host.identifier().to_string()))
            }
        };

        match locate_candidate(&folder, &identifier) {
            Ok(candidate) => {
                println!("{} {}", candidate.path().display(), candidate.version());
                Ok(ExitCode::Success)
            }
            Err(e) => {
                eprintln!("Error: {e}");
                Ok(ExitCode::from(e.kind()))
            }
        }
    }
}

/// Arguments for `compare`
#[derive(Args, Debug)]
pub struct CompareArgs {
    /// First version
    pub a: String,

    /// Second version
    pub b: String,

    /// Use semantic-versioning rules
    #[arg(long)]
    pub semver: bool,
}

impl CompareArgs {
    /// Order `a` relative to `b`.
    pub fn ordering(&self) -> Ordering {
        let comparator: &dyn VersionComparator = if self.semver {
            &SemverComparator
        } else {
            &StandardVersionComparator
        };
        comparator.compare_versions(&self.a, &self.b)
    }

    fn execute(self) -> ExitCode {
        let symbol = match self.ordering() {
            Ordering::Less => "<",
            Ordering::Equal => "=",
            Ordering::Greater => ">",
        };
        println!("{} {} {}", self.a, symbol, self.b);
        ExitCode::Success
    }
}

/// Arguments for `digest`
#[derive(Args, Debug)]
pub struct DigestArgs {
    /// Bundle to hash
    pub bundle: PathBuf,
}

impl DigestArgs {
    fn execute(self) -> anyhow::Result<ExitCode> {
        let digest = bundle_digest(&self.bundle)
            .with_context(|| format!("cannot hash {}", self.bundle.display()))?;
        println!("{}", hex::encode(digest));
        Ok(ExitCode::Success)
    }
}

/// Arguments for `sign`
#[derive(Args, Debug)]
pub struct SignArgs {
    /// Bundle to sign
    pub bundle: PathBuf,

    /// Private key file written by `keygen`
    #[arg(long, env = "UPDRAFT_SIGNING_KEY")]
    pub key: PathBuf,

    /// Store the signature inside the bundle instead of only printing it
    #[arg(long)]
    pub write: bool,
}

impl SignArgs {
    fn execute(self) -> anyhow::Result<ExitCode> {
        let key = match keys::load_signing_key(&self.key) {
            Ok(key) => key,
            Err(e) => {
                eprintln!("Error: {e}");
                return Ok(ExitCode::InvalidInput);
            }
        };

        let signature = if self.write {
            write_bundle_signature(&key, &self.bundle)
        } else {
            sign_bundle(&key, &self.bundle)
        }
        .with_context(|| format!("cannot sign {}", self.bundle.display()))?;

        println!("{signature}");
        Ok(ExitCode::Success)
    }
}

/// Arguments for `keygen`
#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Where to write the private key
    #[arg(long, short)]
    pub output: PathBuf,
}

impl KeygenArgs {
    fn execute(self) -> anyhow::Result<ExitCode> {
        let key = keys::generate_signing_key();
        keys::save_signing_key(&key, &self.output)
            .with_context(|| format!("cannot write key to {}", self.output.display()))?;

        println!("Private key written to {}", self.output.display());
        println!("Public key: {}", keys::public_key_string(&key.verifying_key()));
        Ok(ExitCode::Success)
    }
}
