//! Administrator authorization.
//!
//! Privileged retries go through an [`Authority`], which hands out one
//! [`AuthorizationGuard`] per escalated operation. The guard releases the
//! authorization when it is dropped, so nothing is cached between calls.
//!
//! [`CommandAuthority`] is the system implementation: `pkexec` on Linux and
//! `osascript ... with administrator privileges` on macOS. Both prompt the user
//! for every command they run.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, info};

use crate::error::InstallError;

/// A filesystem operation run with administrator rights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevatedOp {
    /// Copy `src` into a staging sibling of `dst`, then swap it into place
    Copy { src: PathBuf, dst: PathBuf },
    /// Recursively remove `path`
    Remove { path: PathBuf },
    /// Rename `src` to `dst`, used to move items in and out of the trash
    Move { src: PathBuf, dst: PathBuf },
}

impl ElevatedOp {
    /// Build the error reported when the elevated operation itself fails.
    pub fn failure(&self, source: io::Error) -> InstallError {
        match self {
            ElevatedOp::Copy { src, dst } => InstallError::FileCopy {
                src: src.clone(),
                dst: dst.clone(),
                restored: None,
                source,
            },
            ElevatedOp::Remove { path } => InstallError::Remove {
                path: path.clone(),
                source,
            },
            ElevatedOp::Move { src, .. } => InstallError::Trash {
                path: src.clone(),
                source,
            },
        }
    }
}

/// An acquired administrator authorization.
pub trait Authorization: Send {
    /// Run one operation with elevated rights.
    fn perform(&mut self, op: &ElevatedOp) -> Result<(), InstallError>;

    /// Give up the authorization.
    fn release(&mut self) {}
}

/// Source of administrator authorizations.
pub trait Authority: Send + Sync {
    /// Prompt for authorization. Blocks until the user answers.
    ///
    /// # Errors
    ///
    /// - [`InstallError::AuthorizationDenied`] if the user refuses
    /// - [`InstallError::AuthorizationToolMissing`] if the system offers no
    ///   way to ask
    fn acquire(&self, prompt: &str) -> Result<AuthorizationGuard, InstallError>;
}

/// Scoped authorization, released on drop.
pub struct AuthorizationGuard {
    inner: Option<Box<dyn Authorization>>,
}

impl AuthorizationGuard {
    /// Wrap an acquired authorization.
    pub fn new(authorization: Box<dyn Authorization>) -> Self {
        Self {
            inner: Some(authorization),
        }
    }

    /// Run one operation under this authorization.
    pub fn perform(&mut self, op: &ElevatedOp) -> Result<(), InstallError> {
        match self.inner.as_mut() {
            Some(authorization) => authorization.perform(op),
            None => Err(InstallError::AuthorizationDenied(
                "authorization already released".to_string(),
            )),
        }
    }
}

impl Drop for AuthorizationGuard {
    fn drop(&mut self) {
        if let Some(mut authorization) = self.inner.take() {
            authorization.release();
            debug!("Administrator authorization released");
        }
    }
}

impl std::fmt::Debug for AuthorizationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationGuard")
            .field("active", &self.inner.is_some())
            .finish()
    }
}

/// Authority that never grants anything. Used where escalation is not
/// wanted, such as tests and unattended runs.
#[derive(Debug, Clone, Default)]
pub struct NoAuthority;

impl Authority for NoAuthority {
    fn acquire(&self, _prompt: &str) -> Result<AuthorizationGuard, InstallError> {
        Err(InstallError::AuthorizationToolMissing(
            "administrator escalation is disabled".to_string(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tool {
    Pkexec(PathBuf),
    Osascript(PathBuf),
}

/// Authority backed by the system's authorization command.
#[derive(Debug, Clone)]
pub struct CommandAuthority {
    tool: Option<Tool>,
}

impl CommandAuthority {
    /// Look up the authorization tool for this platform on `PATH`.
    pub fn detect() -> Self {
        let tool = if cfg!(target_os = "macos") {
            which::which("osascript").ok().map(Tool::Osascript)
        } else if cfg!(unix) {
            which::which("pkexec").ok().map(Tool::Pkexec)
        } else {
            None
        };
        debug!(tool = ?tool, "Detected authorization tool");
        Self { tool }
    }

    /// Whether an authorization tool was found.
    pub fn is_available(&self) -> bool {
        self.tool.is_some()
    }
}

impl Default for CommandAuthority {
    fn default() -> Self {
        Self::detect()
    }
}

impl Authority for CommandAuthority {
    fn acquire(&self, prompt: &str) -> Result<AuthorizationGuard, InstallError> {
        let tool = self.tool.clone().ok_or_else(|| {
            InstallError::AuthorizationToolMissing(
                "neither pkexec nor osascript is available".to_string(),
            )
        })?;
        info!(prompt = %prompt, "Requesting administrator authorization");
        Ok(AuthorizationGuard::new(Box::new(CommandAuthorization {
            tool,
            prompt: prompt.to_string(),
        })))
    }
}

struct CommandAuthorization {
    tool: Tool,
    prompt: String,
}

impl Authorization for CommandAuthorization {
    fn perform(&mut self, op: &ElevatedOp) -> Result<(), InstallError> {
        let (script, args) = shell_script(op);
        let output = match &self.tool {
            Tool::Pkexec(pkexec) => Command::new(pkexec)
                .arg("/bin/sh")
                .arg("-c")
                .arg(script)
                .arg("sh")
                .args(&args)
                .output(),
            Tool::Osascript(osascript) => {
                let command = inline_args(script, &args);
                let apple_script = format!(
                    r#"do shell script "{}" with prompt "{}" with administrator privileges"#,
                    escape_applescript(&command),
                    escape_applescript(&self.prompt)
                );
                Command::new(osascript).arg("-e").arg(&apple_script).output()
            }
        }
        .map_err(|e| op.failure(e))?;

        check_output(&self.tool, op, &output)
    }
}

fn check_output(tool: &Tool, op: &ElevatedOp, output: &Output) -> Result<(), InstallError> {
    if output.status.success() {
        debug!(op = ?op, "Elevated operation completed");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let denied = match tool {
        // 126: dialog dismissed, 127: not authorized
        Tool::Pkexec(_) => matches!(output.status.code(), Some(126) | Some(127)),
        Tool::Osascript(_) => stderr.contains("-128") || stderr.contains("User canceled"),
    };
    if denied {
        return Err(InstallError::AuthorizationDenied(if stderr.is_empty() {
            "the request was cancelled".to_string()
        } else {
            stderr
        }));
    }

    Err(op.failure(io::Error::new(
        io::ErrorKind::Other,
        format!("elevated command failed ({}): {}", output.status, stderr),
    )))
}

/// Staging location used by elevated copies.
fn elevated_staging_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{}.updraft-staging", name))
}

/// A failed `cp` leaves nothing behind at the staging path.
const COPY_SCRIPT: &str =
    r#"rm -rf "$2" && { cp -pR "$1" "$2" || { rm -rf "$2"; exit 1; }; } && rm -rf "$3" && mv "$2" "$3""#;

fn shell_script(op: &ElevatedOp) -> (&'static str, Vec<PathBuf>) {
    match op {
        ElevatedOp::Copy { src, dst } => (
            COPY_SCRIPT,
            vec![src.clone(), elevated_staging_path(dst), dst.clone()],
        ),
        ElevatedOp::Remove { path } => (r#"rm -rf "$1""#, vec![path.clone()]),
        ElevatedOp::Move { src, dst } => (r#"mv "$1" "$2""#, vec![src.clone(), dst.clone()]),
    }
}

/// Substitute positional parameters for tools that take a single command
/// string.
fn inline_args(script: &str, args: &[PathBuf]) -> String {
    args.iter()
        .enumerate()
        .fold(script.to_string(), |acc, (i, arg)| {
            acc.replace(&format!("\"${}\"", i + 1), &shell_quote(arg))
        })
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Recording {
        released: Arc<AtomicBool>,
    }

    impl Authorization for Recording {
        fn perform(&mut self, _op: &ElevatedOp) -> Result<(), InstallError> {
            Ok(())
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        {
            let mut guard = AuthorizationGuard::new(Box::new(Recording {
                released: released.clone(),
            }));
            guard
                .perform(&ElevatedOp::Remove {
                    path: PathBuf::from("/tmp/x"),
                })
                .unwrap();
            assert!(!released.load(Ordering::SeqCst));
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missing_tool() {
        let authority = CommandAuthority { tool: None };
        assert!(!authority.is_available());
        let err = authority.acquire("prompt").unwrap_err();
        assert!(matches!(err, InstallError::AuthorizationToolMissing(_)));
    }

    #[test]
    fn test_no_authority() {
        assert!(matches!(
            NoAuthority.acquire("prompt"),
            Err(InstallError::AuthorizationToolMissing(_))
        ));
    }

    #[test]
    fn test_inline_args_quotes_paths() {
        let (script, args) = shell_script(&ElevatedOp::Remove {
            path: PathBuf::from("/Applications/It's Here.app"),
        });
        assert_eq!(
            inline_args(script, &args),
            r#"rm -rf '/Applications/It'\''s Here.app'"#
        );
    }

    #[test]
    fn test_copy_script_stages_next_to_destination() {
        let (_, args) = shell_script(&ElevatedOp::Copy {
            src: PathBuf::from("/tmp/update/Example.app"),
            dst: PathBuf::from("/Applications/Example.app"),
        });
        assert_eq!(
            args[1],
            PathBuf::from("/Applications/.Example.app.updraft-staging")
        );
    }

    #[test]
    fn test_copy_script_cleans_staging_on_failure() {
        let (script, args) = shell_script(&ElevatedOp::Copy {
            src: PathBuf::from("/tmp/update/Example.app"),
            dst: PathBuf::from("/Applications/Example.app"),
        });
        assert_eq!(
            inline_args(script, &args),
            "rm -rf '/Applications/.Example.app.updraft-staging' && \
             { cp -pR '/tmp/update/Example.app' '/Applications/.Example.app.updraft-staging' \
             || { rm -rf '/Applications/.Example.app.updraft-staging'; exit 1; }; } && \
             rm -rf '/Applications/Example.app' && \
             mv '/Applications/.Example.app.updraft-staging' '/Applications/Example.app'"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_script_failed_copy_leaves_no_staging() {
        let temp = tempfile::TempDir::new().unwrap();
        let dst = temp.path().join("Example.app");
        std::fs::create_dir(&dst).unwrap();
        std::fs::write(dst.join("old"), "old").unwrap();
        let staging = elevated_staging_path(&dst);
        let (script, args) = shell_script(&ElevatedOp::Copy {
            src: temp.path().join("missing.app"),
            dst: dst.clone(),
        });

        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .arg("sh")
            .args(&args)
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();

        assert!(!status.success());
        assert!(!staging.exists());
        assert_eq!(std::fs::read_to_string(dst.join("old")).unwrap(), "old");
    }

    #[test]
    fn test_move_script_and_failure() {
        let op = ElevatedOp::Move {
            src: PathBuf::from("/Applications/Example.app"),
            dst: PathBuf::from("/home/me/.Trash/Example.app"),
        };
        let (script, args) = shell_script(&op);
        assert_eq!(
            inline_args(script, &args),
            "mv '/Applications/Example.app' '/home/me/.Trash/Example.app'"
        );
        assert!(matches!(
            op.failure(io::Error::from(io::ErrorKind::Other)),
            InstallError::Trash { ref path, .. } if path == Path::new("/Applications/Example.app")
        ));
    }

    #[test]
    fn test_escape_applescript() {
        assert_eq!(escape_applescript(r#"say "hi" \ bye"#), r#"say \"hi\" \\ bye"#);
    }

    #[cfg(unix)]
    #[test]
    fn test_denied_exit_codes() {
        use std::os::unix::process::ExitStatusExt;

        let op = ElevatedOp::Remove {
            path: PathBuf::from("/tmp/x"),
        };
        let tool = Tool::Pkexec(PathBuf::from("/usr/bin/pkexec"));
        let output = |code: i32| Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };

        assert!(matches!(
            check_output(&tool, &op, &output(126)),
            Err(InstallError::AuthorizationDenied(_))
        ));
        assert!(matches!(
            check_output(&tool, &op, &output(1)),
            Err(InstallError::Remove { .. })
        ));
        assert!(check_output(&tool, &op, &output(0)).is_ok());
    }
}
