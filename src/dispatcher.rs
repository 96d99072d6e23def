//! Dispatcher runner (C12): validated invocation of external helper
//! scripts for connection up/down notification, FCC-unlock, and
//! modem-setup (spec.md §4.12). The original splits these into three
//! distinct source files sharing one validated-invocation base
//! (`mm-dispatcher-connection.c`, `-fcc-unlock.c`, `-modem-setup.c`, and
//! `mm-dispatcher.c`); this crate keeps that split as `DispatcherKind`.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{info, warn};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::Error;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    Connection,
    FccUnlock,
    ModemSetup,
}

impl DispatcherKind {
    fn script_basename(self) -> &'static str {
        match self {
            DispatcherKind::Connection => "connection",
            DispatcherKind::FccUnlock => "fcc-unlock",
            DispatcherKind::ModemSetup => "modem-setup",
        }
    }
}

pub struct Dispatcher {
    sysconfdir: PathBuf,
    libdir: PathBuf,
}

impl Dispatcher {
    pub fn new(sysconfdir: impl Into<PathBuf>, libdir: impl Into<PathBuf>) -> Self {
        Self { sysconfdir: sysconfdir.into(), libdir: libdir.into() }
    }

    /// Candidate script directories in priority order: user-installed
    /// (sysconfdir) then vendor-installed (libdir).
    fn candidate_dirs(&self, kind: DispatcherKind) -> Vec<PathBuf> {
        let sub = kind.script_basename();
        vec![self.sysconfdir.join(sub), self.libdir.join(sub)]
    }

    /// Validate a candidate file per spec.md §4.12: must exist, be a
    /// regular file (or a non-`/dev/null` symlink to one), owned by root,
    /// not group/world-writable, not set-UID, and owner-executable.
    fn validate_file(path: &Path) -> Result<(), String> {
        if path.is_symlink() {
            let target = std::fs::read_link(path).map_err(|e| e.to_string())?;
            if target == Path::new("/dev/null") {
                return Err(format!("{} is a symlink to /dev/null", path.display()));
            }
        }
        let metadata = std::fs::metadata(path).map_err(|e| e.to_string())?;
        if !metadata.is_file() {
            return Err(format!("{} is not a regular file", path.display()));
        }
        if metadata.len() == 0 {
            return Err(format!("{} is empty", path.display()));
        }
        if metadata.uid() != 0 {
            return Err(format!("{} is not owned by root", path.display()));
        }
        let mode = metadata.permissions().mode();
        if mode & 0o022 != 0 {
            return Err(format!("{} is writable by group or other", path.display()));
        }
        if mode & 0o4000 != 0 {
            return Err(format!("{} is set-UID", path.display()));
        }
        if mode & 0o100 == 0 {
            return Err(format!("{} is not executable by its owner", path.display()));
        }
        Ok(())
    }

    async fn run_script(path: &Path, argv: &[String]) -> Result<(), Error> {
        let mut command = Command::new(path);
        command.args(argv).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = command.spawn().map_err(|e| Error::DispatcherFailed { reason: e.to_string() })?;

        match timeout(OPERATION_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(Error::DispatcherFailed { reason: format!("exited with {status}") }),
            Ok(Err(e)) => Err(Error::DispatcherFailed { reason: e.to_string() }),
            Err(_) => {
                let _ = child.start_kill();
                Err(Error::DispatcherFailed { reason: "timed out".into() })
            }
        }
    }

    /// Run the single applicable script for a one-shot operation
    /// (FCC-unlock, modem-setup): the first valid candidate across the
    /// priority-ordered directories is executed.
    pub async fn run_one(&self, kind: DispatcherKind, argv: &[String]) -> Result<(), Error> {
        for dir in self.candidate_dirs(kind) {
            let path = dir;
            if !path.exists() {
                continue;
            }
            match Self::validate_file(&path) {
                Ok(()) => return Self::run_script(&path, argv).await,
                Err(reason) => warn!("dispatcher candidate {} skipped: {reason}", path.display()),
            }
        }
        Err(Error::DispatcherFailed { reason: "no valid dispatcher script found".into() })
    }

    /// Run every valid connection-dispatcher script. Per-script failures
    /// are counted; the overall operation succeeds iff at least one script
    /// ran and none failed (spec.md §4.12).
    pub async fn run_connection(&self, argv: &[String]) -> Result<(), Error> {
        let mut ran = 0usize;
        let mut failed = 0usize;
        for dir in self.candidate_dirs(DispatcherKind::Connection) {
            if !dir.exists() {
                continue;
            }
            match Self::validate_file(&dir) {
                Ok(()) => {
                    ran += 1;
                    if let Err(e) = Self::run_script(&dir, argv).await {
                        warn!("connection dispatcher {} failed: {e}", dir.display());
                        failed += 1;
                    } else {
                        info!("connection dispatcher {} ran successfully", dir.display());
                    }
                }
                Err(reason) => warn!("dispatcher candidate {} skipped: {reason}", dir.display()),
            }
        }
        if ran == 0 {
            return Err(Error::DispatcherFailed { reason: "no connection dispatcher scripts ran".into() });
        }
        if failed > 0 {
            return Err(Error::DispatcherFailed { reason: format!("{failed} of {ran} dispatcher scripts failed") });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cellbroker-dispatcher-test-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn rejects_world_writable_script() {
        let dir = tmp_dir("writable");
        let script = dir.join("connection");
        fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&script, std::fs::Permissions::from_mode(0o777)).unwrap();
        let err = Dispatcher::validate_file(&script).unwrap_err();
        assert!(err.contains("writable"));
    }

    #[test]
    fn rejects_dev_null_symlink() {
        let dir = tmp_dir("devnull");
        let script = dir.join("connection");
        symlink("/dev/null", &script).unwrap();
        let err = Dispatcher::validate_file(&script).unwrap_err();
        assert!(err.contains("/dev/null"));
    }

    #[test]
    fn rejects_setuid() {
        let dir = tmp_dir("setuid");
        let script = dir.join("connection");
        fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&script, std::fs::Permissions::from_mode(0o4755)).unwrap();
        let err = Dispatcher::validate_file(&script).unwrap_err();
        assert!(err.contains("set-UID"));
    }
}
