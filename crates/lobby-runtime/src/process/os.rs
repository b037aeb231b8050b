//! Thin OS leaves: spawn, liveness, signals, exit classification.
//!
//! Unix only. Every call here is non-blocking apart from `spawn`, which
//! returns as soon as the kernel has created the child.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::warn;

use lobby_core::error::LaunchFailure;
use lobby_core::process::ExitOutcome;

/// Check that `path` names an executable regular file.
pub fn preflight(path: &Path) -> Result<(), LaunchFailure> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(LaunchFailure::ExecutableMissing);
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(LaunchFailure::NotExecutable);
        }
        Err(_) => return Err(LaunchFailure::ExecutableMissing),
    };
    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(LaunchFailure::NotExecutable);
    }
    Ok(())
}

/// Spawn `exe` detached from our terminal: own process group, null stdio,
/// not killed when the handle drops. Returns the child and its PID.
pub fn spawn_detached(
    exe: &Path,
    args: &[String],
    working_directory: &Path,
) -> Result<(Child, u32), LaunchFailure> {
    preflight(exe)?;

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .current_dir(working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .kill_on_drop(false);

    let child = cmd.spawn().map_err(|e| {
        // Full OS detail goes to the log; callers only see the classification.
        warn!(error = %e, "spawn failed");
        classify_spawn_error(&e)
    })?;
    let pid = child.id().ok_or(LaunchFailure::SpawnRefused)?;
    Ok((child, pid))
}

fn classify_spawn_error(e: &io::Error) -> LaunchFailure {
    match e.kind() {
        io::ErrorKind::NotFound => LaunchFailure::ExecutableMissing,
        io::ErrorKind::PermissionDenied => LaunchFailure::NotExecutable,
        _ => LaunchFailure::SpawnRefused,
    }
}

/// Whether a process with this PID exists, via `kill(pid, 0)`.
///
/// EPERM means it exists but belongs to someone else.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Deliver `signal` to the process group led by `pid`.
///
/// Returns `Ok(false)` when the group no longer exists.
pub fn signal_group(pid: u32, signal: i32) -> io::Result<bool> {
    let pgid = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    if unsafe { libc::kill(-pgid, signal) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Classify a reaped exit status.
pub fn exit_outcome(status: ExitStatus) -> ExitOutcome {
    if let Some(code) = status.code() {
        ExitOutcome::Code(code)
    } else if let Some(signal) = status.signal() {
        ExitOutcome::Signal(signal)
    } else {
        ExitOutcome::Vanished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_preflight() {
        assert!(preflight(Path::new("/bin/true")).is_ok());
        assert_eq!(
            preflight(Path::new("/nonexistent/game.exe")),
            Err(LaunchFailure::ExecutableMissing)
        );
        assert_eq!(
            preflight(Path::new("/bin")),
            Err(LaunchFailure::NotExecutable)
        );
    }

    #[test]
    fn test_preflight_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.dat");
        std::fs::write(&path, b"not a program").unwrap();
        assert_eq!(preflight(&path), Err(LaunchFailure::NotExecutable));
    }

    #[test]
    fn test_is_pid_alive() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(999_999_999));
        assert!(!is_pid_alive(0));
    }

    #[tokio::test]
    async fn test_spawn_and_reap() {
        let (mut child, pid) =
            spawn_detached(Path::new("/bin/true"), &[], &PathBuf::from("/")).unwrap();
        assert!(pid > 0);
        let status = child.wait().await.unwrap();
        assert_eq!(exit_outcome(status), ExitOutcome::Code(0));
    }

    #[tokio::test]
    async fn test_signal_group_kills_sleep() {
        let (mut child, pid) = spawn_detached(
            Path::new("/bin/sleep"),
            &["30".to_string()],
            &PathBuf::from("/"),
        )
        .unwrap();
        assert!(signal_group(pid, libc::SIGKILL).unwrap());
        let status = child.wait().await.unwrap();
        let outcome = exit_outcome(status);
        assert_eq!(outcome, ExitOutcome::Signal(libc::SIGKILL));
        assert_eq!(outcome.code(), Some(137));
        assert!(!signal_group(pid, libc::SIGTERM).unwrap());
    }
}
