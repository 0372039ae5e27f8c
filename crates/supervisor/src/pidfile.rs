//! PID file handling.

use std::path::Path;

use gantry_core::error::{Error, Result};

/// Write the PID file, refusing when it names another live process.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if path.exists() {
        let existing = read_pid(path).ok_or_else(|| {
            Error::PidFile(format!("unable to read existing PID file {}", path.display()))
        })?;
        if existing != pid && pid_alive(existing) {
            return Err(Error::PidFile(format!(
                "the PID file {} already exists for {existing}",
                path.display()
            )));
        }
    }
    std::fs::write(path, pid.to_string()).map_err(Error::Io)
}

/// Remove the PID file iff its contents still name `pid`.
pub fn remove_pid_file(path: &Path, pid: u32) {
    if !path.exists() {
        return;
    }
    match read_pid(path) {
        Some(existing) if existing == pid => {
            let _ = std::fs::remove_file(path);
        }
        Some(_) => {}
        None => {
            tracing::error!(path = %path.display(), "unable to read PID file");
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse().ok())
}

/// Probe process liveness with a null signal.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Without a cheap liveness probe, err on the side of refusing startup.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.pid");
        let pid = std::process::id();

        write_pid_file(&path, pid).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), pid.to_string());

        remove_pid_file(&path, pid);
        assert!(!path.exists());
    }

    #[test]
    fn test_rewrite_own_pid_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.pid");
        let pid = std::process::id();
        write_pid_file(&path, pid).unwrap();
        write_pid_file(&path, pid).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_live_foreign_pid_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.pid");
        // PID 1 is always alive and never us.
        std::fs::write(&path, "1").unwrap();
        let err = write_pid_file(&path, std::process::id()).unwrap_err();
        assert!(matches!(err, Error::PidFile(_)));
    }

    #[test]
    fn test_stale_pid_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.pid");
        // A PID far above any real pid range on test machines.
        std::fs::write(&path, "999999999").unwrap();
        write_pid_file(&path, std::process::id()).unwrap();
    }

    #[test]
    fn test_unreadable_pid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(write_pid_file(&path, std::process::id()).is_err());
    }

    #[test]
    fn test_remove_preserves_foreign_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.pid");
        std::fs::write(&path, "424242").unwrap();
        remove_pid_file(&path, std::process::id());
        assert!(path.exists());
    }
}
