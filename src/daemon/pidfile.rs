//! Single-instance guard: an `flock()`-held pidfile.
//!
//! Only needed when hpw runs outside systemd (which already guarantees a
//! single instance of the unit). The lock lives as long as the [`PidFile`].

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::core::errors::{HpwError, Result};

/// Exclusive lock on a pidfile containing this process's PID.
pub struct PidFile {
    path: PathBuf,
    _lock: Flock<File>,
}

impl PidFile {
    /// Lock `path` and write the current PID into it.
    ///
    /// Fails with `InstanceLocked` if another process holds the lock.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| HpwError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(|e| HpwError::io(path, e))?;

        #[allow(deprecated)]
        let mut lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(
            |(_file, errno)| match errno {
                Errno::EWOULDBLOCK => HpwError::InstanceLocked {
                    path: path.to_path_buf(),
                },
                other => HpwError::Runtime {
                    details: format!("failed to lock pidfile {}: {other}", path.display()),
                },
            },
        )?;

        // Truncate only after the lock is ours, so a losing contender never
        // wipes the winner's PID.
        lock.set_len(0).map_err(|e| HpwError::io(path, e))?;
        writeln!(lock, "{}", std::process::id()).map_err(|e| HpwError::io(path, e))?;
        lock.sync_data().map_err(|e| HpwError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/hpw.pid");
        let pidfile = PidFile::acquire(&path).unwrap();

        let contents = fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpw.pid");
        let _held = PidFile::acquire(&path).unwrap();

        let err = PidFile::acquire(&path).err().expect("second lock must fail");
        assert_eq!(err.code(), "HPW-3001");
        // The holder's PID survives the failed attempt.
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn drop_releases_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpw.pid");
        drop(PidFile::acquire(&path).unwrap());
        assert!(!path.exists());
        assert!(PidFile::acquire(&path).is_ok());
    }
}
