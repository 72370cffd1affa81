//! Advisory-locked run-directory pidfile (§6.5, §6.1 "Persisted state").
//!
//! Both daemons in this workspace (`wdmd`, `clusterfence-resetd`) need
//! the same guarantee: only one instance may run against a given
//! run-directory at a time, and a crashed instance's stale pidfile must
//! not block a fresh start. `flock(2)` on an always-kept-open descriptor
//! gives both for free — the lock releases the moment the holding
//! process exits, cleanly or not.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PidfileError {
    #[error("failed to create run directory {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),

    #[error("failed to open pidfile {0}: {1}")]
    Open(PathBuf, #[source] std::io::Error),

    #[error("another instance holds the lock on {0}")]
    AlreadyLocked(PathBuf),

    #[error("failed to write pid to {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
}

/// A held advisory lock on `<run_dir>/<name>.pid`. Dropping this (or the
/// process exiting for any reason) releases the lock.
pub struct Pidfile {
    // Kept open for the lifetime of the lock; never read after acquire.
    _file: std::fs::File,
    path: PathBuf,
}

impl Pidfile {
    /// Create `run_dir` if needed, then take an exclusive non-blocking
    /// `flock` on `<run_dir>/<name>.pid` and write the current pid into
    /// it. Fails immediately if another instance already holds the
    /// lock, rather than waiting.
    pub fn acquire(run_dir: &Path, name: &str) -> Result<Self, PidfileError> {
        std::fs::create_dir_all(run_dir)
            .map_err(|e| PidfileError::CreateDir(run_dir.to_path_buf(), e))?;
        let path = run_dir.join(format!("{name}.pid"));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o644)
            .open(&path)
            .map_err(|e| PidfileError::Open(path.clone(), e))?;

        // SAFETY: `file`'s fd is valid for the duration of this call.
        let rv = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rv != 0 {
            return Err(PidfileError::AlreadyLocked(path));
        }

        file.set_len(0)
            .and_then(|()| write!(file, "{}", std::process::id()))
            .map_err(|e| PidfileError::Write(path.clone(), e))?;

        Ok(Self { _file: file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_run_dir_and_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let pidfile = Pidfile::acquire(&run_dir, "wdmd").unwrap();
        assert_eq!(pidfile.path(), run_dir.join("wdmd.pid"));

        let contents = std::fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn second_acquire_in_same_process_is_refused() {
        // flock is per-open-file-description: a second independent open
        // of the same path contends for the same lock even though it's
        // the same process, matching two instances racing on startup.
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let _first = Pidfile::acquire(&run_dir, "wdmd").unwrap();
        let err = Pidfile::acquire(&run_dir, "wdmd").unwrap_err();
        assert!(matches!(err, PidfileError::AlreadyLocked(_)));
    }

    #[test]
    fn releasing_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        {
            let _first = Pidfile::acquire(&run_dir, "wdmd").unwrap();
        }
        let _second = Pidfile::acquire(&run_dir, "wdmd").unwrap();
    }
}
