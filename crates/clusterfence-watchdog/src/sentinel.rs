//! Shared-memory sentinel object (§5, §6.5, §8, §9).
//!
//! Created with `O_EXCL` at startup and removed only on clean exit. Its
//! presence when a new instance starts indicates a prior unclean exit —
//! the new instance must refuse to start rather than risk defeating a
//! pending reset that the old instance's orphan-armed clients (or an
//! unclean watchdog close) were counting down toward.

use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;

/// Name of the POSIX shared-memory object (`/dev/shm/wdmd` on Linux).
pub const SENTINEL_NAME: &str = "/wdmd";

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error(
        "sentinel object {name} already exists: a prior instance exited uncleanly; refusing to \
         start so a pending reset cannot be defeated"
    )]
    AlreadyExists { name: String },

    #[error("failed to create sentinel object {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: nix::Error,
    },
}

/// Handle to the sentinel; removing it is the daemon's signal to the next
/// instance that this exit was clean.
pub struct Sentinel {
    name: String,
    released: bool,
}

impl Sentinel {
    /// Create the sentinel with `O_CREAT|O_EXCL`. Fails if it already
    /// exists (§8 "On a fresh start, if the sentinel object exists, the
    /// daemon refuses to start").
    pub fn create() -> Result<Self, SentinelError> {
        Self::create_named(SENTINEL_NAME)
    }

    /// Same as [`create`](Self::create) but with an explicit name, for
    /// tests that can't share `/dev/shm/wdmd` with a real daemon.
    pub fn create_named(name: &str) -> Result<Self, SentinelError> {
        match shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => {
                // We only need the sentinel's existence, not its contents;
                // close the descriptor immediately.
                let _ = nix::unistd::close(fd);
                Ok(Self {
                    name: name.to_string(),
                    released: false,
                })
            }
            Err(nix::Error::EEXIST) => Err(SentinelError::AlreadyExists {
                name: name.to_string(),
            }),
            Err(source) => Err(SentinelError::Create {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Whether `name` currently exists, without creating or removing it.
    /// Useful for diagnostics (`wdmd --dump`) that want to report the
    /// state without racing a real startup attempt.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        Path::new("/dev/shm").join(name.trim_start_matches('/')).exists()
    }

    /// Remove the sentinel on a clean exit. Consumes `self` so it cannot
    /// be released twice.
    pub fn release(mut self) {
        let _ = shm_unlink(self.name.as_str());
        self.released = true;
    }
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        if !self.released {
            // An unclean exit (panic, signal) leaves the sentinel in
            // place by design: the next instance must see it and refuse
            // to start (§9 "Safety-of-self").
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/clusterfence-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn second_create_with_same_name_is_refused() {
        let name = unique_name("dup");
        let first = Sentinel::create_named(&name).unwrap();
        let err = Sentinel::create_named(&name).unwrap_err();
        assert!(matches!(err, SentinelError::AlreadyExists { .. }));
        first.release();
    }

    #[test]
    fn release_allows_recreation() {
        let name = unique_name("release");
        let first = Sentinel::create_named(&name).unwrap();
        first.release();
        let second = Sentinel::create_named(&name).unwrap();
        second.release();
    }

    #[test]
    fn drop_without_release_leaves_sentinel_in_place() {
        let name = unique_name("leak");
        {
            let _sentinel = Sentinel::create_named(&name).unwrap();
            // dropped without calling release()
        }
        let err = Sentinel::create_named(&name).unwrap_err();
        assert!(matches!(err, SentinelError::AlreadyExists { .. }));
        let _ = shm_unlink(name.as_str());
    }
}
