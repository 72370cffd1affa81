//! Hardware watchdog shim (§4.1, §6.3).
//!
//! Thin interface over the Linux watchdog char device: open, set timeout,
//! keepalive, disarm. The shim owns at most one open descriptor at a time
//! (§3 "Hardware watchdog handle: singleton") and tracks whether the
//! device is closed, open-and-armed, or closed-without-disarm (still
//! counting down in the kernel).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

const WATCHDOG_IOCTL_BASE: u8 = b'W';

nix::ioctl_readwrite!(wdioc_settimeout, WATCHDOG_IOCTL_BASE, 6, libc::c_int);
nix::ioctl_read!(wdioc_gettimeout, WATCHDOG_IOCTL_BASE, 7, libc::c_int);
nix::ioctl_read!(wdioc_keepalive, WATCHDOG_IOCTL_BASE, 5, libc::c_int);

/// Byte written on a clean close to tell the driver to disarm instead of
/// continuing to count down (§3, §6.3).
pub const DISARM_SENTINEL: u8 = b'V';

/// Default device paths tried in order, after any saved/operator path
/// (§4.1 "Device selection order").
pub const DEFAULT_CANDIDATE_PATHS: &[&str] =
    &["/dev/watchdog0", "/dev/watchdog1", "/dev/watchdog"];

/// Lifecycle state of the singleton hardware watchdog handle (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No open descriptor; either never opened or cleanly disarmed.
    Closed,
    /// Open and being petted every test pass.
    ArmedClean,
    /// Closed without writing the disarm sentinel: the kernel emitted one
    /// final keepalive on close and is counting down to `fire_timeout`
    /// with no further renewals possible from us.
    ArmedUnclean,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("no usable watchdog device found (tried: {tried:?})")]
    NoDeviceFound { tried: Vec<PathBuf> },

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: requested fire_timeout {requested}s, device reports {actual}s")]
    TimeoutRejected {
        path: PathBuf,
        requested: u32,
        actual: libc::c_int,
    },

    #[error("ioctl {op} on {path} failed: {source}")]
    Ioctl {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("keepalive attempted while device state is {0:?}, not ArmedClean")]
    NotArmed(DeviceState),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open (or previously open) hardware watchdog handle.
#[derive(Debug)]
pub struct WatchdogDevice {
    fd: Option<File>,
    path: Option<PathBuf>,
    fire_timeout: Duration,
    state: DeviceState,
}

impl WatchdogDevice {
    /// A handle with no device open yet.
    #[must_use]
    pub fn closed(fire_timeout: Duration) -> Self {
        Self {
            fd: None,
            path: None,
            fire_timeout,
            state: DeviceState::Closed,
        }
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.state
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn fire_timeout(&self) -> Duration {
        self.fire_timeout
    }

    /// Candidate paths in selection order: saved path from a prior run,
    /// then the operator-specified path, then the compiled-in defaults
    /// (§4.1).
    #[must_use]
    pub fn candidate_paths(saved: Option<&Path>, operator: Option<&Path>) -> Vec<PathBuf> {
        let mut out = Vec::with_capacity(2 + DEFAULT_CANDIDATE_PATHS.len());
        if let Some(p) = saved {
            out.push(p.to_path_buf());
        }
        if let Some(p) = operator {
            out.push(p.to_path_buf());
        }
        for p in DEFAULT_CANDIDATE_PATHS {
            let p = PathBuf::from(p);
            if !out.contains(&p) {
                out.push(p);
            }
        }
        out
    }

    /// Open the first candidate path that both opens successfully AND
    /// accepts `fire_timeout` (§4.1: "The first to open AND accept the
    /// configured fire_timeout wins").
    pub fn open_first_available(
        saved: Option<&Path>,
        operator: Option<&Path>,
        fire_timeout: Duration,
    ) -> Result<Self, WatchdogError> {
        let candidates = Self::candidate_paths(saved, operator);
        for path in &candidates {
            match Self::try_open(path, fire_timeout) {
                Ok(dev) => return Ok(dev),
                Err(e) => debug!(?path, error = %e, "candidate watchdog device rejected"),
            }
        }
        Err(WatchdogError::NoDeviceFound { tried: candidates })
    }

    fn try_open(path: &Path, fire_timeout: Duration) -> Result<Self, WatchdogError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| WatchdogError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let requested = u32::try_from(fire_timeout.as_secs()).unwrap_or(u32::MAX);
        let mut timeout = requested as libc::c_int;
        // SAFETY: `file`'s fd is valid for the lifetime of this call and
        // `timeout` is a valid in/out `c_int`.
        unsafe { wdioc_settimeout(file.as_raw_fd(), &mut timeout) }.map_err(|source| {
            WatchdogError::Ioctl {
                op: "WDIOC_SETTIMEOUT",
                path: path.to_path_buf(),
                source,
            }
        })?;

        if timeout != requested as libc::c_int {
            return Err(WatchdogError::TimeoutRejected {
                path: path.to_path_buf(),
                requested,
                actual: timeout,
            });
        }

        info!(?path, fire_timeout_secs = requested, "watchdog device armed");
        Ok(Self {
            fd: Some(file),
            path: Some(path.to_path_buf()),
            fire_timeout,
            state: DeviceState::ArmedClean,
        })
    }

    /// Re-open the previously used path (used after a recovery pass, once
    /// failures have dropped back to zero while the device sits
    /// `ArmedUnclean`; §4.2).
    pub fn reopen(&mut self) -> Result<(), WatchdogError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| WatchdogError::NoDeviceFound { tried: vec![] })?;
        let reopened = Self::try_open(&path, self.fire_timeout)?;
        *self = reopened;
        Ok(())
    }

    /// Pet the watchdog (`WDIOC_KEEPALIVE`). Only valid while `ArmedClean`.
    pub fn keepalive(&mut self) -> Result<(), WatchdogError> {
        let Some(file) = self.fd.as_ref() else {
            return Err(WatchdogError::NotArmed(self.state));
        };
        if self.state != DeviceState::ArmedClean {
            return Err(WatchdogError::NotArmed(self.state));
        }
        let mut dummy: libc::c_int = 0;
        // SAFETY: fd is open and `dummy` is a valid out parameter ignored
        // by the driver for this ioctl.
        unsafe { wdioc_keepalive(file.as_raw_fd(), &mut dummy) }.map_err(|source| {
            WatchdogError::Ioctl {
                op: "WDIOC_KEEPALIVE",
                path: self.path.clone().unwrap_or_default(),
                source,
            }
        })?;
        Ok(())
    }

    /// Clean close: write the disarm sentinel then close the descriptor.
    /// Transitions to `Closed`.
    pub fn close_clean(&mut self) -> Result<(), WatchdogError> {
        if let Some(mut file) = self.fd.take() {
            file.write_all(&[DISARM_SENTINEL])?;
            info!(path = ?self.path, "watchdog disarmed (clean close)");
        }
        self.state = DeviceState::Closed;
        Ok(())
    }

    /// Unclean close: drop the descriptor without writing the disarm
    /// sentinel. The kernel driver emits one final keepalive as a
    /// hardware property of the close-without-`V` path and begins
    /// counting down to `fire_timeout` with no further renewals possible.
    /// Used deliberately by the test loop to tighten the firing deadline
    /// after a failure (§4.2, §9 "Unclean close as a timing tool").
    pub fn close_unclean(&mut self) {
        if self.fd.take().is_some() {
            warn!(
                path = ?self.path,
                fire_timeout_secs = self.fire_timeout.as_secs(),
                "watchdog closed unclean; device will fire unless reopened in time"
            );
        }
        self.state = DeviceState::ArmedUnclean;
    }

    /// Open, configure, disarm, and close a device without entering the
    /// service loop (§4.1 probe mode, §6.4 `wdmd --probe`). Returns the
    /// path that was used, for the caller to print.
    pub fn probe(
        saved: Option<&Path>,
        operator: Option<&Path>,
        fire_timeout: Duration,
    ) -> Result<PathBuf, WatchdogError> {
        let mut dev = Self::open_first_available(saved, operator, fire_timeout)?;
        let path = dev.path.clone().expect("open_first_available sets path");
        dev.close_clean()?;
        Ok(path)
    }
}

/// Best-effort persistence of the last successfully opened watchdog path,
/// so a restart can try it first (§4.1 selection order item 1).
///
/// This mirrors an open question `original_source/wdmd/main.c` never
/// resolved either (no durable store for the winning path across
/// restarts); the file is not fsync'd and a crash between open and save
/// simply falls back to probing the compiled-in defaults again.
pub mod saved_path {
    use super::PathBuf;
    use std::path::Path;

    /// Read a previously saved device path, if the state file exists and
    /// parses.
    pub fn read(state_dir: &Path) -> Option<PathBuf> {
        let contents = std::fs::read_to_string(state_dir.join("watchdog-path")).ok()?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }

    /// Save `path` as the preferred device for the next restart.
    pub fn write(state_dir: &Path, path: &Path) {
        let _ = std::fs::create_dir_all(state_dir);
        let _ = std::fs::write(state_dir.join("watchdog-path"), path.as_os_str().as_encoded_bytes());
    }
}
