//! Signal handling for the watchdog multiplexer's main loop.
//!
//! Grounded in `wdmd/main.c`'s `setup_signals()`/`process_signals()`,
//! which install a `signalfd` and poll it alongside the client sockets.
//! This build uses the simpler libc `signal()` + atomic-flag pattern
//! instead of a signalfd, since the main loop already polls on a fixed
//! tick (§4.2) rather than blocking indefinitely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static RESCAN_FLAG: AtomicBool = AtomicBool::new(false);

/// Shared state the main loop polls once per tick.
///
/// SIGTERM and SIGINT both request shutdown; the main loop honors the
/// request only once `TestLoop::can_shut_down()` is true (§5: "The WDM
/// honors them ONLY when `active_clients()` is false"). SIGHUP requests
/// a rescan of the scripts directory, matching `setup_scripts()` being
/// re-run on SIGHUP in the reference daemon.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    rescan_requested: AtomicBool,
}

impl SignalState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Check and clear the rescan flag.
    #[inline]
    pub fn take_rescan_request(&self) -> bool {
        self.rescan_requested.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }
}

/// Installs the process-wide signal handlers and relays them into a
/// [`SignalState`] the main loop can poll without blocking.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Register SIGTERM/SIGINT/SIGHUP handlers and start the relay
    /// thread. There is only ever one of these per process.
    pub fn install() -> std::io::Result<Self> {
        let state = Arc::new(SignalState::new());
        let handler = Self {
            state: Arc::clone(&state),
        };
        handler.register_unix_handlers();
        handler.spawn_relay();
        Ok(handler)
    }

    fn register_unix_handlers(&self) {
        extern "C" fn on_term(_: libc::c_int) {
            SHUTDOWN_FLAG.store(true, Ordering::Relaxed);
        }
        extern "C" fn on_hup(_: libc::c_int) {
            RESCAN_FLAG.store(true, Ordering::Relaxed);
        }

        // SAFETY: `on_term`/`on_hup` are async-signal-safe (atomic
        // stores only) and are installed once at startup before any
        // client traffic exists.
        unsafe {
            libc::signal(libc::SIGTERM, on_term as libc::sighandler_t);
            libc::signal(libc::SIGINT, on_term as libc::sighandler_t);
            libc::signal(libc::SIGHUP, on_hup as libc::sighandler_t);
        }
    }

    /// Relay the process-wide static flags into this handler's
    /// [`SignalState`]. A thread rather than the signal handler itself
    /// because `SignalState`'s atomics, while safe to touch from a
    /// signal handler, would otherwise need every future field on this
    /// struct to stay signal-safe too.
    /// Runs for the life of the process, not just until shutdown is
    /// first requested: the daemon may refuse to exit for a long time
    /// (§5, orphan-armed slots / active refcounts), and a SIGHUP sent
    /// during that window must still reach `RESCAN_FLAG`.
    fn spawn_relay(&self) {
        let state = Arc::clone(&self.state);
        std::thread::spawn(move || loop {
            if SHUTDOWN_FLAG.swap(false, Ordering::Relaxed) {
                info!("shutdown requested");
                state.request_shutdown();
            }
            if RESCAN_FLAG.swap(false, Ordering::Relaxed) {
                info!("SIGHUP received, requesting scripts rescan");
                state.rescan_requested.store(true, Ordering::Relaxed);
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        });
    }

    #[inline]
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    #[inline]
    pub fn take_rescan_request(&self) -> bool {
        self.state.take_rescan_request()
    }

    #[must_use]
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_nothing_pending() {
        let state = SignalState::new();
        assert!(!state.shutdown_requested());
        assert!(!state.take_rescan_request());
    }

    #[test]
    fn shutdown_request_latches() {
        let state = SignalState::new();
        state.request_shutdown();
        assert!(state.shutdown_requested());
    }

    #[test]
    fn rescan_request_clears_on_take() {
        let state = SignalState::new();
        state.rescan_requested.store(true, Ordering::Relaxed);
        assert!(state.take_rescan_request());
        assert!(!state.take_rescan_request());
    }
}
