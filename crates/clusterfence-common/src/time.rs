//! Monotonic time helpers.
//!
//! The watchdog multiplexer and the reset orchestrator both reason about
//! intervals ("how long since this client last renewed") rather than wall
//! clock time, so every timestamp in this workspace is taken from
//! `CLOCK_MONOTONIC` and expressed as whole seconds. Wall clock time is
//! never used for expiry math: NTP jumps must not cause a spurious fire or
//! mask a real one.

use std::time::{Duration, Instant};

/// A monotonic clock with an arbitrary origin, handed out once per process
/// and shared by every subsystem that needs to stamp a renewal or compute an
/// expiry.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Start a new clock with its origin at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since this clock's origin.
    #[must_use]
    pub fn now_secs(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }
}

/// Seconds elapsed since `since`, given current reading `now`. Saturates
/// instead of underflowing if `now < since`.
#[must_use]
pub fn seconds_since(now: u64, since: u64) -> u64 {
    now.saturating_sub(since)
}

/// Convert a whole-second count into a `Duration`, for blocking `poll(2)`
/// timeouts.
#[must_use]
pub fn secs_to_duration(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_since_saturates() {
        assert_eq!(seconds_since(5, 10), 0);
        assert_eq!(seconds_since(10, 5), 5);
    }

    #[test]
    fn clock_advances_monotonically() {
        let clock = MonotonicClock::new();
        let first = clock.now_secs();
        std::thread::sleep(Duration::from_millis(10));
        assert!(clock.now_secs() >= first);
    }
}
