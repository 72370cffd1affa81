//! Native-timeout derivation (§4.6): a closed-form proof that a
//! target's hardware watchdog fired, from observed lease timestamps
//! alone, without waiting on the slower host-status path (§4.7).

/// Default `T`: how long after the first RESETTING observation we wait
/// before evaluating whether the target's watchdog fired.
pub const NATIVE_TIMEOUT_SECONDS: u64 = 90;

/// Default `R`: the renewal-timestamp budget within `T` that must NOT
/// be exceeded for a reset to be proven.
pub const NATIVE_RENEWAL_SECONDS: u64 = 70;

/// Reference `io_timeout` the `T`/`R` derivation assumes. If any
/// observed host's `io_timeout` differs, native-timeout must be
/// disabled for the whole operation (§4.6).
pub const REFERENCE_IO_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeTimeoutVerdict {
    /// Still within the observation window, or RESETTING not seen yet.
    Waiting,
    /// `now - begin_local > T` and the lease timestamp stopped
    /// advancing within `R` of the first RESETTING observation: the
    /// watchdog fired.
    Proven,
    /// `now - begin_local > T` but the lease timestamp kept advancing
    /// past `R`: the target's watchdog did not fire. Sticky,
    /// operation-fatal (§4.6, §9).
    FailedToFire,
}

/// Per-channel native-timeout tracking state, started on the first
/// observation of `is_resetting`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTimeoutState {
    begin_local: Option<u64>,
    begin_timestamp: Option<u64>,
}

impl NativeTimeoutState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.begin_local.is_some()
    }

    /// Feed one observation from an orchestrator poll pass.
    ///
    /// `is_resetting` is this channel's current RESETTING flag;
    /// `timestamp` is the most recently observed lease timestamp for
    /// the target in this lockspace; `now` is the orchestrator's own
    /// monotonic clock reading.
    pub fn observe(&mut self, now: u64, is_resetting: bool, timestamp: u64) -> NativeTimeoutVerdict {
        if !is_resetting {
            return NativeTimeoutVerdict::Waiting;
        }
        if self.begin_local.is_none() {
            self.begin_local = Some(now);
            self.begin_timestamp = Some(timestamp);
            return NativeTimeoutVerdict::Waiting;
        }
        let begin_local = self.begin_local.expect("checked above");
        let begin_timestamp = self.begin_timestamp.expect("set alongside begin_local");

        if now.saturating_sub(begin_local) <= NATIVE_TIMEOUT_SECONDS {
            return NativeTimeoutVerdict::Waiting;
        }
        if timestamp.saturating_sub(begin_timestamp) > NATIVE_RENEWAL_SECONDS {
            NativeTimeoutVerdict::FailedToFire
        } else {
            NativeTimeoutVerdict::Proven
        }
    }
}

/// Whether native-timeout may be used at all for this operation: every
/// observed host's `io_timeout` must match the reference value the `T`/`R`
/// derivation assumes (§4.6).
#[must_use]
pub fn native_timeout_eligible(observed_io_timeouts: &[u64]) -> bool {
    observed_io_timeouts
        .iter()
        .all(|&t| t == REFERENCE_IO_TIMEOUT_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_until_resetting_observed() {
        let mut state = NativeTimeoutState::new();
        assert_eq!(state.observe(10, false, 0), NativeTimeoutVerdict::Waiting);
        assert!(!state.is_armed());
    }

    #[test]
    fn arms_on_first_resetting_observation() {
        let mut state = NativeTimeoutState::new();
        assert_eq!(state.observe(10, true, 500), NativeTimeoutVerdict::Waiting);
        assert!(state.is_armed());
    }

    #[test]
    fn proves_reset_when_timestamp_stops_advancing() {
        let mut state = NativeTimeoutState::new();
        state.observe(0, true, 500);
        // Timestamp creeps forward by less than R before T elapses.
        let verdict = state.observe(91, true, 500 + NATIVE_RENEWAL_SECONDS);
        assert_eq!(verdict, NativeTimeoutVerdict::Proven);
    }

    #[test]
    fn fails_to_fire_when_target_keeps_renewing() {
        let mut state = NativeTimeoutState::new();
        state.observe(0, true, 500);
        let verdict = state.observe(91, true, 500 + NATIVE_RENEWAL_SECONDS + 1);
        assert_eq!(verdict, NativeTimeoutVerdict::FailedToFire);
    }

    #[test]
    fn stays_waiting_before_t_elapses() {
        let mut state = NativeTimeoutState::new();
        state.observe(0, true, 500);
        let verdict = state.observe(89, true, 10_000);
        assert_eq!(verdict, NativeTimeoutVerdict::Waiting);
    }

    #[test]
    fn eligibility_requires_every_host_at_reference_io_timeout() {
        assert!(native_timeout_eligible(&[10, 10, 10]));
        assert!(!native_timeout_eligible(&[10, 20]));
        assert!(native_timeout_eligible(&[]));
    }
}
