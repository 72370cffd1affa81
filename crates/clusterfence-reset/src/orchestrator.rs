//! The reset orchestrator state machine (§4.5): posts a reset event in
//! one or more lockspaces, watches storage timestamps and
//! acknowledgments, and decides DONE vs. FAILED by racing the faster
//! native-timeout path (§4.6) against the slower host-status path
//! (§4.7).

use std::time::Duration;

use clusterfence_common::time::MonotonicClock;
use clusterfence_lease::{
    bits, compose_reset_event, EventRecord, HostStatus as LeaseHostStatus, LeaseEngine,
    SetEventFlags,
};

use crate::host_status::{
    evaluate_channel, ChannelObservation, ChannelVerdict, HOST_STATUS_TIMEOUT_SECONDS,
    MAX_UNANSWERED_RENEWALS,
};
use crate::native_timeout::{native_timeout_eligible, NativeTimeoutState, NativeTimeoutVerdict};
use crate::target::LockspaceTarget;

/// Poll period ceiling demanded by §4.5 step 3 ("period ≤ 2 s").
pub const POLL_PERIOD: Duration = Duration::from_secs(2);

/// Flags selecting how `reset()` composes and interprets its event
/// (§6.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetFlags {
    pub use_watchdog: bool,
    pub use_reboot: bool,
    pub resource_mode: bool,
    /// Operator's request to use native-timeout; still gated per-pass by
    /// every observed host's `io_timeout` matching the reference value
    /// (§4.6).
    pub native_timeout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Done { reason: String },
    Failed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no lockspace channel could be opened")]
    NoChannelsOpened,

    #[error("every opened channel rejected the reset event")]
    NoChannelsAccepted,
}

struct Channel<C> {
    lockspace: String,
    handle: C,
    target_host_id: u64,
    target_generation: u64,
    last_timestamp: u64,
    renewals: u32,
    is_resetting: bool,
    is_rebooting: bool,
    is_dead: bool,
    is_free: bool,
    native: NativeTimeoutState,
}

/// Per-lockspace reset operation, driven one poll pass at a time by
/// [`Orchestrator::poll_once`] (exposed for deterministic testing) or to
/// completion by [`Orchestrator::run`].
pub struct Orchestrator<E: LeaseEngine> {
    engine: E,
    own_host_id: u64,
    channels: Vec<Channel<E::Channel>>,
    watchdog_failed_to_fire: bool,
    operation_begin: u64,
    resource_mode: bool,
    native_timeout_enabled: bool,
}

impl<E: LeaseEngine> Orchestrator<E> {
    /// Steps 1–2 of §4.5: open an event channel in each requested
    /// lockspace and post the composed event word.
    pub fn reset(
        mut engine: E,
        targets: &[LockspaceTarget],
        own_host_id: u64,
        flags: ResetFlags,
        now: u64,
    ) -> Result<Self, OrchestratorError> {
        let mut channels = Vec::new();
        for target in targets {
            match engine.reg_event(&target.name) {
                Ok(handle) => channels.push(Channel {
                    lockspace: target.name.clone(),
                    handle,
                    target_host_id: target.host_id.unwrap_or(0),
                    target_generation: 0,
                    last_timestamp: 0,
                    renewals: 0,
                    is_resetting: false,
                    is_rebooting: false,
                    is_dead: false,
                    is_free: false,
                    native: NativeTimeoutState::new(),
                }),
                Err(e) => {
                    tracing::warn!(lockspace = %target.name, error = %e, "reg_event failed; skipping lockspace");
                }
            }
        }
        if channels.is_empty() {
            return Err(OrchestratorError::NoChannelsOpened);
        }

        let event_word = compose_reset_event(flags.use_watchdog, flags.use_reboot);
        let mut accepted = Vec::new();
        for ch in channels {
            let record = EventRecord {
                event: event_word,
                target_host_id: ch.target_host_id,
                target_generation: ch.target_generation,
                from_host_id: own_host_id,
                ..Default::default()
            };
            match engine.set_event(&ch.lockspace, &record, SetEventFlags::default()) {
                Ok(()) => accepted.push(ch),
                Err(e) => {
                    tracing::warn!(lockspace = %ch.lockspace, error = %e, "set_event failed; dropping channel");
                    let _ = engine.end_event(ch.handle, &ch.lockspace);
                }
            }
        }
        if accepted.is_empty() {
            return Err(OrchestratorError::NoChannelsAccepted);
        }

        Ok(Self {
            engine,
            own_host_id,
            channels: accepted,
            watchdog_failed_to_fire: false,
            operation_begin: now,
            resource_mode: flags.resource_mode,
            native_timeout_enabled: flags.native_timeout,
        })
    }

    /// Run steps 3(a)–(e) of §4.5 once, at whatever `now` the caller
    /// supplies. Returns `Some` once the operation has a verdict.
    pub fn poll_once(&mut self, now: u64) -> Option<ResetOutcome> {
        for ch in &mut self.channels {
            loop {
                match self.engine.get_event(ch.handle) {
                    Ok(Some(event)) => {
                        if event.from_host_id == ch.target_host_id {
                            if event.has(bits::RESETTING) {
                                ch.is_resetting = true;
                            }
                            if event.has(bits::REBOOTING) {
                                ch.is_rebooting = true;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(lockspace = %ch.lockspace, error = %e, "get_event failed; skipping channel this pass");
                        break;
                    }
                }
            }
        }

        let mut observed_io_timeouts = Vec::new();
        for ch in &mut self.channels {
            match self.engine.get_hosts(&ch.lockspace, ch.target_host_id) {
                Ok(hosts) => {
                    let Some(host) = hosts.first() else {
                        continue;
                    };
                    observed_io_timeouts.push(u64::from(host.io_timeout));
                    if host.generation != 0 {
                        ch.target_generation = host.generation;
                    }
                    if host.timestamp != ch.last_timestamp {
                        ch.last_timestamp = host.timestamp;
                        ch.renewals += 1;
                    }
                    ch.is_dead = host.status == LeaseHostStatus::Dead;
                    ch.is_free = host.status == LeaseHostStatus::Free;
                }
                Err(e) => {
                    tracing::warn!(lockspace = %ch.lockspace, error = %e, "get_hosts failed; channel degraded to FAIL this pass");
                }
            }
        }

        if self.native_timeout_enabled && native_timeout_eligible(&observed_io_timeouts) {
            for ch in &mut self.channels {
                match ch.native.observe(now, ch.is_resetting, ch.last_timestamp) {
                    NativeTimeoutVerdict::Proven => {
                        tracing::info!(lockspace = %ch.lockspace, "reset done by native_timeout");
                        return Some(ResetOutcome::Done {
                            reason: "reset done by native_timeout".to_string(),
                        });
                    }
                    NativeTimeoutVerdict::FailedToFire => {
                        self.watchdog_failed_to_fire = true;
                    }
                    NativeTimeoutVerdict::Waiting => {}
                }
            }
        }

        if self.watchdog_failed_to_fire {
            tracing::error!("watchdog_failed_to_fire: target kept renewing its lease past the derived fire deadline");
            return Some(ResetOutcome::Failed {
                reason: "watchdog_failed_to_fire".to_string(),
            });
        }

        let mut any_wait = false;
        let mut any_proven = false;
        for ch in &self.channels {
            let observation = ChannelObservation {
                is_resetting: ch.is_resetting,
                is_dead: ch.is_dead,
                is_free: ch.is_free,
                renewals: ch.renewals,
            };
            match evaluate_channel(
                &observation,
                now,
                self.operation_begin,
                self.resource_mode,
                MAX_UNANSWERED_RENEWALS,
                HOST_STATUS_TIMEOUT_SECONDS,
            ) {
                ChannelVerdict::Proven => any_proven = true,
                ChannelVerdict::Wait => any_wait = true,
                ChannelVerdict::Fail => {}
            }
        }

        if any_proven {
            tracing::info!("reset done by host_status");
            return Some(ResetOutcome::Done {
                reason: "reset done by host_status".to_string(),
            });
        }
        if !any_wait {
            return Some(ResetOutcome::Failed {
                reason: self.failure_reason(),
            });
        }
        None
    }

    fn failure_reason(&self) -> String {
        if self.channels.iter().any(|c| c.is_dead && !c.is_resetting) {
            "host is dead with no reply".to_string()
        } else if self
            .channels
            .iter()
            .any(|c| c.renewals >= MAX_UNANSWERED_RENEWALS && !c.is_resetting)
        {
            format!("host renewals {MAX_UNANSWERED_RENEWALS} with no reply")
        } else {
            "unable to prove reset".to_string()
        }
    }

    /// Drive the operation to completion using a real monotonic clock,
    /// sleeping between passes (§4.5 step 3, §5 "period ≤ 2 s").
    pub fn run(&mut self) -> ResetOutcome {
        let clock = MonotonicClock::new();
        loop {
            if let Some(outcome) = self.poll_once(clock.now_secs()) {
                return outcome;
            }
            std::thread::sleep(POLL_PERIOD);
        }
    }

    /// Close every open channel, best-effort, once the operation has a
    /// verdict or is being abandoned.
    pub fn close(&mut self) {
        for ch in &self.channels {
            if let Err(e) = self.engine.end_event(ch.handle, &ch.lockspace) {
                tracing::warn!(lockspace = %ch.lockspace, error = %e, "end_event failed during close");
            }
        }
    }

    #[must_use]
    pub fn own_host_id(&self) -> u64 {
        self.own_host_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterfence_lease::{HostStatus, SimulatedLeaseEngine, SimulatedStorage};

    fn target(name: &str, host_id: u64) -> LockspaceTarget {
        LockspaceTarget {
            name: name.to_string(),
            host_id: Some(host_id),
        }
    }

    #[test]
    fn happy_path_proves_reset_by_native_timeout() {
        let storage = SimulatedStorage::new();
        storage.renew("ls", 2, 0, 10);
        let engine = SimulatedLeaseEngine::new(storage.clone(), 1);

        let mut orchestrator = Orchestrator::reset(
            engine,
            &[target("ls", 2)],
            1,
            ResetFlags {
                use_watchdog: true,
                resource_mode: true,
                native_timeout: true,
                ..Default::default()
            },
            0,
        )
        .unwrap();

        // Target acknowledges RESETTING at t=20.
        let mut target_engine = SimulatedLeaseEngine::new(storage.clone(), 2);
        target_engine
            .set_event(
                "ls",
                &EventRecord {
                    event: bits::RESETTING,
                    target_host_id: 1,
                    from_host_id: 2,
                    ..Default::default()
                },
                SetEventFlags::default(),
            )
            .unwrap();
        storage.renew("ls", 2, 20, 10);

        assert!(orchestrator.poll_once(20).is_none());

        // No further renewal beyond begin_timestamp + R; T elapses.
        let outcome = orchestrator.poll_once(111).unwrap();
        assert_eq!(
            outcome,
            ResetOutcome::Done {
                reason: "reset done by native_timeout".to_string()
            }
        );
    }

    #[test]
    fn failed_acknowledgment_fails_after_four_renewals() {
        let storage = SimulatedStorage::new();
        storage.renew("ls", 2, 0, 10);
        let engine = SimulatedLeaseEngine::new(storage.clone(), 1);
        let mut orchestrator = Orchestrator::reset(
            engine,
            &[target("ls", 2)],
            1,
            ResetFlags {
                use_watchdog: true,
                ..Default::default()
            },
            0,
        )
        .unwrap();

        for t in [20u64, 40, 60, 80] {
            storage.renew("ls", 2, t, 10);
            let outcome = orchestrator.poll_once(t);
            if t < 80 {
                assert!(outcome.is_none(), "unexpected verdict at t={t}");
            } else {
                assert_eq!(
                    outcome.unwrap(),
                    ResetOutcome::Failed {
                        reason: "host renewals 4 with no reply".to_string()
                    }
                );
            }
        }
    }

    #[test]
    fn target_died_without_ack_fails() {
        let storage = SimulatedStorage::new();
        storage.renew("ls", 2, 0, 10);
        let engine = SimulatedLeaseEngine::new(storage.clone(), 1);
        let mut orchestrator = Orchestrator::reset(
            engine,
            &[target("ls", 2)],
            1,
            ResetFlags {
                use_watchdog: true,
                ..Default::default()
            },
            0,
        )
        .unwrap();

        storage.set_status("ls", 2, HostStatus::Dead);
        let outcome = orchestrator.poll_once(5).unwrap();
        assert_eq!(
            outcome,
            ResetOutcome::Failed {
                reason: "host is dead with no reply".to_string()
            }
        );
    }

    #[test]
    fn watchdog_failed_to_fire_is_sticky_and_fatal() {
        let storage = SimulatedStorage::new();
        storage.renew("ls", 2, 0, 10);
        let engine = SimulatedLeaseEngine::new(storage.clone(), 1);
        let mut orchestrator = Orchestrator::reset(
            engine,
            &[target("ls", 2)],
            1,
            ResetFlags {
                use_watchdog: true,
                native_timeout: true,
                ..Default::default()
            },
            0,
        )
        .unwrap();

        let mut target_engine = SimulatedLeaseEngine::new(storage.clone(), 2);
        target_engine
            .set_event(
                "ls",
                &EventRecord {
                    event: bits::RESETTING,
                    target_host_id: 1,
                    from_host_id: 2,
                    ..Default::default()
                },
                SetEventFlags::default(),
            )
            .unwrap();
        storage.renew("ls", 2, 0, 10);
        assert!(orchestrator.poll_once(0).is_none());

        // Target keeps renewing well past R=70 within the T=90 window.
        storage.renew("ls", 2, 80, 10);
        let outcome = orchestrator.poll_once(91).unwrap();
        assert_eq!(
            outcome,
            ResetOutcome::Failed {
                reason: "watchdog_failed_to_fire".to_string()
            }
        );
    }

    #[test]
    fn mismatched_io_timeout_disables_native_timeout() {
        let storage = SimulatedStorage::new();
        storage.renew("ls", 2, 0, 25);
        let engine = SimulatedLeaseEngine::new(storage.clone(), 1);
        let mut orchestrator = Orchestrator::reset(
            engine,
            &[target("ls", 2)],
            1,
            ResetFlags {
                use_watchdog: true,
                native_timeout: true,
                ..Default::default()
            },
            0,
        )
        .unwrap();

        let mut target_engine = SimulatedLeaseEngine::new(storage.clone(), 2);
        target_engine
            .set_event(
                "ls",
                &EventRecord {
                    event: bits::RESETTING,
                    target_host_id: 1,
                    from_host_id: 2,
                    ..Default::default()
                },
                SetEventFlags::default(),
            )
            .unwrap();
        storage.renew("ls", 2, 0, 25);
        orchestrator.poll_once(0);

        // Even well past T, native-timeout must not fire a verdict because
        // io_timeout=25 disqualifies it; host-status keeps waiting.
        assert!(orchestrator.poll_once(200).is_none());
    }
}
