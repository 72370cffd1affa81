//! Target-side reset watcher (SPEC_FULL supplement #4), grounded on
//! `sanlk_reset.c`'s `update_local_daemon`/`setup_resetd_socket`.
//!
//! Holds an event channel open in every watched lockspace; on an
//! inbound event addressed to its own host id, arms the local watchdog
//! multiplexer with a deliberately un-renewable registration (so the
//! test loop's next pass fails it and the device starts its unclean
//! countdown) and/or triggers the kernel's sysrq reboot, then posts the
//! RESETTING/REBOOTING acknowledgment back in the same lockspace.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use clusterfence_lease::{bits, EventRecord, LeaseEngine, SetEventFlags};
use clusterfence_watchdog::{WdmClient, WdmClientError};

#[derive(Debug, thiserror::Error)]
pub enum ResetdError {
    #[error("lease engine error: {0}")]
    Lease(#[from] clusterfence_lease::LeaseError),

    #[error("lockspace {0:?} is not being watched")]
    NotWatched(String),

    #[error("failed to arm local watchdog multiplexer: {0}")]
    Wdm(#[from] WdmClientError),

    #[error("failed to trigger sysrq reboot: {0}")]
    Sysrq(#[source] std::io::Error),
}

/// One reaction the watcher took while polling its watch set, reported
/// back to the caller for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    ArmedWatchdog { lockspace: String, from_host_id: u64 },
    TriggeredReboot { lockspace: String, from_host_id: u64 },
}

/// Configuration needed to react to an inbound reset event.
pub struct ResetdConfig {
    pub own_host_id: u64,
    pub wdm_socket_path: PathBuf,
    pub sysrq_trigger_path: PathBuf,
}

/// The watcher's set of watched lockspaces, each holding one open event
/// channel (§4.2 "The WDM at the TARGET of a reset").
pub struct Watcher<E: LeaseEngine> {
    engine: E,
    config: ResetdConfig,
    channels: HashMap<String, E::Channel>,
}

impl<E: LeaseEngine> Watcher<E> {
    #[must_use]
    pub fn new(engine: E, config: ResetdConfig) -> Self {
        Self {
            engine,
            config,
            channels: HashMap::new(),
        }
    }

    /// `reg <lockspace>`: start watching a lockspace.
    pub fn watch(&mut self, lockspace: &str) -> Result<(), ResetdError> {
        if self.channels.contains_key(lockspace) {
            return Ok(());
        }
        let channel = self.engine.reg_event(lockspace)?;
        self.channels.insert(lockspace.to_string(), channel);
        Ok(())
    }

    /// `end <lockspace>`: stop watching a lockspace.
    pub fn unwatch(&mut self, lockspace: &str) -> Result<(), ResetdError> {
        let Some(channel) = self.channels.remove(lockspace) else {
            return Err(ResetdError::NotWatched(lockspace.to_string()));
        };
        self.engine.end_event(channel, lockspace)?;
        Ok(())
    }

    /// `clear`: stop watching every lockspace.
    pub fn clear(&mut self) -> Result<(), ResetdError> {
        let lockspaces: Vec<String> = self.channels.keys().cloned().collect();
        for lockspace in lockspaces {
            self.unwatch(&lockspace)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn watched_lockspaces(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }

    /// Drain one round of pending events across every watched lockspace,
    /// reacting to any addressed to our own host id.
    pub fn poll_once(&mut self, now: u64) -> Result<Vec<Reaction>, ResetdError> {
        let mut reactions = Vec::new();
        let lockspaces: Vec<String> = self.channels.keys().cloned().collect();

        for lockspace in lockspaces {
            let channel = self.channels[&lockspace];
            loop {
                let Some(event) = self.engine.get_event(channel)? else {
                    break;
                };
                if event.target_host_id != self.config.own_host_id {
                    continue;
                }
                if event.has(bits::RESET) {
                    self.arm_watchdog(&lockspace, now)?;
                    self.acknowledge(&lockspace, event.from_host_id, bits::RESETTING)?;
                    reactions.push(Reaction::ArmedWatchdog {
                        lockspace: lockspace.clone(),
                        from_host_id: event.from_host_id,
                    });
                }
                if event.has(bits::REBOOT) {
                    self.trigger_sysrq_reboot()?;
                    self.acknowledge(&lockspace, event.from_host_id, bits::REBOOTING)?;
                    reactions.push(Reaction::TriggeredReboot {
                        lockspace: lockspace.clone(),
                        from_host_id: event.from_host_id,
                    });
                }
            }
        }
        Ok(reactions)
    }

    fn arm_watchdog(&self, lockspace: &str, now: u64) -> Result<(), ResetdError> {
        let mut client = WdmClient::connect(&self.config.wdm_socket_path)?;
        client.arm_unrenewable(&format!("resetd:{lockspace}"), now)?;
        Ok(())
    }

    fn trigger_sysrq_reboot(&self) -> Result<(), ResetdError> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.config.sysrq_trigger_path)
            .map_err(ResetdError::Sysrq)?;
        file.write_all(b"b").map_err(ResetdError::Sysrq)?;
        Ok(())
    }

    fn acknowledge(&mut self, lockspace: &str, target_host_id: u64, bit: u64) -> Result<(), ResetdError> {
        let record = EventRecord {
            event: bit,
            target_host_id,
            from_host_id: self.config.own_host_id,
            ..Default::default()
        };
        self.engine
            .set_event(lockspace, &record, SetEventFlags::default())?;
        Ok(())
    }
}
