//! Lease-engine abstraction consumed by the reset orchestrator (§6.1).
//!
//! The delta/resource lease storage engine itself is out of scope
//! (spec §1 "OUT OF SCOPE"); this module models just the five operations
//! the orchestrator and the target-side reset watcher actually call, as
//! a trait, plus an in-memory [`SimulatedLeaseEngine`] so the hard core
//! compiles and is testable without real shared storage.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::event::{EventRecord, SetEventFlags};

/// A target host's derived liveness status (§3 "Host status flag").
/// `DEAD` is derived by the real lease engine from timestamps that have
/// not advanced for a lease-timeout interval; the out-of-scope storage
/// engine owns that derivation. [`SimulatedLeaseEngine`] exposes a way
/// for tests to set it directly rather than reimplementing delta-lease
/// timeout math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostStatus {
    #[default]
    Unknown,
    Free,
    Live,
    Fail,
    Dead,
}

/// One row of `get_hosts` (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub host_id: u64,
    pub generation: u64,
    pub timestamp: u64,
    pub io_timeout: u32,
    pub status: HostStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lockspace {0:?} is not registered with this engine")]
    UnknownLockspace(String),

    #[error("channel does not belong to lockspace {0:?}")]
    ChannelMismatch(String),

    #[error("host {host_id} not found in lockspace {lockspace:?}")]
    HostNotFound { lockspace: String, host_id: u64 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The five lease-engine operations the reset subsystem depends on
/// (§6.1). `Channel` is an opaque handle returned by `reg_event` and
/// consumed by `end_event`/`get_event`.
pub trait LeaseEngine {
    type Channel: Copy + Eq + std::fmt::Debug;

    /// Open an event channel in `lockspace`, scoped to this engine's own
    /// host identity — `get_event` on the returned channel will surface
    /// events addressed to that host.
    fn reg_event(&mut self, lockspace: &str) -> Result<Self::Channel, LeaseError>;

    /// Close a previously opened channel.
    fn end_event(&mut self, channel: Self::Channel, lockspace: &str) -> Result<(), LeaseError>;

    /// Drain the next pending inbound event on `channel`, if any.
    /// `Ok(None)` is the `EAGAIN` case: no event pending right now.
    fn get_event(&mut self, channel: Self::Channel)
        -> Result<Option<EventRecord>, LeaseError>;

    /// Write an event addressed to `record.target_host_id` in
    /// `lockspace`. Delivered on the target's next renewal.
    fn set_event(
        &mut self,
        lockspace: &str,
        record: &EventRecord,
        flags: SetEventFlags,
    ) -> Result<(), LeaseError>;

    /// Current lease state for `host_id` in `lockspace` (or every host,
    /// if the engine implementation defines `host_id == 0` that way;
    /// `SimulatedLeaseEngine` does not, and always scopes to one host).
    fn get_hosts(&mut self, lockspace: &str, host_id: u64) -> Result<Vec<HostInfo>, LeaseError>;
}

/// Opaque channel handle for [`SimulatedLeaseEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimChannel(usize);

#[derive(Debug, Default)]
struct HostRow {
    generation: u64,
    timestamp: u64,
    io_timeout: u32,
    status: HostStatus,
}

#[derive(Debug, Default)]
struct LockspaceRow {
    hosts: HashMap<u64, HostRow>,
    inbox: HashMap<u64, VecDeque<QueuedEvent>>,
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    record: EventRecord,
    bind_at_read: bool,
}

#[derive(Debug, Default)]
struct Storage {
    lockspaces: HashMap<String, LockspaceRow>,
}

/// Shared backing store for a cluster of [`SimulatedLeaseEngine`]
/// instances in a test — the in-memory stand-in for shared block
/// storage. Clone the `Arc` to give each simulated host its own engine
/// handle onto the same lockspaces.
#[derive(Clone, Default)]
pub struct SimulatedStorage(Arc<Mutex<Storage>>);

impl SimulatedStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directly advance a host's observed timestamp, as the out-of-scope
    /// lease engine would on a successful renewal. Also the hook tests
    /// use to simulate a target continuing to renew after RESET.
    pub fn renew(&self, lockspace: &str, host_id: u64, timestamp: u64, io_timeout: u32) {
        let mut storage = self.0.lock().expect("storage mutex poisoned");
        let row = storage.lockspaces.entry(lockspace.to_string()).or_default();
        let host = row.hosts.entry(host_id).or_default();
        host.timestamp = timestamp;
        host.io_timeout = io_timeout;
        if host.status == HostStatus::Unknown {
            host.status = HostStatus::Live;
        }
    }

    /// Force a host's derived status, standing in for the out-of-scope
    /// lease engine's DEAD/FREE derivation.
    pub fn set_status(&self, lockspace: &str, host_id: u64, status: HostStatus) {
        let mut storage = self.0.lock().expect("storage mutex poisoned");
        let row = storage.lockspaces.entry(lockspace.to_string()).or_default();
        row.hosts.entry(host_id).or_default().status = status;
    }

    /// Bump a host's generation, as would happen if it rejoined the
    /// lockspace after losing and reacquiring its lease.
    pub fn set_generation(&self, lockspace: &str, host_id: u64, generation: u64) {
        let mut storage = self.0.lock().expect("storage mutex poisoned");
        let row = storage.lockspaces.entry(lockspace.to_string()).or_default();
        row.hosts.entry(host_id).or_default().generation = generation;
    }
}

/// In-memory [`LeaseEngine`] backed by [`SimulatedStorage`], standing in
/// for a real lease daemon talking to shared block storage.
pub struct SimulatedLeaseEngine {
    storage: SimulatedStorage,
    host_id: u64,
    channels: HashMap<usize, String>,
    next_channel: usize,
}

impl SimulatedLeaseEngine {
    #[must_use]
    pub fn new(storage: SimulatedStorage, host_id: u64) -> Self {
        Self {
            storage,
            host_id,
            channels: HashMap::new(),
            next_channel: 0,
        }
    }

    #[must_use]
    pub fn host_id(&self) -> u64 {
        self.host_id
    }

    #[must_use]
    pub fn storage(&self) -> &SimulatedStorage {
        &self.storage
    }
}

impl LeaseEngine for SimulatedLeaseEngine {
    type Channel = SimChannel;

    fn reg_event(&mut self, lockspace: &str) -> Result<Self::Channel, LeaseError> {
        let handle = self.next_channel;
        self.next_channel += 1;
        self.channels.insert(handle, lockspace.to_string());

        let mut storage = self.storage.0.lock().expect("storage mutex poisoned");
        let row = storage.lockspaces.entry(lockspace.to_string()).or_default();
        row.hosts.entry(self.host_id).or_default();
        row.inbox.entry(self.host_id).or_default();
        Ok(SimChannel(handle))
    }

    fn end_event(&mut self, channel: Self::Channel, lockspace: &str) -> Result<(), LeaseError> {
        match self.channels.get(&channel.0) {
            Some(ls) if ls == lockspace => {
                self.channels.remove(&channel.0);
                Ok(())
            }
            Some(_) => Err(LeaseError::ChannelMismatch(lockspace.to_string())),
            None => Err(LeaseError::UnknownLockspace(lockspace.to_string())),
        }
    }

    fn get_event(&mut self, channel: Self::Channel) -> Result<Option<EventRecord>, LeaseError> {
        let lockspace = self
            .channels
            .get(&channel.0)
            .ok_or_else(|| LeaseError::UnknownLockspace("<unknown channel>".to_string()))?
            .clone();

        let mut storage = self.storage.0.lock().expect("storage mutex poisoned");
        let row = storage
            .lockspaces
            .get_mut(&lockspace)
            .ok_or(LeaseError::UnknownLockspace(lockspace.clone()))?;
        let current_generation = row
            .hosts
            .get(&self.host_id)
            .map(|h| h.generation)
            .unwrap_or(0);
        let inbox = row.inbox.entry(self.host_id).or_default();
        Ok(inbox.pop_front().map(|mut queued| {
            if queued.bind_at_read {
                queued.record.target_generation = current_generation;
            }
            queued.record
        }))
    }

    fn set_event(
        &mut self,
        lockspace: &str,
        record: &EventRecord,
        flags: SetEventFlags,
    ) -> Result<(), LeaseError> {
        let mut storage = self.storage.0.lock().expect("storage mutex poisoned");
        let row = storage.lockspaces.entry(lockspace.to_string()).or_default();
        row.inbox
            .entry(record.target_host_id)
            .or_default()
            .push_back(QueuedEvent {
                record: *record,
                bind_at_read: flags.cur_generation,
            });
        Ok(())
    }

    fn get_hosts(&mut self, lockspace: &str, host_id: u64) -> Result<Vec<HostInfo>, LeaseError> {
        let storage = self.storage.0.lock().expect("storage mutex poisoned");
        let Some(row) = storage.lockspaces.get(lockspace) else {
            return Ok(Vec::new());
        };
        let Some(host) = row.hosts.get(&host_id) else {
            return Ok(Vec::new());
        };
        Ok(vec![HostInfo {
            host_id,
            generation: host.generation,
            timestamp: host.timestamp,
            io_timeout: host.io_timeout,
            status: host.status,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::bits;

    #[test]
    fn set_then_get_event_delivers_to_target() {
        let storage = SimulatedStorage::new();
        let mut h1 = SimulatedLeaseEngine::new(storage.clone(), 1);
        let mut h2 = SimulatedLeaseEngine::new(storage, 2);

        let ch1 = h1.reg_event("ls").unwrap();
        let ch2 = h2.reg_event("ls").unwrap();

        assert!(h1.get_event(ch1).unwrap().is_none());

        h1.set_event(
            "ls",
            &EventRecord {
                event: bits::RESET,
                target_host_id: 2,
                from_host_id: 1,
                ..Default::default()
            },
            SetEventFlags::default(),
        )
        .unwrap();

        let got = h2.get_event(ch2).unwrap().unwrap();
        assert!(got.has(bits::RESET));
        assert_eq!(got.from_host_id, 1);
        assert!(h2.get_event(ch2).unwrap().is_none());
    }

    #[test]
    fn cur_generation_flag_binds_at_read_time() {
        let storage = SimulatedStorage::new();
        storage.set_generation("ls", 2, 5);
        let mut h1 = SimulatedLeaseEngine::new(storage.clone(), 1);
        let mut h2 = SimulatedLeaseEngine::new(storage.clone(), 2);
        let ch2 = h2.reg_event("ls").unwrap();

        h1.set_event(
            "ls",
            &EventRecord {
                event: bits::RESET,
                target_host_id: 2,
                target_generation: 1,
                ..Default::default()
            },
            SetEventFlags { cur_generation: true },
        )
        .unwrap();

        // Generation bumps again before the target reads it.
        storage.set_generation("ls", 2, 9);
        let got = h2.get_event(ch2).unwrap().unwrap();
        assert_eq!(got.target_generation, 9);
    }

    #[test]
    fn get_hosts_reflects_renewals() {
        let storage = SimulatedStorage::new();
        storage.renew("ls", 2, 100, 10);
        let mut h1 = SimulatedLeaseEngine::new(storage, 1);

        let hosts = h1.get_hosts("ls", 2).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].timestamp, 100);
        assert_eq!(hosts[0].io_timeout, 10);
        assert_eq!(hosts[0].status, HostStatus::Live);
    }

    #[test]
    fn get_hosts_empty_for_unknown_host() {
        let storage = SimulatedStorage::new();
        let mut h1 = SimulatedLeaseEngine::new(storage, 1);
        assert!(h1.get_hosts("ls", 99).unwrap().is_empty());
    }

    #[test]
    fn end_event_rejects_mismatched_lockspace() {
        let storage = SimulatedStorage::new();
        let mut h1 = SimulatedLeaseEngine::new(storage, 1);
        let ch = h1.reg_event("ls-a").unwrap();
        let err = h1.end_event(ch, "ls-b").unwrap_err();
        assert!(matches!(err, LeaseError::ChannelMismatch(_)));
    }
}
