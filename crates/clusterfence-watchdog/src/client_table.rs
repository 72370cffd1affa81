//! WDM client table (§3, §4.3).
//!
//! Tracks every local client registered over the socket protocol: a
//! renewal/expire pair, a refcount flag, and the bookkeeping needed to
//! honor the "orphan-armed" escape hatch — a client cannot withdraw a
//! committed expire time by simply closing its connection.

use std::collections::HashMap;

/// Opcodes carried in the WDM client protocol header's `cmd` field (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WdmOpcode {
    Register = 1,
    RefcountSet = 2,
    RefcountClear = 3,
    TestLive = 4,
    Status = 5,
    DumpDebug = 6,
}

impl WdmOpcode {
    #[must_use]
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Register),
            2 => Some(Self::RefcountSet),
            3 => Some(Self::RefcountClear),
            4 => Some(Self::TestLive),
            5 => Some(Self::Status),
            6 => Some(Self::DumpDebug),
            _ => None,
        }
    }
}

/// Maximum length of a client's human-readable name (§3).
pub const WDMD_NAME_SIZE: usize = 64;

/// Fixed per-message header carried after [`clusterfence_common::WireHeader`]
/// on the WDM client socket: a name plus a renewal/expire pair, matching
/// every opcode in §4.3.
#[derive(Debug, Clone)]
pub struct WdmRequestHeader {
    pub name: String,
    pub renewal: u64,
    pub expire: u64,
}

/// Wire size of [`WdmRequestHeader`]'s fixed-width encoding: name (64
/// bytes, NUL-padded) + renewal (8) + expire (8).
pub const WDM_REQUEST_HEADER_LEN: usize = WDMD_NAME_SIZE + 8 + 8;

impl WdmRequestHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; WDM_REQUEST_HEADER_LEN] {
        let mut buf = [0u8; WDM_REQUEST_HEADER_LEN];
        let name_bytes = self.name.as_bytes();
        let n = name_bytes.len().min(WDMD_NAME_SIZE);
        buf[..n].copy_from_slice(&name_bytes[..n]);
        buf[WDMD_NAME_SIZE..WDMD_NAME_SIZE + 8].copy_from_slice(&self.renewal.to_le_bytes());
        buf[WDMD_NAME_SIZE + 8..].copy_from_slice(&self.expire.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; WDM_REQUEST_HEADER_LEN]) -> Self {
        let name_end = buf[..WDMD_NAME_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(WDMD_NAME_SIZE);
        let name = String::from_utf8_lossy(&buf[..name_end]).into_owned();
        let renewal = u64::from_le_bytes(buf[WDMD_NAME_SIZE..WDMD_NAME_SIZE + 8].try_into().unwrap());
        let expire = u64::from_le_bytes(buf[WDMD_NAME_SIZE + 8..].try_into().unwrap());
        Self {
            name,
            renewal,
            expire,
        }
    }
}

/// Opaque handle for a registered client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(usize);

/// A single registered client (§3 "Client registration").
#[derive(Debug, Clone)]
pub struct ClientSlot {
    pub pid: libc::pid_t,
    pub name: String,
    pub renewal: u64,
    pub expire: u64,
    pub refcount: bool,
    pub pid_dead: bool,
    /// False once the owning connection has closed. A slot with
    /// `connected == false` and `expire != 0` is "orphan-armed" (§3
    /// invariant ii).
    pub connected: bool,
}

impl ClientSlot {
    /// Orphan-armed: the owning connection is gone but the client's
    /// committed expire time is still counting (§3, §4.3).
    #[must_use]
    pub fn is_orphan_armed(&self) -> bool {
        !self.connected && self.expire != 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientTableError {
    #[error("unknown client slot")]
    UnknownSlot,

    #[error("expire time must strictly increase: current {current}, proposed {proposed}")]
    ExpireNotIncreasing { current: u64, proposed: u64 },

    #[error("name exceeds {WDMD_NAME_SIZE} bytes")]
    NameTooLong,
}

/// The WDM's table of registered clients.
#[derive(Debug, Default)]
pub struct ClientTable {
    slots: HashMap<SlotHandle, ClientSlot>,
    next: usize,
}

impl ClientTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client on accept (§3 "Lifecycle summary: client
    /// slots created on accept").
    pub fn register(&mut self, pid: libc::pid_t, name: &str) -> Result<SlotHandle, ClientTableError> {
        if name.len() > WDMD_NAME_SIZE {
            return Err(ClientTableError::NameTooLong);
        }
        let handle = SlotHandle(self.next);
        self.next += 1;
        self.slots.insert(
            handle,
            ClientSlot {
                pid,
                name: name.to_string(),
                renewal: 0,
                expire: 0,
                refcount: false,
                pid_dead: false,
                connected: true,
            },
        );
        Ok(handle)
    }

    #[must_use]
    pub fn get(&self, handle: SlotHandle) -> Option<&ClientSlot> {
        self.slots.get(&handle)
    }

    /// Atomically overwrite the (renewal, expire) pair for `handle`'s
    /// slot (§4.3 `TEST_LIVE`). Enforces invariant (i): once non-zero,
    /// expire may only move strictly forward.
    pub fn test_live(
        &mut self,
        handle: SlotHandle,
        renewal: u64,
        expire: u64,
    ) -> Result<(), ClientTableError> {
        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(ClientTableError::UnknownSlot)?;
        if slot.expire != 0 && expire != 0 && expire <= slot.expire {
            return Err(ClientTableError::ExpireNotIncreasing {
                current: slot.expire,
                proposed: expire,
            });
        }
        slot.renewal = renewal;
        slot.expire = expire;
        Ok(())
    }

    pub fn set_refcount(&mut self, handle: SlotHandle, on: bool) -> Result<(), ClientTableError> {
        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(ClientTableError::UnknownSlot)?;
        slot.refcount = on;
        Ok(())
    }

    /// Handle connection close (§3 "Disconnect semantics", §4.3). Frees
    /// the slot if `expire == 0`; otherwise marks it orphan-armed and
    /// keeps it in the table.
    pub fn disconnect(&mut self, handle: SlotHandle) {
        let Some(slot) = self.slots.get_mut(&handle) else {
            return;
        };
        if slot.expire == 0 {
            self.slots.remove(&handle);
        } else {
            slot.connected = false;
        }
    }

    /// Whether the daemon must refuse clean shutdown: some slot has
    /// `refcount` set, or some slot is orphan-armed (§3 invariants ii,
    /// iii; §5 cancellation rule).
    #[must_use]
    pub fn active_clients(&self) -> bool {
        self.slots
            .values()
            .any(|s| s.refcount || s.is_orphan_armed())
    }

    /// Every slot with a non-zero expire, for the test loop's CLIENT
    /// tests (§4.2 step 3).
    pub fn clients_with_expire(&self) -> impl Iterator<Item = (SlotHandle, &ClientSlot)> {
        self.slots.iter().filter(|(_, s)| s.expire != 0).map(|(h, s)| (*h, s))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &ClientSlot)> {
        self.slots.iter().map(|(h, s)| (*h, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let mut table = ClientTable::new();
        let h = table.register(42, "sanlock").unwrap();
        let slot = table.get(h).unwrap();
        assert_eq!(slot.pid, 42);
        assert_eq!(slot.name, "sanlock");
        assert_eq!(slot.expire, 0);
    }

    #[test]
    fn expire_must_strictly_increase() {
        let mut table = ClientTable::new();
        let h = table.register(1, "c").unwrap();
        table.test_live(h, 10, 100).unwrap();
        let err = table.test_live(h, 10, 100).unwrap_err();
        assert!(matches!(err, ClientTableError::ExpireNotIncreasing { .. }));
        let err = table.test_live(h, 10, 50).unwrap_err();
        assert!(matches!(err, ClientTableError::ExpireNotIncreasing { .. }));
        table.test_live(h, 20, 101).unwrap();
        assert_eq!(table.get(h).unwrap().expire, 101);
    }

    #[test]
    fn disconnect_frees_slot_with_no_expire() {
        let mut table = ClientTable::new();
        let h = table.register(1, "c").unwrap();
        table.disconnect(h);
        assert!(table.get(h).is_none());
        assert!(!table.active_clients());
    }

    #[test]
    fn disconnect_orphan_arms_a_committed_slot() {
        let mut table = ClientTable::new();
        let h = table.register(1, "c").unwrap();
        table.test_live(h, 5, 100).unwrap();
        table.disconnect(h);

        let slot = table.get(h).unwrap();
        assert!(!slot.connected);
        assert!(slot.is_orphan_armed());
        assert!(table.active_clients());
    }

    #[test]
    fn refcount_blocks_shutdown() {
        let mut table = ClientTable::new();
        let h = table.register(1, "c").unwrap();
        assert!(!table.active_clients());
        table.set_refcount(h, true).unwrap();
        assert!(table.active_clients());
        table.set_refcount(h, false).unwrap();
        assert!(!table.active_clients());
    }

    #[test]
    fn name_too_long_is_rejected() {
        let mut table = ClientTable::new();
        let long_name = "x".repeat(WDMD_NAME_SIZE + 1);
        assert!(matches!(
            table.register(1, &long_name),
            Err(ClientTableError::NameTooLong)
        ));
    }

    #[test]
    fn request_header_roundtrips() {
        let h = WdmRequestHeader {
            name: "sanlock".into(),
            renewal: 111,
            expire: 222,
        };
        let bytes = h.to_bytes();
        let parsed = WdmRequestHeader::from_bytes(&bytes);
        assert_eq!(parsed.name, "sanlock");
        assert_eq!(parsed.renewal, 111);
        assert_eq!(parsed.expire, 222);
    }
}
