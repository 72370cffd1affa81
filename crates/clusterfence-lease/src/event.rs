//! Reset event codec (§4.4).
//!
//! The lease renewal payload for a host in a lockspace carries, alongside
//! the monotone lease timestamp, an optional event record addressed to a
//! specific target generation. `set_event` writes a record that the
//! addressed host will read on its next renewal.

/// Bit positions of the 64-bit host event word (§3 "Host event word").
pub mod bits {
    /// Request that the target arm its hardware watchdog.
    pub const RESET: u64 = 1 << 0;
    /// Request a soft reboot via the kernel's sysrq trigger, in addition
    /// to (or instead of) a hardware fence.
    pub const REBOOT: u64 = 1 << 1;
    /// The target acknowledges its watchdog has been armed.
    pub const RESETTING: u64 = 1 << 2;
    /// The target acknowledges a reboot is pending.
    pub const REBOOTING: u64 = 1 << 3;
}

/// An event record carried in a lease renewal's sideband (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventRecord {
    pub event: u64,
    pub data: u64,
    pub target_host_id: u64,
    pub target_generation: u64,
    pub from_host_id: u64,
    pub from_generation: u64,
}

impl EventRecord {
    #[must_use]
    pub fn has(&self, bit: u64) -> bool {
        self.event & bit != 0
    }
}

/// Flags accepted by `set_event` (§4.4, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetEventFlags {
    /// Bind the event to whatever generation the target happens to have
    /// when it reads it, rather than the generation observed when this
    /// event was posted.
    pub cur_generation: bool,
}

/// Encoded size of an [`EventRecord`] on the wire: six little-endian u64
/// fields.
pub const EVENT_RECORD_LEN: usize = 8 * 6;

#[derive(Debug, thiserror::Error)]
pub enum EventCodecError {
    #[error("event record buffer must be exactly {EVENT_RECORD_LEN} bytes, got {0}")]
    WrongLength(usize),
}

/// Encode an [`EventRecord`] for the lease renewal sideband.
#[must_use]
pub fn encode(record: &EventRecord) -> [u8; EVENT_RECORD_LEN] {
    let mut buf = [0u8; EVENT_RECORD_LEN];
    let fields = [
        record.event,
        record.data,
        record.target_host_id,
        record.target_generation,
        record.from_host_id,
        record.from_generation,
    ];
    for (i, field) in fields.iter().enumerate() {
        buf[i * 8..(i + 1) * 8].copy_from_slice(&field.to_le_bytes());
    }
    buf
}

/// Decode an [`EventRecord`] from raw sideband bytes.
pub fn decode(buf: &[u8]) -> Result<EventRecord, EventCodecError> {
    if buf.len() != EVENT_RECORD_LEN {
        return Err(EventCodecError::WrongLength(buf.len()));
    }
    let field = |i: usize| -> u64 {
        u64::from_le_bytes(buf[i * 8..(i + 1) * 8].try_into().expect("exact slice"))
    };
    Ok(EventRecord {
        event: field(0),
        data: field(1),
        target_host_id: field(2),
        target_generation: field(3),
        from_host_id: field(4),
        from_generation: field(5),
    })
}

/// Compose the event word for a `reset` operation from CLI-style flags
/// (§4.5 step 2): RESET when hardware fencing is requested, REBOOT when
/// a soft reboot is also acceptable.
#[must_use]
pub fn compose_reset_event(use_watchdog: bool, use_reboot: bool) -> u64 {
    let mut word = 0;
    if use_watchdog {
        word |= bits::RESET;
    }
    if use_reboot {
        word |= bits::REBOOT;
    }
    word
}
