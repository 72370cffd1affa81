//! Wire client for a real lease daemon's control socket (§6.1).
//!
//! The lease storage engine itself is out of scope; this client only
//! speaks the local-socket framing the orchestrator and the target-side
//! reset watcher use to reach it, built on
//! [`clusterfence_common::wire::WireHeader`] — the same header shape the
//! watchdog multiplexer's client protocol uses.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use clusterfence_common::wire::{WireError, WireHeader, WIRE_HEADER_LEN};

use crate::engine::{HostInfo, HostStatus, LeaseEngine, LeaseError};
use crate::event::{self, EventRecord, SetEventFlags, EVENT_RECORD_LEN};

/// Opcodes carried in the lease control socket header's `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LeaseCmd {
    RegEvent = 1,
    EndEvent = 2,
    GetEvent = 3,
    SetEvent = 4,
    GetHosts = 5,
}

/// Maximum length of a lockspace name on the wire, matching the
/// reference implementation's `SANLK_NAME_LEN`.
pub const LOCKSPACE_NAME_SIZE: usize = 48;

/// Largest message this client will read from the daemon before giving
/// up, guarding against a corrupt or hostile peer.
const MAX_MESSAGE_LEN: u32 = 64 * 1024;

/// Fixed width of one [`HostInfo`] entry in a `GetHosts` reply.
const HOST_INFO_LEN: usize = 8 + 8 + 8 + 4 + 4;

#[derive(Debug, thiserror::Error)]
pub enum LeaseClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire framing error: {0}")]
    Wire(#[from] WireError),

    #[error("lockspace name {0:?} exceeds {LOCKSPACE_NAME_SIZE} bytes")]
    NameTooLong(String),

    #[error("daemon returned error status {0}")]
    Remote(u32),

    #[error("malformed reply payload: {0}")]
    MalformedReply(String),
}

impl From<LeaseClientError> for LeaseError {
    fn from(e: LeaseClientError) -> Self {
        match e {
            LeaseClientError::Io(e) => LeaseError::Io(e),
            other => LeaseError::Protocol(other.to_string()),
        }
    }
}

fn pad_name(name: &str) -> Result<[u8; LOCKSPACE_NAME_SIZE], LeaseClientError> {
    let bytes = name.as_bytes();
    if bytes.len() > LOCKSPACE_NAME_SIZE {
        return Err(LeaseClientError::NameTooLong(name.to_string()));
    }
    let mut buf = [0u8; LOCKSPACE_NAME_SIZE];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// A connection to a real lease daemon's control socket.
pub struct LeaseClient {
    stream: UnixStream,
}

impl LeaseClient {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, LeaseClientError> {
        let stream = UnixStream::connect(path)?;
        Ok(Self { stream })
    }

    fn roundtrip(
        &mut self,
        cmd: LeaseCmd,
        data: u32,
        data2: u32,
        payload: &[u8],
    ) -> Result<(WireHeader, Vec<u8>), LeaseClientError> {
        let request = WireHeader::new(cmd as u16, 0, payload.len() as u32, data, data2);
        self.stream.write_all(&request.to_bytes())?;
        self.stream.write_all(payload)?;

        let reply = WireHeader::read_from(&mut self.stream, MAX_MESSAGE_LEN)?;
        if reply.cmd_flags != 0 {
            return Err(LeaseClientError::Remote(reply.cmd_flags));
        }
        let mut body = vec![0u8; reply.payload_len() as usize];
        self.stream.read_exact(&mut body)?;
        Ok((reply, body))
    }
}

impl LeaseEngine for LeaseClient {
    /// The daemon's own channel id, carried back to it on every later
    /// call for this channel.
    type Channel = u32;

    fn reg_event(&mut self, lockspace: &str) -> Result<Self::Channel, LeaseError> {
        let name = pad_name(lockspace)?;
        let (reply, _) = self.roundtrip(LeaseCmd::RegEvent, 0, 0, &name)?;
        Ok(reply.data)
    }

    fn end_event(&mut self, channel: Self::Channel, lockspace: &str) -> Result<(), LeaseError> {
        let name = pad_name(lockspace)?;
        self.roundtrip(LeaseCmd::EndEvent, channel, 0, &name)?;
        Ok(())
    }

    fn get_event(&mut self, channel: Self::Channel) -> Result<Option<EventRecord>, LeaseError> {
        let (_, body) = self.roundtrip(LeaseCmd::GetEvent, channel, 0, &[])?;
        if body.is_empty() {
            return Ok(None);
        }
        let record = event::decode(&body)
            .map_err(|e| LeaseClientError::MalformedReply(e.to_string()))?;
        Ok(Some(record))
    }

    fn set_event(
        &mut self,
        lockspace: &str,
        record: &EventRecord,
        flags: SetEventFlags,
    ) -> Result<(), LeaseError> {
        let name = pad_name(lockspace)?;
        let mut payload = Vec::with_capacity(LOCKSPACE_NAME_SIZE + EVENT_RECORD_LEN);
        payload.extend_from_slice(&name);
        payload.extend_from_slice(&event::encode(record));
        let cmd_flags = u32::from(flags.cur_generation);
        let request = WireHeader::new(LeaseCmd::SetEvent as u16, cmd_flags, payload.len() as u32, 0, 0);
        self.stream.write_all(&request.to_bytes())?;
        self.stream.write_all(&payload)?;

        let reply = WireHeader::read_from(&mut self.stream, MAX_MESSAGE_LEN)?;
        if reply.cmd_flags != 0 {
            return Err(LeaseClientError::Remote(reply.cmd_flags).into());
        }
        let mut drain = vec![0u8; reply.payload_len() as usize];
        self.stream.read_exact(&mut drain)?;
        Ok(())
    }

    fn get_hosts(&mut self, lockspace: &str, host_id: u64) -> Result<Vec<HostInfo>, LeaseError> {
        let name = pad_name(lockspace)?;
        let data = (host_id & 0xffff_ffff) as u32;
        let data2 = (host_id >> 32) as u32;
        let (_, body) = self.roundtrip(LeaseCmd::GetHosts, data, data2, &name)?;
        if body.len() % HOST_INFO_LEN != 0 {
            return Err(LeaseClientError::MalformedReply(format!(
                "GetHosts payload length {} is not a multiple of {HOST_INFO_LEN}",
                body.len()
            ))
            .into());
        }
        let mut hosts = Vec::with_capacity(body.len() / HOST_INFO_LEN);
        for chunk in body.chunks_exact(HOST_INFO_LEN) {
            let host_id = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let generation = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
            let timestamp = u64::from_le_bytes(chunk[16..24].try_into().unwrap());
            let io_timeout = u32::from_le_bytes(chunk[24..28].try_into().unwrap());
            let status = match u32::from_le_bytes(chunk[28..32].try_into().unwrap()) {
                1 => HostStatus::Free,
                2 => HostStatus::Live,
                3 => HostStatus::Fail,
                4 => HostStatus::Dead,
                _ => HostStatus::Unknown,
            };
            hosts.push(HostInfo {
                host_id,
                generation,
                timestamp,
                io_timeout,
                status,
            });
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_name_rejects_overlong_lockspace() {
        let long = "x".repeat(LOCKSPACE_NAME_SIZE + 1);
        assert!(matches!(
            pad_name(&long),
            Err(LeaseClientError::NameTooLong(_))
        ));
    }

    #[test]
    fn pad_name_zero_fills_remainder() {
        let buf = pad_name("ls").unwrap();
        assert_eq!(&buf[..2], b"ls");
        assert!(buf[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn header_len_matches_constant() {
        assert_eq!(WIRE_HEADER_LEN, 24);
    }
}
