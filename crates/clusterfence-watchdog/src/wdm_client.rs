//! Client side of the WDM local-socket protocol (§4.3, §6.2).
//!
//! `clusterfence-wdmd` itself never needs this — it only serves the
//! protocol. It exists for processes that *register as a client* of a
//! running multiplexer: the target-side reset watcher opens a
//! deliberately un-renewable registration here when it receives a RESET
//! event.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use clusterfence_common::wire::{WireError, WireHeader};

use crate::client_table::{WdmOpcode, WdmRequestHeader};

const MAX_MESSAGE_LEN: u32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum WdmClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire framing error: {0}")]
    Wire(#[from] WireError),

    #[error("wdmd rejected the request, status {0}")]
    Rejected(u32),
}

/// A connection to a running `clusterfence-wdmd` instance's client
/// socket.
pub struct WdmClient {
    stream: UnixStream,
}

impl WdmClient {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, WdmClientError> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    fn call(&mut self, opcode: WdmOpcode, body: &WdmRequestHeader) -> Result<(), WdmClientError> {
        let payload = body.to_bytes();
        let request = WireHeader::new(opcode as u16, 0, payload.len() as u32, 0, 0);
        self.stream.write_all(&request.to_bytes())?;
        self.stream.write_all(&payload)?;

        let reply = WireHeader::read_from(&mut self.stream, MAX_MESSAGE_LEN)?;
        let mut drain = vec![0u8; reply.payload_len() as usize];
        self.stream.read_exact(&mut drain)?;
        if reply.data != 0 {
            return Err(WdmClientError::Rejected(reply.data));
        }
        Ok(())
    }

    /// Register this connection as a new client slot under `name`
    /// (§4.3 `REGISTER`).
    pub fn register(&mut self, name: &str) -> Result<(), WdmClientError> {
        self.call(
            WdmOpcode::Register,
            &WdmRequestHeader {
                name: name.to_string(),
                renewal: 0,
                expire: 0,
            },
        )
    }

    /// Atomically commit a new (renewal, expire) pair for this slot
    /// (§4.3 `TEST_LIVE`). Expire must strictly increase once non-zero.
    pub fn test_live(&mut self, renewal: u64, expire: u64) -> Result<(), WdmClientError> {
        self.call(
            WdmOpcode::TestLive,
            &WdmRequestHeader {
                name: String::new(),
                renewal,
                expire,
            },
        )
    }

    pub fn set_refcount(&mut self, on: bool) -> Result<(), WdmClientError> {
        let opcode = if on {
            WdmOpcode::RefcountSet
        } else {
            WdmOpcode::RefcountClear
        };
        self.call(
            opcode,
            &WdmRequestHeader {
                name: String::new(),
                renewal: 0,
                expire: 0,
            },
        )
    }

    /// Commit a registration this process will never renew again,
    /// guaranteeing the next test pass counts it as failed (§4.2 step
    /// 3's early-fail window). Used by the target-side reset watcher to
    /// deliberately stop the local watchdog from being petted.
    pub fn arm_unrenewable(&mut self, name: &str, now: u64) -> Result<(), WdmClientError> {
        self.register(name)?;
        self.test_live(now, now)
    }
}
