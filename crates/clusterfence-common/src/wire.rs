//! Shared local-socket wire framing.
//!
//! Both local protocols in this workspace — the watchdog multiplexer's
//! client protocol and the lease engine's control socket — open with the
//! same fixed eight-field header before any command-specific payload. A
//! single header type keeps the framing logic (and its tests) in one place
//! instead of duplicated across two crates.

use std::io::{self, Read, Write};

/// Magic value every header must start with. Chosen once for this
/// workspace; a header that doesn't carry it is either talking a foreign
/// protocol or corrupt.
pub const WIRE_MAGIC: u32 = 0x4c4b_4657; // "WFKL" in ASCII, read as a little-endian u32

/// Current protocol version carried in the header's `version` field.
pub const WIRE_VERSION: u16 = 1;

/// Fixed-size header shared by every request and reply on a local socket in
/// this workspace.
///
/// Layout mirrors the `magic / version / cmd / cmd_flags / length / data /
/// data2 / reserved` shape used by sanlock-style local-socket daemons: a
/// magic+version pair to reject foreign peers, an opcode with a flags word,
/// a total message length (header + payload), two opaque 32-bit data words
/// for small scalar arguments, and a reserved word for alignment and future
/// use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub magic: u32,
    pub version: u16,
    pub cmd: u16,
    pub cmd_flags: u32,
    pub length: u32,
    pub data: u32,
    pub data2: u32,
    pub reserved: u32,
}

/// Encoded size of [`WireHeader`] on the wire, in bytes.
pub const WIRE_HEADER_LEN: usize = 4 + 2 + 2 + 4 + 4 + 4 + 4 + 4;

/// Errors that can occur while framing or parsing a wire header.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("bad magic: expected {WIRE_MAGIC:#010x}, got {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("declared length {declared} is shorter than the header itself ({WIRE_HEADER_LEN})")]
    LengthTooShort { declared: u32 },

    #[error("declared length {declared} exceeds the maximum allowed message size {max}")]
    LengthTooLong { declared: u32, max: u32 },
}

impl WireHeader {
    /// Build a header for a message with `payload_len` bytes following it.
    #[must_use]
    pub fn new(cmd: u16, cmd_flags: u32, payload_len: u32, data: u32, data2: u32) -> Self {
        Self {
            magic: WIRE_MAGIC,
            version: WIRE_VERSION,
            cmd,
            cmd_flags,
            length: WIRE_HEADER_LEN as u32 + payload_len,
            data,
            data2,
            reserved: 0,
        }
    }

    /// Payload length implied by `length` once the header itself is
    /// subtracted.
    #[must_use]
    pub fn payload_len(&self) -> u32 {
        self.length.saturating_sub(WIRE_HEADER_LEN as u32)
    }

    /// Encode this header to its wire representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; WIRE_HEADER_LEN] {
        let mut buf = [0u8; WIRE_HEADER_LEN];
        let mut at = 0;
        macro_rules! put {
            ($val:expr, $ty:ty) => {{
                let bytes = <$ty>::to_le_bytes($val);
                buf[at..at + bytes.len()].copy_from_slice(&bytes);
                at += bytes.len();
            }};
        }
        put!(self.magic, u32);
        put!(self.version, u16);
        put!(self.cmd, u16);
        put!(self.cmd_flags, u32);
        put!(self.length, u32);
        put!(self.data, u32);
        put!(self.data2, u32);
        put!(self.reserved, u32);
        buf
    }

    /// Parse a header from its wire representation, rejecting bad magic,
    /// unsupported versions, and implausible lengths.
    pub fn from_bytes(buf: &[u8; WIRE_HEADER_LEN], max_message_len: u32) -> Result<Self, WireError> {
        let mut at = 0;
        macro_rules! take {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let bytes: [u8; N] = buf[at..at + N].try_into().expect("slice length matches N");
                at += N;
                <$ty>::from_le_bytes(bytes)
            }};
        }
        let magic: u32 = take!(u32);
        let version: u16 = take!(u16);
        let cmd: u16 = take!(u16);
        let cmd_flags: u32 = take!(u32);
        let length: u32 = take!(u32);
        let data: u32 = take!(u32);
        let data2: u32 = take!(u32);
        let reserved: u32 = take!(u32);

        if magic != WIRE_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        if length < WIRE_HEADER_LEN as u32 {
            return Err(WireError::LengthTooShort { declared: length });
        }
        if length > max_message_len {
            return Err(WireError::LengthTooLong {
                declared: length,
                max: max_message_len,
            });
        }

        Ok(Self {
            magic,
            version,
            cmd,
            cmd_flags,
            length,
            data,
            data2,
            reserved,
        })
    }

    /// Write this header to `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), WireError> {
        w.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Read and validate a header from `r`.
    pub fn read_from<R: Read>(r: &mut R, max_message_len: u32) -> Result<Self, WireError> {
        let mut buf = [0u8; WIRE_HEADER_LEN];
        r.read_exact(&mut buf)?;
        Self::from_bytes(&buf, max_message_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let h = WireHeader::new(7, 0x1, 16, 42, 43);
        let bytes = h.to_bytes();
        let parsed = WireHeader::from_bytes(&bytes, 4096).unwrap();
        assert_eq!(h, parsed);
        assert_eq!(parsed.payload_len(), 16);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = WireHeader::new(1, 0, 0, 0, 0).to_bytes();
        bytes[0] ^= 0xff;
        let err = WireHeader::from_bytes(&bytes, 4096).unwrap_err();
        assert!(matches!(err, WireError::BadMagic(_)));
    }

    #[test]
    fn rejects_oversized_length() {
        let bytes = WireHeader::new(1, 0, 100_000, 0, 0).to_bytes();
        let err = WireHeader::from_bytes(&bytes, 4096).unwrap_err();
        assert!(matches!(err, WireError::LengthTooLong { .. }));
    }

    #[test]
    fn read_write_through_cursor() {
        let h = WireHeader::new(3, 0, 0, 9, 10);
        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let parsed = WireHeader::read_from(&mut cursor, 4096).unwrap();
        assert_eq!(h, parsed);
    }
}
