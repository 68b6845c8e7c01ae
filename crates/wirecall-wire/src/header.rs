use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{Result, WireError};

/// Wire header size: magic (8) + version (4) + size (4) + function (8)
/// + tag (8) + reserved (8) = 40 bytes.
pub const HEADER_SIZE: usize = 40;

/// Header magic: the bytes "wirecall", read as a little-endian u64.
pub const MAGIC: u64 = u64::from_le_bytes(*b"wirecall");

/// Current protocol version.
pub const VERSION: u32 = 1;

/// A 64-bit RPC method key: a 32-bit interface id plus a 32-bit method id.
///
/// The interface id occupies the low half and the method id the high half,
/// so two ids composed from the same halves compare equal as a single u64.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(u64);

impl FunctionId {
    /// Compose from an interface id and a method id.
    pub const fn new(interface: u32, method: u32) -> Self {
        Self((method as u64) << 32 | interface as u64)
    }

    /// Reinterpret a raw 64-bit value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The packed 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The interface id half.
    pub const fn interface(self) -> u32 {
        self.0 as u32
    }

    /// The method id half.
    pub const fn method(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface(), self.method())
    }
}

impl fmt::Debug for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionId({}.{})", self.interface(), self.method())
    }
}

impl From<u64> for FunctionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Framing record prefixed to every message on the wire.
///
/// Wire format (little-endian, point-to-point; both peers are assumed to
/// share representation):
/// ```text
/// ┌───────────┬──────────┬──────────┬───────────┬──────────┬────────────┐
/// │ Magic     │ Version  │ Size     │ Function  │ Tag      │ Reserved   │
/// │ (8B)      │ (4B)     │ (4B)     │ (8B)      │ (8B)     │ (8B)       │
/// └───────────┴──────────┴──────────┴───────────┴──────────┴────────────┘
/// ```
/// `size` is the payload length following the header, excluding the header
/// itself. `tag` is chosen by the client, strictly increasing per
/// connection, and echoed verbatim in the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload byte length following the header.
    pub size: u32,
    /// Function routing key.
    pub function: FunctionId,
    /// Per-connection request identifier.
    pub tag: u64,
    /// Padding; must round-trip unchanged.
    pub reserved: u64,
}

impl Header {
    /// Create a header for a message of `size` payload bytes.
    pub fn new(function: FunctionId, tag: u64, size: u32) -> Self {
        Self {
            size,
            function,
            tag,
            reserved: 0,
        }
    }

    /// Encode into the wire format.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u64_le(MAGIC);
        dst.put_u32_le(VERSION);
        dst.put_u32_le(self.size);
        dst.put_u64_le(self.function.as_u64());
        dst.put_u64_le(self.tag);
        dst.put_u64_le(self.reserved);
    }

    /// Encode into a fixed array.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode from a full header prefix, validating magic and version.
    ///
    /// A failure here means the stream is corrupt; callers must tear the
    /// connection down rather than attempt to resynchronize.
    pub fn decode(src: &[u8; HEADER_SIZE]) -> Result<Self> {
        let field =
            |range: std::ops::Range<usize>| -> &[u8] { &src[range] };

        let magic = u64::from_le_bytes(field(0..8).try_into().expect("8-byte slice"));
        if magic != MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = u32::from_le_bytes(field(8..12).try_into().expect("4-byte slice"));
        if version != VERSION {
            return Err(WireError::VersionMismatch {
                got: version,
                expected: VERSION,
            });
        }
        let size = u32::from_le_bytes(field(12..16).try_into().expect("4-byte slice"));
        let function = u64::from_le_bytes(field(16..24).try_into().expect("8-byte slice"));
        let tag = u64::from_le_bytes(field(24..32).try_into().expect("8-byte slice"));
        let reserved = u64::from_le_bytes(field(32..40).try_into().expect("8-byte slice"));

        Ok(Self {
            size,
            function: FunctionId::from_raw(function),
            tag,
            reserved,
        })
    }
}
