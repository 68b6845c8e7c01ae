use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::alloc::IoAlloc;
use crate::error::{Result, WireError};
use crate::header::FunctionId;
use crate::iov::IoVector;

/// Byte width of the integrity trailer (little-endian CRC32).
pub const CHECKSUM_SIZE: usize = 4;

/// Serialization contract for one side of an RPC message pair.
///
/// A message is a fixed-size record optionally followed by variable-length
/// fields. The fixed part records the lengths of the variable parts so
/// `decode` can slice them back out. Variable parts are exposed as borrowed
/// slices, letting the serializer append them as reference segments and
/// keep sends zero-copy.
pub trait Message: Sized {
    /// Byte length of the fixed-size record.
    const FIXED_SIZE: usize;

    /// Write exactly [`Self::FIXED_SIZE`] bytes of fixed fields.
    fn encode_fixed(&self, dst: &mut BytesMut);

    /// Variable-length fields, in wire order. Default: none.
    fn variable_parts(&self) -> Vec<&[u8]> {
        Vec::new()
    }

    /// Rebuild a value from the fixed record and the variable section.
    ///
    /// `variable` aliases the receive buffer (refcounted), so decoded
    /// messages keep the zero-copy property: slicing it does not copy.
    fn decode(fixed: &[u8], variable: Bytes) -> Result<Self>;
}

/// Static descriptor binding an RPC method to its wire identity and its
/// request/response serialization contracts.
pub trait Operation {
    /// 32-bit interface id.
    const INTERFACE: u32;
    /// 32-bit method id within the interface.
    const METHOD: u32;
    /// Request message type.
    type Request: Message;
    /// Response message type.
    type Response: Message;

    /// The operation's wire routing key.
    fn id() -> FunctionId {
        FunctionId::new(Self::INTERFACE, Self::METHOD)
    }
}

/// Converts a typed message into a scatter-gather vector.
///
/// Layout: one owned segment holding the fixed record, one reference
/// segment per variable part (pointing at the caller's memory), then a
/// 4-byte CRC32 trailer over everything before it.
pub struct Serializer<'a> {
    /// The assembled message.
    pub iov: IoVector<'a>,
}

impl<'a> Serializer<'a> {
    /// Create a serializer over an empty vector.
    pub fn new() -> Self {
        Self {
            iov: IoVector::new(),
        }
    }

    /// Create a serializer whose vector uses `allocator`.
    pub fn with_allocator(allocator: IoAlloc) -> Self {
        Self {
            iov: IoVector::with_allocator(allocator),
        }
    }

    /// Append `msg` to the vector.
    ///
    /// Fails with [`WireError::SegmentOverflow`] if the vector runs out of
    /// segment slots; nothing has been sent at that point.
    pub fn serialize<M: Message>(&mut self, msg: &'a M) -> Result<()> {
        let mut fixed = BytesMut::with_capacity(M::FIXED_SIZE);
        msg.encode_fixed(&mut fixed);
        debug_assert_eq!(
            fixed.len(),
            M::FIXED_SIZE,
            "encode_fixed must write exactly FIXED_SIZE bytes"
        );

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&fixed);
        self.iov.push_owned(fixed.freeze());

        for part in msg.variable_parts() {
            hasher.update(part);
            self.iov.push_ref(part);
        }

        let sum = hasher.finalize();
        self.iov
            .push_owned(Bytes::copy_from_slice(&sum.to_le_bytes()));

        if self.iov.overflowed() {
            return Err(WireError::SegmentOverflow {
                max: crate::iov::MAX_SEGMENTS,
            });
        }
        trace!(
            bytes = self.iov.len(),
            segments = self.iov.segment_count(),
            "message serialized"
        );
        Ok(())
    }
}

impl Default for Serializer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify the trailing CRC32 of a serialized message.
///
/// Used only on the client's exact-size receive path; the structural
/// decode path validates shape instead.
pub fn validate_checksum(iov: &IoVector<'_>) -> Result<()> {
    let data = iov.to_bytes();
    if data.len() < CHECKSUM_SIZE {
        return Err(WireError::Truncated {
            needed: CHECKSUM_SIZE,
            got: data.len(),
        });
    }
    let (body, trailer) = data.split_at(data.len() - CHECKSUM_SIZE);
    let got = u32::from_le_bytes(trailer.try_into().expect("4-byte trailer"));
    let expected = crc32fast::hash(body);
    if got != expected {
        debug!(got, expected, "checksum mismatch");
        return Err(WireError::ChecksumMismatch { got, expected });
    }
    Ok(())
}

/// Rebuilds typed messages from scatter-gather vectors.
pub struct Deserializer;

impl Deserializer {
    /// Structurally decode `M` from `iov`.
    ///
    /// Splits the fixed prefix, the variable middle and the checksum
    /// trailer, then delegates to [`Message::decode`]. The checksum is not
    /// verified here. The variable section is handed over as a refcounted
    /// slice of the vector's storage, so decoding does not copy payload
    /// bytes.
    pub fn deserialize<M: Message>(iov: &IoVector<'_>) -> Result<M> {
        let data = iov.to_bytes();
        let needed = M::FIXED_SIZE + CHECKSUM_SIZE;
        if data.len() < needed {
            return Err(WireError::Truncated {
                needed,
                got: data.len(),
            });
        }
        let fixed = data.slice(..M::FIXED_SIZE);
        let variable = data.slice(M::FIXED_SIZE..data.len() - CHECKSUM_SIZE);
        M::decode(&fixed, variable)
    }
}
