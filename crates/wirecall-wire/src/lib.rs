//! Wire format and zero-copy serialization for wirecall.
//!
//! This is the core value-add layer of wirecall. Every message is framed
//! with a 40-byte header (magic, version, payload size, function id, tag,
//! reserved padding) and carried as a scatter-gather vector so payloads can
//! point at caller-owned memory instead of being copied. A CRC32 trailer
//! embedded at serialize time lets the exact-size receive path validate
//! integrity without a structural decode.

pub mod alloc;
pub mod error;
pub mod header;
pub mod iov;
pub mod message;

pub use alloc::{default_allocator, Allocator, HeapAllocator, IoAlloc};
pub use error::{Result, WireError};
pub use header::{FunctionId, Header, HEADER_SIZE, MAGIC, VERSION};
pub use iov::{IoVector, Segment, MAX_SEGMENTS};
pub use message::{
    validate_checksum, Deserializer, Message, Operation, Serializer, CHECKSUM_SIZE,
};
