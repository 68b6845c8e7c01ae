use std::sync::Arc;

use bytes::BytesMut;

/// Pluggable allocation strategy for owned scatter-gather segments.
///
/// Used wherever a message lands in memory the caller did not pre-size:
/// the open-buffer receive path and server-side response staging.
pub trait Allocator: Send + Sync {
    /// Allocate a zero-initialized buffer of exactly `len` bytes.
    fn allocate(&self, len: usize) -> BytesMut;
}

/// Shared handle to an allocation strategy.
pub type IoAlloc = Arc<dyn Allocator>;

/// Default allocator: plain heap allocations.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, len: usize) -> BytesMut {
        BytesMut::zeroed(len)
    }
}

/// A shared handle to the default heap allocator.
pub fn default_allocator() -> IoAlloc {
    Arc::new(HeapAllocator)
}
