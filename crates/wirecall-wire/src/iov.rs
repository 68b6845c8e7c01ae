use std::io::Write;

use bytes::{Bytes, BytesMut};

use crate::alloc::{default_allocator, IoAlloc};

/// Maximum number of segments in one scatter-gather vector.
pub const MAX_SEGMENTS: usize = 64;

/// One memory segment of a logical message.
#[derive(Debug, Clone)]
pub enum Segment<'a> {
    /// Externally-owned memory, valid for the duration of the call only.
    /// This is what makes sends zero-copy.
    Ref(&'a [u8]),
    /// Allocator-owned (or otherwise refcounted) memory.
    Owned(Bytes),
}

impl Segment<'_> {
    /// View the segment's bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Segment::Ref(data) => data,
            Segment::Owned(data) => data,
        }
    }

    /// Segment length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the segment is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn truncated(&self, len: usize) -> Self {
        match self {
            Segment::Ref(data) => Segment::Ref(&data[..len]),
            Segment::Owned(data) => Segment::Owned(data.slice(..len)),
        }
    }
}

/// An ordered sequence of memory segments forming one logical message.
///
/// Segments are either caller-owned references (mode used for zero-copy
/// sends) or allocator-owned buffers (mode used when the caller does not
/// pre-size a receive buffer). The two modes never mix silently: every
/// push names its mode.
///
/// The vector has a fixed segment budget; pushing past [`MAX_SEGMENTS`]
/// sets a sticky overflow flag instead of growing, which serialization
/// reports as a capacity failure before anything is sent.
pub struct IoVector<'a> {
    segments: Vec<Segment<'a>>,
    allocator: IoAlloc,
    byte_limit: Option<usize>,
    overflow: bool,
}

impl<'a> IoVector<'a> {
    /// Create an empty vector backed by the default heap allocator.
    pub fn new() -> Self {
        Self::with_allocator(default_allocator())
    }

    /// Create an empty vector with an explicit allocation strategy.
    pub fn with_allocator(allocator: IoAlloc) -> Self {
        Self {
            segments: Vec::new(),
            allocator,
            byte_limit: None,
            overflow: false,
        }
    }

    /// Shared handle to this vector's allocation strategy.
    pub fn allocator(&self) -> IoAlloc {
        self.allocator.clone()
    }

    /// Cap the total bytes a receive path may deposit into this vector.
    ///
    /// `None` removes the cap. The transport exchange consults this to
    /// reject responses that would not fit a caller's fixed-size budget.
    pub fn set_byte_limit(&mut self, limit: Option<usize>) {
        self.byte_limit = limit;
    }

    /// The receive byte cap, if any.
    pub fn byte_limit(&self) -> Option<usize> {
        self.byte_limit
    }

    /// Append a caller-owned segment. Empty slices are dropped.
    pub fn push_ref(&mut self, data: &'a [u8]) {
        if !data.is_empty() {
            self.push(Segment::Ref(data));
        }
    }

    /// Append an owned segment. Empty buffers are dropped.
    pub fn push_owned(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.push(Segment::Owned(data));
        }
    }

    fn push(&mut self, segment: Segment<'a>) {
        if self.segments.len() == MAX_SEGMENTS {
            self.overflow = true;
        } else {
            self.segments.push(segment);
        }
    }

    /// Whether a push was dropped because the segment budget ran out.
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    /// Total logical message length in bytes.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Whether the vector holds no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Iterate over segment byte slices in order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(Segment::as_slice)
    }

    /// Cut the logical message down to `len` bytes, dropping and slicing
    /// trailing segments as needed. A `len` at or beyond the current total
    /// is a no-op.
    pub fn truncate(&mut self, len: usize) {
        let mut remaining = len;
        let mut keep = 0;
        for segment in &mut self.segments {
            if remaining == 0 {
                break;
            }
            if segment.len() > remaining {
                *segment = segment.truncated(remaining);
            }
            remaining = remaining.saturating_sub(segment.len());
            keep += 1;
        }
        self.segments.truncate(keep);
    }

    /// Drop all segments and clear the overflow flag.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.overflow = false;
    }

    /// The full message as one contiguous `Bytes`.
    ///
    /// Zero-copy when the vector is a single owned segment (the common
    /// receive shape); otherwise the segments are flattened into a fresh
    /// buffer.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [Segment::Owned(data)] => data.clone(),
            [Segment::Ref(data)] => Bytes::copy_from_slice(data),
            _ => {
                let mut flat = BytesMut::with_capacity(self.len());
                for segment in &self.segments {
                    flat.extend_from_slice(segment.as_slice());
                }
                flat.freeze()
            }
        }
    }

    /// Write every segment in order to `w`. Returns total bytes written.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> std::io::Result<usize> {
        let mut written = 0;
        for segment in &self.segments {
            w.write_all(segment.as_slice())?;
            written += segment.len();
        }
        Ok(written)
    }
}

impl Default for IoVector<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IoVector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoVector")
            .field("segments", &self.segment_count())
            .field("len", &self.len())
            .field("overflow", &self.overflow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_total_length_across_modes() {
        let external = b"external".to_vec();
        let mut iov = IoVector::new();
        iov.push_owned(Bytes::from_static(b"owned"));
        iov.push_ref(&external);
        assert_eq!(iov.len(), 13);
        assert_eq!(iov.segment_count(), 2);
    }

    #[test]
    fn empty_segments_are_dropped() {
        let mut iov = IoVector::new();
        iov.push_ref(b"");
        iov.push_owned(Bytes::new());
        assert!(iov.is_empty());
    }

    #[test]
    fn truncate_slices_across_segment_boundary() {
        let mut iov = IoVector::new();
        iov.push_owned(Bytes::from_static(b"abcd"));
        iov.push_owned(Bytes::from_static(b"efgh"));

        iov.truncate(6);
        assert_eq!(iov.len(), 6);
        assert_eq!(iov.to_bytes().as_ref(), b"abcdef");
    }

    #[test]
    fn truncate_beyond_length_is_noop() {
        let mut iov = IoVector::new();
        iov.push_owned(Bytes::from_static(b"abc"));
        iov.truncate(100);
        assert_eq!(iov.len(), 3);
    }

    #[test]
    fn truncate_to_zero_drops_everything() {
        let mut iov = IoVector::new();
        iov.push_owned(Bytes::from_static(b"abc"));
        iov.truncate(0);
        assert!(iov.is_empty());
    }

    #[test]
    fn to_bytes_is_zero_copy_for_single_owned_segment() {
        let data = Bytes::from_static(b"zero-copy");
        let mut iov = IoVector::new();
        iov.push_owned(data.clone());

        let flat = iov.to_bytes();
        assert_eq!(flat.as_ptr(), data.as_ptr());
    }

    #[test]
    fn to_bytes_flattens_mixed_segments() {
        let external = b"-ref".to_vec();
        let mut iov = IoVector::new();
        iov.push_owned(Bytes::from_static(b"own"));
        iov.push_ref(&external);
        assert_eq!(iov.to_bytes().as_ref(), b"own-ref");
    }

    #[test]
    fn overflow_flag_is_sticky() {
        let mut iov = IoVector::new();
        for _ in 0..MAX_SEGMENTS {
            iov.push_owned(Bytes::from_static(b"x"));
        }
        assert!(!iov.overflowed());

        iov.push_owned(Bytes::from_static(b"one too many"));
        assert!(iov.overflowed());
        assert_eq!(iov.segment_count(), MAX_SEGMENTS);

        iov.clear();
        assert!(!iov.overflowed());
    }

    #[test]
    fn write_to_preserves_order() {
        let external = b"seg2".to_vec();
        let mut iov = IoVector::new();
        iov.push_owned(Bytes::from_static(b"seg1"));
        iov.push_ref(&external);

        let mut out = Vec::new();
        let written = iov.write_to(&mut out).unwrap();
        assert_eq!(written, 8);
        assert_eq!(out, b"seg1seg2");
    }
}
