use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use bytes::Bytes;
use tracing::debug;
use wirecall_transport::ByteStream;
use wirecall_wire::{
    default_allocator, validate_checksum, Deserializer, FunctionId, Header, IoAlloc, IoVector,
    Operation, Serializer, WireError, HEADER_SIZE,
};

use crate::error::{CallError, Result};
use crate::timeout::Timeout;

/// Client-side handle bound to one connection.
///
/// Issues calls, assigns strictly increasing per-connection tags, and
/// matches responses to requests solely by tag, so responses may arrive in
/// any order. Concurrent calls on one stub are multiplexed over the shared
/// stream: whichever caller is waiting takes a turn draining responses and
/// deposits frames addressed to other tags into their slots.
///
/// A transport or protocol failure marks the stub broken; every pending
/// and future call then fails, and a pool holding the stub evicts it.
pub struct Stub<S: ByteStream> {
    writer: Mutex<S>,
    reader: Mutex<S>,
    state: Mutex<RecvState>,
    readable: Condvar,
    next_tag: AtomicU64,
    broken: AtomicBool,
    alloc: IoAlloc,
}

struct RecvState {
    reader_active: bool,
    pending: HashMap<u64, Pending>,
}

struct Pending {
    alloc: IoAlloc,
    budget: Option<usize>,
    outcome: Option<Result<Bytes>>,
}

enum ReadFailure {
    /// No header byte arrived before the caller's deadline; the stream is
    /// still in sync.
    HeaderTimeout,
    /// The stream is corrupt or gone.
    Fatal(CallError),
}

impl<S: ByteStream> std::fmt::Debug for Stub<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub")
            .field("next_tag", &self.next_tag)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<S: ByteStream> Stub<S> {
    /// Create a stub over an established connection.
    pub fn new(stream: S) -> Result<Self> {
        Self::with_allocator(stream, default_allocator())
    }

    /// Create a stub whose receive buffers come from `alloc`.
    pub fn with_allocator(stream: S, alloc: IoAlloc) -> Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(stream),
            state: Mutex::new(RecvState {
                reader_active: false,
                pending: HashMap::new(),
            }),
            readable: Condvar::new(),
            next_tag: AtomicU64::new(1),
            broken: AtomicBool::new(false),
            alloc,
        })
    }

    /// Fixed-buffer call: the response must fit the shape `response`
    /// currently has (callers pre-size variable-length fields to receive
    /// into them).
    ///
    /// When the received byte count equals that budget exactly, only the
    /// embedded checksum is validated; a shorter response (the server used
    /// only fixed fields) is structurally decoded instead. Returns the
    /// number of payload bytes received.
    pub fn call<O: Operation>(
        &self,
        request: &O::Request,
        response: &mut O::Response,
        timeout: Timeout,
    ) -> Result<usize> {
        let mut reqmsg = Serializer::new();
        reqmsg.serialize(request).map_err(capacity)?;

        let expected = {
            let mut shape = Serializer::new();
            shape.serialize(&*response).map_err(capacity)?;
            shape.iov.len()
        };

        let mut resp_iov = IoVector::with_allocator(self.alloc.clone());
        resp_iov.set_byte_limit(Some(expected));
        let received = self.do_call(O::id(), &reqmsg.iov, &mut resp_iov, timeout)?;

        if received == expected {
            validate_checksum(&resp_iov)?;
        }
        *response = Deserializer::deserialize::<O::Response>(&resp_iov)?;
        Ok(received)
    }

    /// Open-buffer call: `resp_iov` must start empty and is filled by the
    /// exchange using its own allocation strategy. No checksum shortcut
    /// applies; the response is structurally decoded, and its
    /// variable-length fields alias `resp_iov`'s storage.
    pub fn call_open<O: Operation>(
        &self,
        request: &O::Request,
        resp_iov: &mut IoVector<'static>,
        timeout: Timeout,
    ) -> Result<O::Response> {
        assert!(
            resp_iov.is_empty(),
            "open-buffer call requires an empty response vector"
        );
        let mut reqmsg = Serializer::new();
        reqmsg.serialize(request).map_err(capacity)?;

        self.do_call(O::id(), &reqmsg.iov, resp_iov, timeout)?;
        Ok(Deserializer::deserialize::<O::Response>(resp_iov)?)
    }

    /// The transport exchange: frame the request with a fresh tag, send
    /// it, and wait for the response carrying the same tag back.
    ///
    /// May be invoked concurrently; responses are matched by tag, never by
    /// arrival order. Returns the number of response payload bytes, which
    /// land in `response` as one allocator-owned segment.
    pub fn do_call(
        &self,
        function: FunctionId,
        request: &IoVector<'_>,
        response: &mut IoVector<'static>,
        timeout: Timeout,
    ) -> Result<usize> {
        if self.broken.load(Ordering::Acquire) {
            return Err(CallError::Broken);
        }

        // Rejected before a tag is claimed or a byte is written, so the
        // connection stays usable.
        let size = u32::try_from(request.len()).map_err(|_| WireError::FrameTooLarge {
            len: request.len(),
            max: u32::MAX,
        })?;

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(
                tag,
                Pending {
                    alloc: response.allocator(),
                    budget: response.byte_limit(),
                    outcome: None,
                },
            );
        }

        if let Err(err) = self.send_request(function, tag, size, request) {
            // A failed write may have left a partial frame on the wire.
            self.mark_broken();
            self.state.lock().unwrap().pending.remove(&tag);
            return Err(err);
        }

        self.await_response(tag, response, timeout)
    }

    /// Shut the underlying connection down.
    pub fn close(&self) -> Result<()> {
        let writer = self.writer.lock().unwrap();
        writer.shutdown()?;
        Ok(())
    }

    /// Whether an earlier failure has made this stub unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    fn send_request(
        &self,
        function: FunctionId,
        tag: u64,
        size: u32,
        request: &IoVector<'_>,
    ) -> Result<()> {
        let header = Header::new(function, tag, size);
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&header.to_bytes())?;
        request.write_to(&mut *writer)?;
        writer.flush()?;
        Ok(())
    }

    fn await_response(
        &self,
        tag: u64,
        response: &mut IoVector<'static>,
        timeout: Timeout,
    ) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.pending.get_mut(&tag) {
                Some(slot) => {
                    if let Some(outcome) = slot.outcome.take() {
                        state.pending.remove(&tag);
                        drop(state);
                        let payload = outcome?;
                        let received = payload.len();
                        response.push_owned(payload);
                        return Ok(received);
                    }
                }
                None => return Err(CallError::Broken),
            }

            if !state.reader_active {
                state.reader_active = true;
                drop(state);
                let read_result = self.read_one_response(&timeout);
                state = self.state.lock().unwrap();
                state.reader_active = false;
                self.readable.notify_all();
                match read_result {
                    Ok(()) => continue,
                    Err(ReadFailure::HeaderTimeout) => {
                        state.pending.remove(&tag);
                        return Err(CallError::Timeout(timeout.duration()));
                    }
                    Err(ReadFailure::Fatal(err)) => {
                        drop(state);
                        self.mark_broken();
                        state = self.state.lock().unwrap();
                        state.pending.remove(&tag);
                        return Err(err);
                    }
                }
            }

            // Another caller is draining the stream; wait for a wakeup.
            match timeout.remaining() {
                None => state = self.readable.wait(state).unwrap(),
                Some(rem) if rem.is_zero() => {
                    state.pending.remove(&tag);
                    return Err(CallError::Timeout(timeout.duration()));
                }
                Some(rem) => state = self.readable.wait_timeout(state, rem).unwrap().0,
            }
        }
    }

    /// Read exactly one response frame off the stream and route it to the
    /// pending call it belongs to. The caller's deadline applies to the
    /// header only; body transfer is not counted against it.
    fn read_one_response(&self, timeout: &Timeout) -> std::result::Result<(), ReadFailure> {
        let mut reader = self.reader.lock().unwrap();

        let header_timeout = match timeout.remaining() {
            None => None,
            Some(rem) if rem.is_zero() => return Err(ReadFailure::HeaderTimeout),
            Some(rem) => Some(rem),
        };
        reader
            .set_read_timeout(header_timeout)
            .map_err(|e| ReadFailure::Fatal(CallError::Io(e)))?;

        let mut raw = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match reader.read(&mut raw[filled..]) {
                Ok(0) => return Err(ReadFailure::Fatal(CallError::ConnectionClosed)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if filled == 0 {
                        return Err(ReadFailure::HeaderTimeout);
                    }
                    // A partial header cannot be resynchronized.
                    return Err(ReadFailure::Fatal(CallError::Io(e)));
                }
                Err(e) => return Err(ReadFailure::Fatal(CallError::Io(e))),
            }
        }

        let header = Header::decode(&raw).map_err(|e| ReadFailure::Fatal(CallError::Wire(e)))?;

        reader
            .set_read_timeout(None)
            .map_err(|e| ReadFailure::Fatal(CallError::Io(e)))?;
        let size = header.size as usize;

        let slot_info = {
            let state = self.state.lock().unwrap();
            state
                .pending
                .get(&header.tag)
                .map(|p| (p.alloc.clone(), p.budget))
        };

        match slot_info {
            None => {
                // Caller gave up (timeout) or never existed; keep the
                // stream in sync by consuming the frame.
                debug!(tag = header.tag, size, "discarding unclaimed response");
                drain(&mut *reader, size).map_err(|e| ReadFailure::Fatal(e.into()))?;
            }
            Some((_, Some(budget))) if size > budget => {
                drain(&mut *reader, size).map_err(|e| ReadFailure::Fatal(e.into()))?;
                self.deliver(header.tag, Err(CallError::NoBufferSpace));
            }
            Some((alloc, _)) => {
                let mut buf = alloc.allocate(size);
                reader.read_exact(&mut buf).map_err(|e| {
                    ReadFailure::Fatal(if e.kind() == ErrorKind::UnexpectedEof {
                        CallError::ConnectionClosed
                    } else {
                        CallError::Io(e)
                    })
                })?;
                self.deliver(header.tag, Ok(buf.freeze()));
            }
        }
        Ok(())
    }

    fn deliver(&self, tag: u64, outcome: Result<Bytes>) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.pending.get_mut(&tag) {
            slot.outcome = Some(outcome);
            self.readable.notify_all();
        }
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        for slot in state.pending.values_mut() {
            if slot.outcome.is_none() {
                slot.outcome = Some(Err(CallError::Broken));
            }
        }
        self.readable.notify_all();
    }
}

fn capacity(err: WireError) -> CallError {
    match err {
        WireError::SegmentOverflow { .. } => CallError::NoBufferSpace,
        other => CallError::Wire(other),
    }
}

fn drain<R: Read>(reader: &mut R, mut remaining: usize) -> std::io::Result<()> {
    let mut scratch = [0u8; 4096];
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        match reader.read(&mut scratch[..want]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed while draining payload",
                ))
            }
            Ok(n) => remaining -= n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
