use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, warn};
use wirecall_transport::ByteStream;
use wirecall_wire::{
    default_allocator, Deserializer, FunctionId, Header, IoAlloc, IoVector, Operation, Serializer,
    WireError, HEADER_SIZE,
};

use crate::error::{Result, ServeError};

/// How often an idle serve loop wakes up to check the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A dispatch-table handler working on raw scatter-gather vectors.
///
/// Receives the request payload and a sender pre-armed with the request's
/// tag; a handler that wants the client to get an answer must send exactly
/// one response. Returning an error without having touched the sender
/// rejects the request and keeps the connection alive.
pub type RawHandler =
    Arc<dyn Fn(&IoVector<'static>, &mut ResponseSender<'_>) -> Result<()> + Send + Sync>;

type Notifier = Box<dyn Fn() + Send + Sync>;

/// Frames one response for one request.
///
/// Echoes the request's function id and tag so the client can match the
/// response regardless of ordering.
pub struct ResponseSender<'a> {
    out: &'a mut dyn Write,
    function: FunctionId,
    tag: u64,
    attempted: bool,
}

impl<'a> ResponseSender<'a> {
    fn new(out: &'a mut dyn Write, function: FunctionId, tag: u64) -> Self {
        Self {
            out,
            function,
            tag,
            attempted: false,
        }
    }

    /// Write `payload` as the response frame. Must be called at most once.
    ///
    /// A payload too large for the header's 32-bit size field is rejected
    /// before anything reaches the wire, so the connection stays in sync.
    pub fn send(&mut self, payload: &IoVector<'_>) -> Result<()> {
        assert!(!self.attempted, "a request gets exactly one response");
        let size = u32::try_from(payload.len()).map_err(|_| WireError::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX,
        })?;
        self.attempted = true;
        let header = Header::new(self.function, self.tag, size);
        self.out.write_all(&header.to_bytes())?;
        payload.write_to(self.out)?;
        self.out.flush()?;
        Ok(())
    }

    /// Whether a send was started. A failed send leaves a partial frame on
    /// the wire, so the connection must be torn down.
    pub fn attempted(&self) -> bool {
        self.attempted
    }

    /// The request tag this sender answers.
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// Typed server-side handler for one operation.
///
/// `buf` is an empty scratch vector seeded with the skeleton's allocation
/// strategy; handlers that stage response payloads can draw buffers from
/// its allocator and keep the returned message zero-copy.
pub trait Service<O: Operation>: Send + Sync {
    fn handle(&self, request: O::Request, buf: &mut IoVector<'static>) -> Result<O::Response>;
}

/// Stages handler bindings for an all-or-nothing registration.
pub struct ServiceBuilder {
    staged: HashMap<FunctionId, RawHandler>,
    allocator: Arc<RwLock<IoAlloc>>,
}

impl ServiceBuilder {
    /// Stage a raw handler. Fails if `id` collides with an already staged
    /// binding.
    pub fn add_function(&mut self, id: FunctionId, handler: RawHandler) -> Result<()> {
        if self.staged.contains_key(&id) {
            return Err(ServeError::DuplicateFunction(id));
        }
        self.staged.insert(id, handler);
        Ok(())
    }

    /// Stage a typed handler for operation `O`.
    pub fn add_operation<O, S>(&mut self, service: Arc<S>) -> Result<()>
    where
        O: Operation + 'static,
        S: Service<O> + 'static,
    {
        let handler = typed_handler::<O, S>(service, Arc::clone(&self.allocator));
        self.add_function(O::id(), handler)
    }
}

/// Wraps a typed [`Service`] into a [`RawHandler`]: decode the request,
/// invoke the service, serialize and send the response. A decode failure
/// rejects the request without crashing the connection.
fn typed_handler<O, S>(service: Arc<S>, allocator: Arc<RwLock<IoAlloc>>) -> RawHandler
where
    O: Operation + 'static,
    S: Service<O> + 'static,
{
    Arc::new(move |request, sender| {
        let decoded = Deserializer::deserialize::<O::Request>(request)?;
        let mut buf = IoVector::with_allocator(allocator.read().unwrap().clone());
        let response = service.handle(decoded, &mut buf)?;
        let mut ser = Serializer::new();
        ser.serialize(&response)?;
        sender.send(&ser.iov)
    })
}

/// Server-side dispatcher: a function-id-keyed handler table plus the
/// per-connection serve loop.
///
/// The skeleton owns no sockets. The embedding server accepts connections
/// and hands each stream to [`serve`](Skeleton::serve) on its own thread;
/// registration and shutdown are safe concurrently with serving.
pub struct Skeleton {
    handlers: RwLock<HashMap<FunctionId, RawHandler>>,
    allocator: Arc<RwLock<IoAlloc>>,
    stopping: AtomicBool,
    active: Mutex<usize>,
    drained: Condvar,
    accept_notify: Mutex<Option<Notifier>>,
    close_notify: Mutex<Option<Notifier>>,
}

impl Skeleton {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            allocator: Arc::new(RwLock::new(default_allocator())),
            stopping: AtomicBool::new(false),
            active: Mutex::new(0),
            drained: Condvar::new(),
            accept_notify: Mutex::new(None),
            close_notify: Mutex::new(None),
        }
    }

    /// Bind a raw handler to `id`. Fails if a handler is already bound.
    pub fn add_function(&self, id: FunctionId, handler: RawHandler) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&id) {
            return Err(ServeError::DuplicateFunction(id));
        }
        debug!(function = %id, "registering handler");
        handlers.insert(id, handler);
        Ok(())
    }

    /// Bind a typed handler for operation `O`.
    pub fn add_operation<O, S>(&self, service: Arc<S>) -> Result<()>
    where
        O: Operation + 'static,
        S: Service<O> + 'static,
    {
        let handler = typed_handler::<O, S>(service, Arc::clone(&self.allocator));
        self.add_function(O::id(), handler)
    }

    /// Unbind the handler for `id`. Fails if none is bound.
    pub fn remove_function(&self, id: FunctionId) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.remove(&id).is_none() {
            return Err(ServeError::UnknownFunction(id));
        }
        debug!(function = %id, "removed handler");
        Ok(())
    }

    /// Register a group of bindings atomically.
    ///
    /// `f` stages bindings into the builder; a collision among the staged
    /// bindings or against the live table fails the whole registration and
    /// commits nothing.
    pub fn register_service<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceBuilder) -> Result<()>,
    {
        let mut builder = ServiceBuilder {
            staged: HashMap::new(),
            allocator: Arc::clone(&self.allocator),
        };
        f(&mut builder)?;

        let mut handlers = self.handlers.write().unwrap();
        for id in builder.staged.keys() {
            if handlers.contains_key(id) {
                return Err(ServeError::DuplicateFunction(*id));
            }
        }
        debug!(functions = builder.staged.len(), "registering service");
        handlers.extend(builder.staged);
        Ok(())
    }

    /// Replace the allocation strategy used for request payload buffers
    /// and typed-handler scratch vectors.
    pub fn set_allocator(&self, alloc: IoAlloc) {
        *self.allocator.write().unwrap() = alloc;
    }

    /// Install a callback invoked when a serve loop starts.
    pub fn set_accept_notify(&self, f: Option<Notifier>) {
        *self.accept_notify.lock().unwrap() = f;
    }

    /// Install a callback invoked when a serve loop exits.
    pub fn set_close_notify(&self, f: Option<Notifier>) {
        *self.close_notify.lock().unwrap() = f;
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        *self.active.lock().unwrap()
    }

    /// Serve one connection until the peer disconnects, a protocol
    /// violation tears it down, or shutdown interrupts it.
    ///
    /// Intended to be called from one thread per connection; the handler
    /// table is shared and read-locked per request.
    pub fn serve<S: ByteStream>(&self, mut stream: S) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(ServeError::ShuttingDown);
        }

        *self.active.lock().unwrap() += 1;
        if let Some(notify) = self.accept_notify.lock().unwrap().as_ref() {
            notify();
        }

        let result = self.serve_loop(&mut stream);

        let mut active = self.active.lock().unwrap();
        *active -= 1;
        self.drained.notify_all();
        drop(active);
        if let Some(notify) = self.close_notify.lock().unwrap().as_ref() {
            notify();
        }
        result
    }

    /// Stop serving. With `no_more_requests` the stop flag is raised first
    /// so idle serve loops exit at the next frame boundary; either way this
    /// blocks until every in-flight serve loop has drained.
    ///
    /// Must not be called from within a handler; that would wait on the
    /// caller's own serve loop.
    pub fn shutdown(&self, no_more_requests: bool) {
        if no_more_requests {
            self.stopping.store(true, Ordering::Release);
        }
        let mut active = self.active.lock().unwrap();
        while *active > 0 {
            active = self.drained.wait(active).unwrap();
        }
    }

    /// Raise the stop flag without waiting for serve loops to drain.
    pub fn shutdown_no_wait(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    fn serve_loop<S: ByteStream>(&self, stream: &mut S) -> Result<()> {
        // Wake up at poll interval so shutdown can interrupt an idle
        // connection.
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut writer = stream.try_clone()?;

        loop {
            let header = match self.read_header(stream)? {
                Some(header) => header,
                None => return Ok(()),
            };

            let request = self.read_payload(stream, header.size as usize)?;

            let handler = self
                .handlers
                .read()
                .unwrap()
                .get(&header.function)
                .cloned();
            let Some(handler) = handler else {
                warn!(
                    function = %header.function,
                    tag = header.tag,
                    "no handler bound, discarding request"
                );
                continue;
            };

            let mut sender = ResponseSender::new(&mut writer, header.function, header.tag);
            if let Err(err) = handler(&request, &mut sender) {
                if sender.attempted() {
                    // Partial response frame; the stream is out of sync.
                    return Err(err);
                }
                warn!(
                    function = %header.function,
                    tag = header.tag,
                    %err,
                    "handler rejected request"
                );
            }
        }
    }

    /// Read one header, polling so shutdown can interrupt between frames.
    /// Returns `None` on clean disconnect or stop. A partially read header
    /// is always completed: tearing out mid-header would desynchronize a
    /// peer that already committed to the frame.
    fn read_header<S: ByteStream>(&self, stream: &mut S) -> Result<Option<Header>> {
        let mut raw = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            if filled == 0 && self.stopping.load(Ordering::Acquire) {
                return Ok(None);
            }
            match stream.read(&mut raw[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Err(ServeError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed mid-header",
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(Header::decode(&raw)?))
    }

    /// Read exactly `size` payload bytes into an allocator-owned vector.
    fn read_payload<S: ByteStream>(
        &self,
        stream: &mut S,
        size: usize,
    ) -> Result<IoVector<'static>> {
        let alloc = self.allocator.read().unwrap().clone();
        let mut request = IoVector::with_allocator(alloc);
        if size == 0 {
            return Ok(request);
        }

        let mut buf = request.allocator().allocate(size);
        let mut filled = 0;
        while filled < size {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(ServeError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed mid-payload",
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        request.push_owned(buf.freeze());
        Ok(request)
    }
}

impl Default for Skeleton {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Read as _;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use bytes::{BufMut, Bytes, BytesMut};
    use wirecall_wire::{Message, Result as WireResult, WireError};

    use super::*;

    /// Fixed record: seq (8B) + blob length (8B); one variable blob.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    struct Blob {
        seq: u64,
        data: Bytes,
    }

    impl Message for Blob {
        const FIXED_SIZE: usize = 16;

        fn encode_fixed(&self, dst: &mut BytesMut) {
            dst.put_u64_le(self.seq);
            dst.put_u64_le(self.data.len() as u64);
        }

        fn variable_parts(&self) -> Vec<&[u8]> {
            vec![&self.data]
        }

        fn decode(fixed: &[u8], variable: Bytes) -> WireResult<Self> {
            let seq = u64::from_le_bytes(fixed[0..8].try_into().unwrap());
            let len = u64::from_le_bytes(fixed[8..16].try_into().unwrap()) as usize;
            if variable.len() < len {
                return Err(WireError::Decode("blob length exceeds variable section"));
            }
            Ok(Self {
                seq,
                data: variable.slice(..len),
            })
        }
    }

    enum GetBlob {}
    impl Operation for GetBlob {
        const INTERFACE: u32 = 2;
        const METHOD: u32 = 1;
        type Request = Blob;
        type Response = Blob;
    }

    struct EchoService;
    impl Service<GetBlob> for EchoService {
        fn handle(&self, request: Blob, _buf: &mut IoVector<'static>) -> Result<Blob> {
            Ok(request)
        }
    }

    fn send_request(stream: &mut UnixStream, function: FunctionId, tag: u64, blob: &Blob) {
        let mut ser = Serializer::new();
        ser.serialize(blob).unwrap();
        let header = Header::new(function, tag, ser.iov.len() as u32);
        stream.write_all(&header.to_bytes()).unwrap();
        ser.iov.write_to(stream).unwrap();
        stream.flush().unwrap();
    }

    fn read_response(stream: &mut UnixStream) -> (Header, Blob) {
        let mut raw = [0u8; HEADER_SIZE];
        stream.read_exact(&mut raw).unwrap();
        let header = Header::decode(&raw).unwrap();
        let mut payload = vec![0u8; header.size as usize];
        stream.read_exact(&mut payload).unwrap();

        let mut iov = IoVector::new();
        iov.push_owned(Bytes::from(payload));
        (header, Deserializer::deserialize::<Blob>(&iov).unwrap())
    }

    fn serve_in_thread(
        skeleton: Arc<Skeleton>,
    ) -> (UnixStream, std::thread::JoinHandle<Result<()>>) {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || skeleton.serve(server));
        (client, handle)
    }

    #[test]
    fn routes_requests_and_echoes_tags() {
        let skeleton = Arc::new(Skeleton::new());
        skeleton.add_operation::<GetBlob, _>(Arc::new(EchoService)).unwrap();
        let (mut client, server) = serve_in_thread(Arc::clone(&skeleton));

        let blob = Blob {
            seq: 11,
            data: Bytes::from_static(b"dispatch me"),
        };
        send_request(&mut client, GetBlob::id(), 77, &blob);
        let (header, response) = read_response(&mut client);

        assert_eq!(header.tag, 77);
        assert_eq!(header.function, GetBlob::id());
        assert_eq!(response, blob);

        drop(client);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn unknown_function_is_discarded_and_connection_survives() {
        let skeleton = Arc::new(Skeleton::new());
        skeleton.add_operation::<GetBlob, _>(Arc::new(EchoService)).unwrap();
        let (mut client, server) = serve_in_thread(Arc::clone(&skeleton));

        // Unregistered function: no response at all.
        send_request(&mut client, FunctionId::new(9, 9), 1, &Blob::default());
        // A registered call right behind it still gets answered.
        let blob = Blob {
            seq: 2,
            data: Bytes::from_static(b"still here"),
        };
        send_request(&mut client, GetBlob::id(), 2, &blob);

        let (header, response) = read_response(&mut client);
        assert_eq!(header.tag, 2, "discarded request must produce no frame");
        assert_eq!(response, blob);

        drop(client);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn malformed_request_is_rejected_without_killing_the_connection() {
        let skeleton = Arc::new(Skeleton::new());
        skeleton.add_operation::<GetBlob, _>(Arc::new(EchoService)).unwrap();
        let (mut client, server) = serve_in_thread(Arc::clone(&skeleton));

        // Too short to contain even the fixed record: decode fails, no
        // response is sent.
        let header = Header::new(GetBlob::id(), 1, 3);
        client.write_all(&header.to_bytes()).unwrap();
        client.write_all(b"xyz").unwrap();

        let blob = Blob {
            seq: 3,
            data: Bytes::from_static(b"recovered"),
        };
        send_request(&mut client, GetBlob::id(), 4, &blob);
        let (header, response) = read_response(&mut client);
        assert_eq!(header.tag, 4);
        assert_eq!(response, blob);

        drop(client);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn bad_magic_tears_the_connection_down() {
        let skeleton = Arc::new(Skeleton::new());
        let (mut client, server) = serve_in_thread(Arc::clone(&skeleton));

        client.write_all(&[0u8; HEADER_SIZE]).unwrap();
        let err = server.join().unwrap().unwrap_err();
        assert!(matches!(err, ServeError::Wire(WireError::BadMagic)));
    }

    #[test]
    fn duplicate_registration_fails() {
        let skeleton = Skeleton::new();
        skeleton.add_operation::<GetBlob, _>(Arc::new(EchoService)).unwrap();
        let err = skeleton
            .add_operation::<GetBlob, _>(Arc::new(EchoService))
            .unwrap_err();
        assert!(matches!(err, ServeError::DuplicateFunction(id) if id == GetBlob::id()));
    }

    #[test]
    fn remove_function_unbinds() {
        let skeleton = Skeleton::new();
        skeleton.add_operation::<GetBlob, _>(Arc::new(EchoService)).unwrap();
        skeleton.remove_function(GetBlob::id()).unwrap();

        let err = skeleton.remove_function(GetBlob::id()).unwrap_err();
        assert!(matches!(err, ServeError::UnknownFunction(_)));

        // Slot is free again.
        skeleton.add_operation::<GetBlob, _>(Arc::new(EchoService)).unwrap();
    }

    #[test]
    fn register_service_commits_all_or_nothing() {
        let skeleton = Skeleton::new();
        skeleton.add_operation::<GetBlob, _>(Arc::new(EchoService)).unwrap();

        let fresh = FunctionId::new(8, 8);
        let err = skeleton
            .register_service(|builder| {
                builder.add_function(fresh, Arc::new(|_req, _sender| Ok(())))?;
                // Collides with the live table.
                builder.add_operation::<GetBlob, _>(Arc::new(EchoService))
            })
            .unwrap_err();
        assert!(matches!(err, ServeError::DuplicateFunction(_)));

        // The non-colliding staged binding must not have leaked through.
        skeleton
            .add_function(fresh, Arc::new(|_req, _sender| Ok(())))
            .unwrap();
    }

    #[test]
    fn register_service_detects_staged_collisions() {
        let skeleton = Skeleton::new();
        let err = skeleton
            .register_service(|builder| {
                builder.add_operation::<GetBlob, _>(Arc::new(EchoService))?;
                builder.add_operation::<GetBlob, _>(Arc::new(EchoService))
            })
            .unwrap_err();
        assert!(matches!(err, ServeError::DuplicateFunction(_)));
    }

    #[test]
    fn oversized_response_is_rejected_before_framing() {
        // Reference segments alias one buffer, so the vector's total
        // length exceeds u32::MAX without that much memory behind it.
        let chunk = vec![0u8; 70 << 20];
        let mut payload = IoVector::new();
        for _ in 0..62 {
            payload.push_ref(&chunk);
        }
        assert!(payload.len() > u32::MAX as usize);

        let mut sink: Vec<u8> = Vec::new();
        let mut sender = ResponseSender::new(&mut sink, FunctionId::new(2, 2), 5);
        let err = sender.send(&payload).unwrap_err();
        assert!(matches!(
            err,
            ServeError::Wire(WireError::FrameTooLarge { .. })
        ));
        assert!(!sender.attempted(), "nothing reached the wire");
        drop(sender);
        assert!(sink.is_empty());
    }

    #[test]
    fn graceful_shutdown_drains_idle_connections() {
        let skeleton = Arc::new(Skeleton::new());
        let (_client, server) = serve_in_thread(Arc::clone(&skeleton));
        let (_client2, server2) = serve_in_thread(Arc::clone(&skeleton));

        // Give the serve loops a moment to start.
        while skeleton.active_connections() < 2 {
            std::thread::sleep(Duration::from_millis(5));
        }

        let start = Instant::now();
        skeleton.shutdown(true);
        assert_eq!(skeleton.active_connections(), 0);
        // Bounded by the poll interval, not by the idle peers.
        assert!(start.elapsed() < Duration::from_secs(2));

        server.join().unwrap().unwrap();
        server2.join().unwrap().unwrap();
    }

    #[test]
    fn shutdown_no_wait_returns_immediately() {
        let skeleton = Arc::new(Skeleton::new());
        let (_client, server) = serve_in_thread(Arc::clone(&skeleton));
        while skeleton.active_connections() < 1 {
            std::thread::sleep(Duration::from_millis(5));
        }

        skeleton.shutdown_no_wait();
        // The loop notices the flag within a poll interval and exits.
        server.join().unwrap().unwrap();
        assert_eq!(skeleton.active_connections(), 0);
    }

    #[test]
    fn serve_refuses_connections_after_shutdown() {
        let skeleton = Skeleton::new();
        skeleton.shutdown_no_wait();

        let (_client, server) = UnixStream::pair().unwrap();
        let err = skeleton.serve(server).unwrap_err();
        assert!(matches!(err, ServeError::ShuttingDown));
    }

    #[test]
    fn notifiers_fire_on_accept_and_close() {
        let accepts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let skeleton = Arc::new(Skeleton::new());
        let a = Arc::clone(&accepts);
        skeleton.set_accept_notify(Some(Box::new(move || {
            a.fetch_add(1, Ordering::SeqCst);
        })));
        let c = Arc::clone(&closes);
        skeleton.set_close_notify(Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));

        let (client, server) = serve_in_thread(Arc::clone(&skeleton));
        drop(client);
        server.join().unwrap().unwrap();

        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
