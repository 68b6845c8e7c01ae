use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// A connected bidirectional byte stream usable by the RPC layers.
///
/// `try_clone` must produce an independent handle over the same underlying
/// connection; the client uses one handle for sends and one for receives.
/// Read timeouts are the suspension/cancellation mechanism: a blocked read
/// returns a `TimedOut`/`WouldBlock` I/O error once the timeout elapses.
pub trait ByteStream: Read + Write + Send + Sized {
    /// Create a second handle to the same connection.
    fn try_clone(&self) -> std::io::Result<Self>;

    /// Set the read timeout. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Set the write timeout. `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Shut down both directions of the connection.
    fn shutdown(&self) -> std::io::Result<()>;
}

/// A connected RPC transport stream.
///
/// This is the fundamental I/O type returned by transport operations.
/// Wraps either a TCP stream or a Unix domain socket stream.
pub struct RpcStream {
    inner: RpcStreamInner,
}

enum RpcStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl RpcStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: RpcStreamInner::Tcp(stream),
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: RpcStreamInner::Unix(stream),
        }
    }
}

impl Read for RpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            RpcStreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for RpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            RpcStreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            RpcStreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl ByteStream for RpcStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        match &self.inner {
            RpcStreamInner::Tcp(stream) => stream.try_clone().map(Self::from_tcp),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.try_clone().map(Self::from_unix),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match &self.inner {
            RpcStreamInner::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match &self.inner {
            RpcStreamInner::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }

    fn shutdown(&self) -> std::io::Result<()> {
        match &self.inner {
            RpcStreamInner::Tcp(stream) => stream.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.shutdown(std::net::Shutdown::Both),
        }
    }
}

impl ByteStream for TcpStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

#[cfg(unix)]
impl ByteStream for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> std::io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            RpcStreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            RpcStreamInner::Unix(_) => "unix",
        };
        f.debug_struct("RpcStream").field("type", &kind).finish()
    }
}
