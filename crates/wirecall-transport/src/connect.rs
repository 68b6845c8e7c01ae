use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::{ByteStream, RpcStream};

/// Establishes outbound connections for the client layers.
///
/// The connection pool is generic over this trait so tests can substitute
/// in-memory streams, and so TLS-wrapping connectors can be slotted in
/// without touching the pool.
pub trait Connector: Send + Sync {
    /// The stream type produced by this connector.
    type Stream: ByteStream;

    /// Connect to `endpoint` within `timeout`.
    ///
    /// `tls` requests transport encryption; connectors without TLS support
    /// must fail rather than silently downgrade.
    fn connect(&self, endpoint: &Endpoint, tls: bool, timeout: Duration) -> Result<Self::Stream>;
}

/// Default connector producing plain [`RpcStream`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamConnector;

impl Connector for StreamConnector {
    type Stream = RpcStream;

    fn connect(&self, endpoint: &Endpoint, tls: bool, timeout: Duration) -> Result<RpcStream> {
        if tls {
            return Err(TransportError::TlsUnsupported);
        }
        debug!(%endpoint, ?timeout, "connecting");
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect_timeout(addr, timeout).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock
                    {
                        TransportError::ConnectTimeout {
                            endpoint: endpoint.clone(),
                            timeout,
                        }
                    } else {
                        TransportError::Connect {
                            endpoint: endpoint.clone(),
                            source: e,
                        }
                    }
                })?;
                stream.set_nodelay(true).map_err(TransportError::Io)?;
                Ok(RpcStream::from_tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                // UDS connect is a local rendezvous and completes immediately;
                // no timeout variant exists in std.
                let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
                    TransportError::Connect {
                        endpoint: endpoint.clone(),
                        source: e,
                    }
                })?;
                Ok(RpcStream::from_unix(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Connect {
                endpoint: endpoint.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::listener::RpcListener;

    #[test]
    fn connects_over_tcp() {
        let listener = RpcListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let server = std::thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            let mut buf = [0u8; 1];
            // Peer connects and immediately drops; read returns EOF.
            assert_eq!(stream.read(&mut buf).unwrap(), 0);
        });

        let stream = StreamConnector.connect(&endpoint, false, Duration::from_secs(1));
        assert!(stream.is_ok());
        drop(stream);
        server.join().unwrap();
    }

    #[test]
    fn refuses_tls() {
        let err = StreamConnector
            .connect(
                &"127.0.0.1:1".parse().unwrap(),
                true,
                Duration::from_millis(10),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::TlsUnsupported));
    }

    #[test]
    fn connect_to_dead_port_fails() {
        // Bind then drop to get a port that is very likely unused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = StreamConnector
            .connect(&Endpoint::Tcp(addr), false, Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::ConnectTimeout { .. }
        ));
    }
}
