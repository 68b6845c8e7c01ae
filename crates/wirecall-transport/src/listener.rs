use std::net::TcpListener;
use std::path::Path;

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::RpcStream;

/// Listens for incoming RPC connections on a TCP or Unix endpoint.
///
/// For Unix sockets, a stale socket file left behind by a previous process
/// is removed before binding, and the path is cleaned up on drop. Non-socket
/// files at the path are never removed.
#[derive(Debug)]
pub struct RpcListener {
    inner: ListenerInner,
}

#[derive(Debug)]
enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: std::os::unix::net::UnixListener,
        path: std::path::PathBuf,
    },
}

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

impl RpcListener {
    /// Bind and listen on the given endpoint.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
                    endpoint: endpoint.clone(),
                    source: e,
                })?;
                info!(%endpoint, "listening on tcp socket");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Self::bind_unix(path),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(TransportError::Bind {
                endpoint: endpoint.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            }),
        }
    }

    #[cfg(unix)]
    fn bind_unix(path: &Path) -> Result<Self> {
        use std::os::unix::fs::FileTypeExt;

        let path = path.to_path_buf();
        let endpoint = Endpoint::Unix(path.clone());

        let path_bytes = path.as_os_str().len();
        if path_bytes >= MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: MAX_PATH_LEN,
            });
        }

        // Remove a stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata =
                std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                    endpoint: endpoint.clone(),
                    source: e,
                })?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                    endpoint: endpoint.clone(),
                    source: e,
                })?;
            } else {
                return Err(TransportError::Bind {
                    endpoint,
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let listener = std::os::unix::net::UnixListener::bind(&path).map_err(|e| {
            TransportError::Bind {
                endpoint: endpoint.clone(),
                source: e,
            }
        })?;

        info!(%endpoint, "listening on unix domain socket");

        Ok(Self {
            inner: ListenerInner::Unix { listener, path },
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<RpcStream> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!(%addr, "accepted tcp connection");
                Ok(RpcStream::from_tcp(stream))
            }
            #[cfg(unix)]
            ListenerInner::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!("accepted unix connection");
                Ok(RpcStream::from_unix(stream))
            }
        }
    }

    /// The endpoint this listener is bound to.
    ///
    /// For TCP this reflects the actual bound address, so binding to port 0
    /// reveals the assigned ephemeral port.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match &self.inner {
            ListenerInner::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            ListenerInner::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ListenerInner::Unix { path, .. } = &self.inner {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn temp_sock_path(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wirecall-listener-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("test.sock")
    }

    #[test]
    fn tcp_bind_accept_connect() {
        let listener = RpcListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let Endpoint::Tcp(addr) = endpoint else {
            panic!("expected tcp endpoint");
        };

        let client = std::thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"hi").unwrap();
        });

        let mut accepted = listener.accept().unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        client.join().unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn unix_bind_accept_connect() {
        let path = temp_sock_path("uds");
        let listener = RpcListener::bind(&Endpoint::Unix(path.clone())).unwrap();

        let path_clone = path.clone();
        let client = std::thread::spawn(move || {
            let mut stream = std::os::unix::net::UnixStream::connect(path_clone).unwrap();
            stream.write_all(b"ok").unwrap();
        });

        let mut accepted = listener.accept().unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
        client.join().unwrap();

        if let Some(parent) = path.parent() {
            drop(listener);
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    #[cfg(unix)]
    fn rebind_replaces_stale_socket() {
        let path = temp_sock_path("stale");
        let first = RpcListener::bind(&Endpoint::Unix(path.clone())).unwrap();
        // Simulate a crashed process: drop the listener struct without Drop
        // by forgetting it, leaving the socket file behind.
        std::mem::forget(first);

        let second = RpcListener::bind(&Endpoint::Unix(path.clone()));
        assert!(second.is_ok());

        if let Some(parent) = path.parent() {
            drop(second);
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    #[cfg(unix)]
    fn refuses_to_clobber_regular_file() {
        let path = temp_sock_path("file");
        std::fs::write(&path, b"precious").unwrap();

        let err = RpcListener::bind(&Endpoint::Unix(path.clone())).unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"precious");

        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    #[cfg(unix)]
    fn rejects_overlong_socket_path() {
        let long = "x".repeat(200);
        let path = std::path::PathBuf::from(format!("/tmp/{long}.sock"));
        let err = RpcListener::bind(&Endpoint::Unix(path)).unwrap_err();
        assert!(matches!(err, TransportError::PathTooLong { .. }));
    }
}
