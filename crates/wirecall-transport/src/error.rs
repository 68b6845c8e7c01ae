use std::time::Duration;

use crate::endpoint::Endpoint;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified endpoint.
    #[error("failed to bind to {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        source: std::io::Error,
    },

    /// Failed to connect to the specified endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        source: std::io::Error,
    },

    /// Connection establishment did not complete within the allowed time.
    #[error("connecting to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout {
        endpoint: Endpoint,
        timeout: Duration,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path:?}")]
    PathTooLong {
        path: std::path::PathBuf,
        len: usize,
        max: usize,
    },

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint {0:?} (expected \"host:port\" or \"unix:/path\")")]
    InvalidEndpoint(String),

    /// TLS was requested but this connector does not provide it.
    #[error("tls requested but not supported by this connector")]
    TlsUnsupported,
}

pub type Result<T> = std::result::Result<T, TransportError>;
