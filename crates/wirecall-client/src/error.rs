use std::time::Duration;

use wirecall_transport::{Endpoint, TransportError};
use wirecall_wire::WireError;

/// Errors that can occur while issuing calls or managing pooled stubs.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Wire-level error (framing, decode, checksum).
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Transport-level error (connect, bind, accept).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error on the connection.
    #[error("call I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The deadline expired before the response header arrived.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The response does not fit the caller-provided buffer budget.
    #[error("no buffer space for response")]
    NoBufferSpace,

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection previously failed and the stub is unusable.
    #[error("stub marked broken by an earlier failure")]
    Broken,

    /// The endpoint has no entry in the pool.
    #[error("endpoint {0} not present in pool")]
    UnknownEndpoint(Endpoint),
}

pub type Result<T> = std::result::Result<T, CallError>;
