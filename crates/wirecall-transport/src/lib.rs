//! Byte-stream transport abstraction for wirecall.
//!
//! Provides the [`ByteStream`] trait consumed by the client and server
//! layers, a concrete [`RpcStream`] over TCP and Unix domain sockets, a
//! listener, and the [`Connector`] seam used by the connection pool.
//!
//! This is the lowest layer of wirecall. It moves bytes; it knows nothing
//! about headers, tags, or dispatch.

pub mod connect;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;

pub use connect::{Connector, StreamConnector};
pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::RpcListener;
pub use stream::{ByteStream, RpcStream};
