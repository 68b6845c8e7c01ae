//! Binary RPC over TCP and Unix domain sockets.
//!
//! wirecall frames every message with a fixed 40-byte header and carries
//! payloads as scatter-gather vectors, so request bodies are written from
//! caller-owned memory without copying and decoded responses alias the
//! receive buffer. Responses are matched to requests by tag, letting many
//! callers multiplex one connection.
//!
//! # Crate Structure
//!
//! - [`transport`] — Byte-stream transports (TCP, Unix sockets), listeners
//!   and connectors
//! - [`wire`] — Wire header, scatter-gather vectors, message serialization
//! - [`client`] — Stubs, call timeouts and the endpoint-keyed stub pool
//! - [`server`] — Skeletons: handler tables and per-connection serve loops
//! - [`echo`] — A ready-made echo operation used by the CLI and tests

/// Re-export transport types.
pub mod transport {
    pub use wirecall_transport::*;
}

/// Re-export wire format types.
pub mod wire {
    pub use wirecall_wire::*;
}

/// Re-export client call types.
pub mod client {
    pub use wirecall_client::*;
}

/// Re-export server dispatch types.
pub mod server {
    pub use wirecall_server::*;
}

pub mod echo;
