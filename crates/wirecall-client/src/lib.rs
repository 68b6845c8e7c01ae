//! Client call layer for wirecall.
//!
//! A [`Stub`] wraps one connection and provides the two call paths: the
//! fixed-buffer path for responses whose size the caller can bound up
//! front, and the open-buffer path for responses of unknown size.
//! Concurrent calls on one stub share the connection; responses are
//! matched back to callers by tag, so the server may answer out of order.
//!
//! A [`StubPool`] caches stubs by endpoint so independent parts of a
//! program converge on one connection per peer.

pub mod error;
pub mod pool;
pub mod stub;
pub mod timeout;

pub use error::{CallError, Result};
pub use pool::{PoolConfig, StubPool};
pub use stub::Stub;
pub use timeout::Timeout;
