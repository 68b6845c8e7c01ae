//! Server dispatch layer for wirecall.
//!
//! A [`Skeleton`] maps function ids to handlers and serves connections
//! handed to it by the embedding server, one blocking [`Skeleton::serve`]
//! loop per connection. Handlers come in two shapes:
//! raw scatter-gather handlers and typed [`Service`] implementations bound
//! per operation. Registration is safe while serving, and
//! [`Skeleton::register_service`] commits a group of bindings atomically.

pub mod error;
pub mod skeleton;

pub use error::{Result, ServeError};
pub use skeleton::{RawHandler, ResponseSender, Service, ServiceBuilder, Skeleton};
