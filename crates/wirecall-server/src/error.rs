use wirecall_wire::{FunctionId, WireError};

/// Errors raised while registering handlers or serving connections.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Wire-level error (framing, decode).
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O error on the connection.
    #[error("serve I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A handler is already bound to this function id.
    #[error("function {0} is already registered")]
    DuplicateFunction(FunctionId),

    /// No handler is bound to this function id.
    #[error("function {0} is not registered")]
    UnknownFunction(FunctionId),

    /// The skeleton is shutting down and refuses new connections.
    #[error("skeleton is shutting down")]
    ShuttingDown,

    /// Application-level handler failure.
    #[error("handler failed: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, ServeError>;
