/// Errors that can occur during wire encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The message header contains an invalid magic number.
    #[error("invalid header magic (expected \"wirecall\")")]
    BadMagic,

    /// The message header carries an unsupported protocol version.
    #[error("protocol version mismatch (got {got}, expected {expected})")]
    VersionMismatch { got: u32, expected: u32 },

    /// The payload is too short for the expected message shape.
    #[error("truncated payload ({got} bytes, need at least {needed})")]
    Truncated { needed: usize, got: usize },

    /// The scatter-gather vector ran out of segment slots.
    #[error("scatter-gather vector overflow (max {max} segments)")]
    SegmentOverflow { max: usize },

    /// The payload does not fit the header's 32-bit size field.
    #[error("frame too large ({len} bytes, max {max})")]
    FrameTooLarge { len: usize, max: u32 },

    /// The integrity trailer does not match the payload.
    #[error("checksum mismatch (got {got:#010x}, expected {expected:#010x})")]
    ChecksumMismatch { got: u32, expected: u32 },

    /// The payload bytes do not form a valid message of the expected type.
    #[error("decode failure: {0}")]
    Decode(&'static str),
}

pub type Result<T> = std::result::Result<T, WireError>;
