//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame body exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u32, max: u32 },

    /// A command code outside the known set.
    #[error("unknown command code: {0}")]
    UnknownCommand(u32),

    /// Payload ended before the value being read was complete.
    #[error("truncated payload while reading {what}")]
    Truncated { what: &'static str },

    /// A value carried a different type tag than the one requested.
    #[error("unexpected value tag: expected '{expected}', found '{found}'")]
    UnexpectedTag { expected: char, found: char },

    /// String value was not valid UTF-8 or missing its terminator.
    #[error("invalid string encoding")]
    InvalidString,

    /// Data remained after the last expected value.
    #[error("trailing data after message end")]
    TrailingData,
}
