//! Client error types.

use std::fmt;

use brook_protocol::ProtocolError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to callers of the connection core.
///
/// These cover the synchronous failure paths (bad address, unreadable
/// cookie, misuse) and driver-level I/O. Fatal connection failures are
/// reported through the context's state observer instead, with the detail
/// in [`Context::last_error`](crate::Context::last_error).
#[derive(Debug)]
pub enum ClientError {
    /// The shared-secret cookie could not be read.
    AuthKey(String),
    /// The server address did not resolve.
    InvalidServer(String),
    /// The call is not valid in the context's current state.
    InvalidState(String),
    /// Malformed or unexpected protocol data.
    Protocol(String),
    /// Connection-level failure.
    Connection(String),
    /// Configuration file problem.
    Config(String),
    /// IO error.
    Io(std::io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthKey(msg) => write!(f, "authorization key: {}", msg),
            Self::InvalidServer(msg) => write!(f, "invalid server: {}", msg),
            Self::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
