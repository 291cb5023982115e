//! Numeric error codes exchanged with the server.

use std::fmt;

/// Error codes carried in ERROR replies and stored as a context's last error.
///
/// Codes the client does not know survive round trips as [`ErrorCode::Unknown`]
/// so a newer server's codes are passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    Access,
    Command,
    Invalid,
    Exist,
    NoEntity,
    ConnectionRefused,
    Protocol,
    Timeout,
    AuthKey,
    Internal,
    ConnectionTerminated,
    Killed,
    InvalidServer,
    Unknown(u32),
}

impl ErrorCode {
    /// Returns the numeric wire code.
    pub const fn code(self) -> u32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Access => 1,
            ErrorCode::Command => 2,
            ErrorCode::Invalid => 3,
            ErrorCode::Exist => 4,
            ErrorCode::NoEntity => 5,
            ErrorCode::ConnectionRefused => 6,
            ErrorCode::Protocol => 7,
            ErrorCode::Timeout => 8,
            ErrorCode::AuthKey => 9,
            ErrorCode::Internal => 10,
            ErrorCode::ConnectionTerminated => 11,
            ErrorCode::Killed => 12,
            ErrorCode::InvalidServer => 13,
            ErrorCode::Unknown(code) => code,
        }
    }

    /// Maps a numeric wire code to an error code.
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => ErrorCode::Ok,
            1 => ErrorCode::Access,
            2 => ErrorCode::Command,
            3 => ErrorCode::Invalid,
            4 => ErrorCode::Exist,
            5 => ErrorCode::NoEntity,
            6 => ErrorCode::ConnectionRefused,
            7 => ErrorCode::Protocol,
            8 => ErrorCode::Timeout,
            9 => ErrorCode::AuthKey,
            10 => ErrorCode::Internal,
            11 => ErrorCode::ConnectionTerminated,
            12 => ErrorCode::Killed,
            13 => ErrorCode::InvalidServer,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::Ok => "no error",
            ErrorCode::Access => "access denied",
            ErrorCode::Command => "unknown command",
            ErrorCode::Invalid => "invalid argument",
            ErrorCode::Exist => "entity already exists",
            ErrorCode::NoEntity => "no such entity",
            ErrorCode::ConnectionRefused => "connection refused",
            ErrorCode::Protocol => "protocol error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::AuthKey => "unable to read authorization key",
            ErrorCode::Internal => "internal error",
            ErrorCode::ConnectionTerminated => "connection terminated",
            ErrorCode::Killed => "entity killed",
            ErrorCode::InvalidServer => "invalid server",
            ErrorCode::Unknown(code) => return write!(f, "server error {}", code),
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_roundtrip() {
        for code in 0..=13u32 {
            assert_eq!(ErrorCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn unknown_code_passes_through() {
        let code = ErrorCode::from_code(4242);
        assert_eq!(code, ErrorCode::Unknown(4242));
        assert_eq!(code.code(), 4242);
        assert_eq!(code.to_string(), "server error 4242");
    }
}
