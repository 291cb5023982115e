//! Command codes for control packets.

use crate::error::ProtocolError;

/// Command codes carried in the first u32 of every control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    // Replies
    Error = 0,
    Timeout = 1,
    Reply = 2,

    // Client → server
    Auth = 3,
    SetName = 4,
    Exit = 5,

    // Server → client, unsolicited
    Request = 6,
    PlaybackStreamKilled = 7,
    RecordStreamKilled = 8,
    SubscribeEvent = 9,

    // Stream management
    CreatePlaybackStream = 10,
    DeletePlaybackStream = 11,
    CreateRecordStream = 12,
    DeleteRecordStream = 13,
}

impl Command {
    /// Returns the wire code of this command.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// True for the commands the server may send without a matching request.
    pub const fn is_unsolicited(self) -> bool {
        matches!(
            self,
            Command::Request
                | Command::PlaybackStreamKilled
                | Command::RecordStreamKilled
                | Command::SubscribeEvent
        )
    }
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Command::Error),
            1 => Ok(Command::Timeout),
            2 => Ok(Command::Reply),
            3 => Ok(Command::Auth),
            4 => Ok(Command::SetName),
            5 => Ok(Command::Exit),
            6 => Ok(Command::Request),
            7 => Ok(Command::PlaybackStreamKilled),
            8 => Ok(Command::RecordStreamKilled),
            9 => Ok(Command::SubscribeEvent),
            10 => Ok(Command::CreatePlaybackStream),
            11 => Ok(Command::DeletePlaybackStream),
            12 => Ok(Command::CreateRecordStream),
            13 => Ok(Command::DeleteRecordStream),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_known_codes() {
        for code in 0..=13u32 {
            let command = Command::try_from(code).unwrap();
            assert_eq!(command.code(), code);
        }
    }

    #[test]
    fn unknown_code_rejected() {
        assert!(matches!(
            Command::try_from(99),
            Err(ProtocolError::UnknownCommand(99))
        ));
    }

    #[test]
    fn unsolicited_set() {
        assert!(Command::Request.is_unsolicited());
        assert!(Command::PlaybackStreamKilled.is_unsolicited());
        assert!(Command::RecordStreamKilled.is_unsolicited());
        assert!(Command::SubscribeEvent.is_unsolicited());
        assert!(!Command::Reply.is_unsolicited());
        assert!(!Command::Auth.is_unsolicited());
    }
}
