//! Wire format for the brook native protocol.
//!
//! brook multiplexes three kinds of traffic over a single byte stream:
//! tagged request/reply packets, unsolicited server commands, and raw audio
//! memory chunks. This crate defines the pure data shapes for all of them;
//! it performs no I/O.
//!
//! # Framing
//!
//! Every frame starts with a 20-byte big-endian descriptor:
//!
//! ```text
//! +-------------+--------------+--------------+-------------+-----------+
//! | length (u32)| channel (u32)| offset (u64) | delta (i32) |  body ... |
//! +-------------+--------------+--------------+-------------+-----------+
//! ```
//!
//! A channel of [`CONTROL_CHANNEL`] marks a control packet whose body is a
//! [`Tagstruct`]; any other channel carries raw audio data for that channel
//! id.
//!
//! # Control packets
//!
//! Control packets are tagstructs starting with `(command: u32, tag: u32)`.
//! The tag correlates a reply to its request; replies use the
//! [`Command::Reply`], [`Command::Error`] or [`Command::Timeout`] codes.

mod command;
mod errcode;
mod error;
mod frame;
mod tagstruct;

pub mod sample;

pub use command::Command;
pub use errcode::ErrorCode;
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{DESCRIPTOR_SIZE, FrameHeader, control_frame, memchunk_frame};
pub use tagstruct::{TAG_BYTES, TAG_STRING, TAG_U32, Tagstruct, TagstructReader};

/// Channel id marking a control packet rather than an audio chunk.
pub const CONTROL_CHANNEL: u32 = u32::MAX;

/// Maximum frame body size (1 MiB).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Size of the shared-secret cookie file, in bytes.
pub const COOKIE_LENGTH: usize = 256;

/// Default TCP port of the brook server.
pub const DEFAULT_PORT: u16 = 4713;
