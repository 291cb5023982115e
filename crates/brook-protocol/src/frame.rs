//! Frame descriptor encoding.
//!
//! Frames are the outermost unit on the wire: a fixed 20-byte big-endian
//! descriptor followed by `length` body bytes. The descriptor's channel field
//! separates control packets from raw audio memory chunks.

use crate::error::{ProtocolError, ProtocolResult};
use crate::{CONTROL_CHANNEL, MAX_FRAME_SIZE};

/// Size of the frame descriptor in bytes.
pub const DESCRIPTOR_SIZE: usize = 20;

/// Decoded frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length in bytes.
    pub length: u32,
    /// Channel id, or [`CONTROL_CHANNEL`] for a control packet.
    pub channel: u32,
    /// Byte offset of this chunk within its stream.
    pub offset: u64,
    /// Signed sequence delta reported by the server.
    pub delta: i32,
}

impl FrameHeader {
    /// Descriptor for a control packet of `length` body bytes.
    pub fn control(length: u32) -> Self {
        Self {
            length,
            channel: CONTROL_CHANNEL,
            offset: 0,
            delta: 0,
        }
    }

    /// True if the body is a control packet rather than an audio chunk.
    pub fn is_control(&self) -> bool {
        self.channel == CONTROL_CHANNEL
    }

    /// Encodes the descriptor.
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.channel.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..20].copy_from_slice(&self.delta.to_be_bytes());
        buf
    }

    /// Decodes and validates a descriptor.
    pub fn decode(buf: &[u8; DESCRIPTOR_SIZE]) -> ProtocolResult<Self> {
        let length = u32::from_be_bytes(buf[0..4].try_into().expect("4-byte slice"));
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Self {
            length,
            channel: u32::from_be_bytes(buf[4..8].try_into().expect("4-byte slice")),
            offset: u64::from_be_bytes(buf[8..16].try_into().expect("8-byte slice")),
            delta: i32::from_be_bytes(buf[16..20].try_into().expect("4-byte slice")),
        })
    }
}

/// Frames a control packet body, descriptor included.
pub fn control_frame(body: &[u8]) -> ProtocolResult<Vec<u8>> {
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len() as u32,
            max: MAX_FRAME_SIZE,
        });
    }
    let header = FrameHeader::control(body.len() as u32);
    let mut frame = Vec::with_capacity(DESCRIPTOR_SIZE + body.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Frames an audio memory chunk for `channel`, descriptor included.
pub fn memchunk_frame(channel: u32, offset: u64, delta: i32, data: &[u8]) -> ProtocolResult<Vec<u8>> {
    if data.len() > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len() as u32,
            max: MAX_FRAME_SIZE,
        });
    }
    let header = FrameHeader {
        length: data.len() as u32,
        channel,
        offset,
        delta,
    };
    let mut frame = Vec::with_capacity(DESCRIPTOR_SIZE + data.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(data);
    Ok(frame)
}
