//! Packet transport: frame queueing and incremental inbound parsing.
//!
//! `PacketStream` owns both directions of the framed byte stream without
//! doing I/O: outgoing tagstructs are framed into a queue the driver writes
//! out, and inbound bytes are fed in as they arrive and come back out as
//! discrete events.

use std::collections::VecDeque;

use brook_protocol::{
    DESCRIPTOR_SIZE, FrameHeader, ProtocolError, ProtocolResult, Tagstruct, control_frame,
};

/// One decoded inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransportEvent {
    /// A control packet body (a tagstruct).
    Packet(Vec<u8>),
    /// A raw audio memory chunk.
    Memchunk {
        channel: u32,
        offset: u64,
        delta: i32,
        data: Vec<u8>,
    },
}

/// Framed stream state for one connection.
pub(crate) struct PacketStream {
    outbound: VecDeque<Vec<u8>>,
    inbuf: Vec<u8>,
    header: Option<FrameHeader>,
}

impl PacketStream {
    pub fn new() -> Self {
        Self {
            outbound: VecDeque::new(),
            inbuf: Vec::new(),
            header: None,
        }
    }

    /// Frames and queues a control packet for sending.
    pub fn send_tagstruct(&mut self, t: Tagstruct) {
        let frame = control_frame(t.as_slice()).expect("tagstruct under frame size limit");
        self.outbound.push_back(frame);
    }

    /// Next fully framed message to write, if any.
    pub fn pop_outbound(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    /// True while queued frames have not been handed to the writer.
    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Feeds inbound bytes, appending every complete frame to `events`.
    ///
    /// Incomplete trailing data is buffered for the next call. An invalid
    /// descriptor poisons the stream; events decoded before it are still
    /// returned.
    pub fn feed(&mut self, bytes: &[u8], events: &mut Vec<TransportEvent>) -> ProtocolResult<()> {
        self.inbuf.extend_from_slice(bytes);

        loop {
            let header = match self.header {
                Some(h) => h,
                None => {
                    if self.inbuf.len() < DESCRIPTOR_SIZE {
                        return Ok(());
                    }
                    let raw: [u8; DESCRIPTOR_SIZE] = self.inbuf[..DESCRIPTOR_SIZE]
                        .try_into()
                        .expect("descriptor-sized slice");
                    let header = FrameHeader::decode(&raw)?;
                    self.inbuf.drain(..DESCRIPTOR_SIZE);
                    self.header = Some(header);
                    header
                }
            };

            let len = header.length as usize;
            if self.inbuf.len() < len {
                return Ok(());
            }
            let data: Vec<u8> = self.inbuf.drain(..len).collect();
            self.header = None;

            if header.is_control() {
                if data.is_empty() {
                    return Err(ProtocolError::Truncated { what: "packet" });
                }
                events.push(TransportEvent::Packet(data));
            } else {
                events.push(TransportEvent::Memchunk {
                    channel: header.channel,
                    offset: header.offset,
                    delta: header.delta,
                    data,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_protocol::{MAX_FRAME_SIZE, memchunk_frame};

    fn packet_frame(body: &[u8]) -> Vec<u8> {
        control_frame(body).unwrap()
    }

    #[test]
    fn outbound_frames_are_queued_in_order() {
        let mut s = PacketStream::new();
        assert!(!s.has_pending());

        s.send_tagstruct(Tagstruct::request(2, 0));
        s.send_tagstruct(Tagstruct::request(2, 1));
        assert!(s.has_pending());

        let first = s.pop_outbound().unwrap();
        let second = s.pop_outbound().unwrap();
        assert_ne!(first, second);
        assert!(s.pop_outbound().is_none());
        assert!(!s.has_pending());
    }

    #[test]
    fn whole_frame_decodes_in_one_feed() {
        let mut s = PacketStream::new();
        let mut events = Vec::new();
        s.feed(&packet_frame(b"hello"), &mut events).unwrap();
        assert_eq!(events, vec![TransportEvent::Packet(b"hello".to_vec())]);
    }

    #[test]
    fn frame_split_at_every_byte_boundary() {
        let frame = packet_frame(b"split me");
        for cut in 1..frame.len() {
            let mut s = PacketStream::new();
            let mut events = Vec::new();
            s.feed(&frame[..cut], &mut events).unwrap();
            assert!(events.is_empty(), "no event before the frame completes");
            s.feed(&frame[cut..], &mut events).unwrap();
            assert_eq!(events, vec![TransportEvent::Packet(b"split me".to_vec())]);
        }
    }

    #[test]
    fn memchunk_event_carries_routing_fields() {
        let mut s = PacketStream::new();
        let mut events = Vec::new();
        s.feed(&memchunk_frame(3, 4096, -1, &[7, 7, 7]).unwrap(), &mut events)
            .unwrap();
        assert_eq!(
            events,
            vec![TransportEvent::Memchunk {
                channel: 3,
                offset: 4096,
                delta: -1,
                data: vec![7, 7, 7],
            }]
        );
    }

    #[test]
    fn two_frames_in_one_feed() {
        let mut bytes = packet_frame(b"one");
        bytes.extend_from_slice(&memchunk_frame(0, 0, 0, b"two").unwrap());

        let mut s = PacketStream::new();
        let mut events = Vec::new();
        s.feed(&bytes, &mut events).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn oversized_descriptor_is_an_error() {
        let header = FrameHeader {
            length: MAX_FRAME_SIZE + 1,
            channel: 0,
            offset: 0,
            delta: 0,
        };
        let mut s = PacketStream::new();
        let mut events = Vec::new();
        let result = s.feed(&header.encode(), &mut events);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn empty_control_packet_is_an_error() {
        let mut s = PacketStream::new();
        let mut events = Vec::new();
        let result = s.feed(&FrameHeader::control(0).encode(), &mut events);
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }
}
