//! Stream registry.
//!
//! The context tracks every streaming session it owns in an arena keyed by
//! [`StreamId`], plus two dense per-direction tables indexed by the server's
//! channel id. The channel tables store ids, not entries, and exist only for
//! O(1) routing of audio chunks and per-channel commands.

use std::collections::HashMap;

use crate::context::Context;

/// Data-arrival callback of a record stream: `(context, stream, data, offset)`.
pub(crate) type StreamReadCallback = Box<dyn FnMut(&mut Context, StreamId, &[u8], u64) + 'static>;

/// Write-request callback of a playback stream: `(context, stream, requested_bytes)`.
pub(crate) type StreamWriteCallback = Box<dyn FnMut(&mut Context, StreamId, u32) + 'static>;

/// Handle to one streaming session owned by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

/// Direction of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Playback,
    Record,
}

/// Lifecycle state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created locally, no channel assigned yet.
    Created,
    /// Channel assigned by the server, data may flow.
    Ready,
    /// The server removed the session.
    Killed,
    /// The owning context failed.
    Failed,
    /// The session or its context was disconnected.
    Terminated,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Killed | StreamState::Failed | StreamState::Terminated
        )
    }
}

pub(crate) struct StreamEntry {
    pub name: String,
    pub direction: StreamDirection,
    pub state: StreamState,
    pub channel: Option<u32>,
    /// Bytes the server has asked for but the caller has not yet written.
    pub requested_bytes: u64,
    pub read_callback: Option<StreamReadCallback>,
    pub write_callback: Option<StreamWriteCallback>,
}

/// Arena of streams plus the per-direction channel routing tables.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    streams: HashMap<u64, StreamEntry>,
    next_id: u64,
    playback: Vec<Option<StreamId>>,
    record: Vec<Option<StreamId>>,
}

impl StreamRegistry {
    pub fn insert(&mut self, name: String, direction: StreamDirection) -> StreamId {
        let id = self.next_id;
        self.next_id += 1;
        self.streams.insert(
            id,
            StreamEntry {
                name,
                direction,
                state: StreamState::Created,
                channel: None,
                requested_bytes: 0,
                read_callback: None,
                write_callback: None,
            },
        );
        StreamId(id)
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamEntry> {
        self.streams.get(&id.0)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEntry> {
        self.streams.get_mut(&id.0)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    fn table(&mut self, direction: StreamDirection) -> &mut Vec<Option<StreamId>> {
        match direction {
            StreamDirection::Playback => &mut self.playback,
            StreamDirection::Record => &mut self.record,
        }
    }

    /// Binds `id` to a server-assigned channel and marks it ready.
    pub fn bind_channel(&mut self, id: StreamId, channel: u32) -> bool {
        let Some(entry) = self.streams.get_mut(&id.0) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        entry.channel = Some(channel);
        entry.state = StreamState::Ready;
        let direction = entry.direction;

        let table = self.table(direction);
        let slot = channel as usize;
        if table.len() <= slot {
            table.resize(slot + 1, None);
        }
        table[slot] = Some(id);
        true
    }

    /// Routing lookup: the stream bound to `channel` in `direction`.
    pub fn by_channel(&self, direction: StreamDirection, channel: u32) -> Option<StreamId> {
        let table = match direction {
            StreamDirection::Playback => &self.playback,
            StreamDirection::Record => &self.record,
        };
        table.get(channel as usize).copied().flatten()
    }

    fn unbind(&mut self, id: StreamId) {
        if let Some(entry) = self.streams.get_mut(&id.0)
            && let Some(channel) = entry.channel.take()
        {
            let direction = entry.direction;
            let table = self.table(direction);
            if let Some(slot) = table.get_mut(channel as usize) {
                *slot = None;
            }
        }
    }

    /// Moves one stream into a terminal state and drops its channel binding.
    pub fn kill(&mut self, id: StreamId, state: StreamState) {
        debug_assert!(state.is_terminal());
        self.unbind(id);
        if let Some(entry) = self.streams.get_mut(&id.0)
            && !entry.state.is_terminal()
        {
            entry.state = state;
        }
    }

    /// Forces every live stream into `state` and clears the routing tables.
    pub fn force_all(&mut self, state: StreamState) {
        debug_assert!(state.is_terminal());
        for entry in self.streams.values_mut() {
            if !entry.state.is_terminal() {
                entry.state = state;
            }
            entry.channel = None;
        }
        self.playback.clear();
        self.record.clear();
    }

    /// Removes a stream entirely.
    pub fn release(&mut self, id: StreamId) {
        self.unbind(id);
        self.streams.remove(&id.0);
    }

    // Callbacks are taken out while they run so they can borrow the context.

    pub fn take_read_callback(&mut self, id: StreamId) -> Option<StreamReadCallback> {
        self.streams.get_mut(&id.0)?.read_callback.take()
    }

    pub fn put_read_callback(&mut self, id: StreamId, callback: StreamReadCallback) {
        if let Some(entry) = self.streams.get_mut(&id.0)
            && entry.read_callback.is_none()
        {
            entry.read_callback = Some(callback);
        }
    }

    pub fn take_write_callback(&mut self, id: StreamId) -> Option<StreamWriteCallback> {
        self.streams.get_mut(&id.0)?.write_callback.take()
    }

    pub fn put_write_callback(&mut self, id: StreamId, callback: StreamWriteCallback) {
        if let Some(entry) = self.streams.get_mut(&id.0)
            && entry.write_callback.is_none()
        {
            entry.write_callback = Some(callback);
        }
    }
}
