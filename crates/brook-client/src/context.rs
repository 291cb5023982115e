//! The connection context: state machine, handshake, and routing.
//!
//! A [`Context`] is the root object of a client connection. It owns the tag
//! allocator, the reply dispatcher and packet transport (together, while a
//! transport exists), the operation arena and the stream registry, and it is
//! the only object exposed to callers.
//!
//! The context performs no I/O and never blocks: `connect()` and
//! `send_simple_command()` only enqueue work. Events arrive through the
//! feed methods (`feed_inbound`, `transport_died`, ...) which the
//! [`driver`](crate::driver) calls from its socket loop. Callbacks receive
//! `&mut Context`, so they may re-enter the context freely; internally every
//! transition first mutates and tears down, then queues its observer
//! notification, and the queue is flushed only once the mutation is
//! complete.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use brook_protocol::{COOKIE_LENGTH, Command, ErrorCode, Tagstruct, TagstructReader};

use crate::config::{self, ClientConfig};
use crate::connector::ServerAddress;
use crate::cookie;
use crate::dispatch::{ReplyDispatcher, ReplySlot};
use crate::error::{ClientError, ClientResult};
use crate::operation::{DrainCallback, OperationHandle, OperationKind, OperationSet, SimpleAckCallback};
use crate::stream::{StreamDirection, StreamId, StreamRegistry, StreamState};
use crate::transport::{PacketStream, TransportEvent};

/// Environment variable naming the default server.
pub const ENV_SERVER: &str = "BROOK_SERVER";

/// Connection state of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Initial state, before `connect()`.
    Unconnected,
    /// Waiting for the transport to establish.
    Connecting,
    /// AUTH sent, waiting for its reply.
    Authorizing,
    /// SET_NAME sent, waiting for its reply.
    SettingName,
    /// Handshake complete, requests may be issued.
    Ready,
    /// Terminal: the connection failed; see `last_error()`.
    Failed,
    /// Terminal: the caller disconnected.
    Terminated,
}

impl ContextState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ContextState::Failed | ContextState::Terminated)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ContextState::Unconnected => "unconnected",
            ContextState::Connecting => "connecting",
            ContextState::Authorizing => "authorizing",
            ContextState::SettingName => "setting-name",
            ContextState::Ready => "ready",
            ContextState::Failed => "failed",
            ContextState::Terminated => "terminated",
        };
        f.write_str(text)
    }
}

type StateCallback = Box<dyn FnMut(&mut Context) + 'static>;
type SubscribeCallback = Box<dyn FnMut(&mut Context, u32, u32) + 'static>;

/// Dispatcher and transport exist together or not at all.
struct Link {
    dispatch: ReplyDispatcher,
    stream: PacketStream,
}

/// A queued caller notification. Transitions enqueue these during the
/// mutation phase; the queue is flushed only between entry points.
enum Notification {
    State,
    SimpleAck {
        callback: Option<SimpleAckCallback>,
        success: bool,
    },
    Drain {
        callback: Option<DrainCallback>,
    },
    StreamRead {
        stream: StreamId,
        data: Vec<u8>,
        offset: u64,
    },
    StreamWrite {
        stream: StreamId,
        requested: u32,
    },
    SubscribeEvent {
        event: u32,
        index: u32,
    },
}

/// Client connection handle and state-machine owner.
pub struct Context {
    name: String,
    config: ClientConfig,
    state: ContextState,
    error: ErrorCode,
    ctag: u32,
    cookie: Option<[u8; COOKIE_LENGTH]>,
    pending_connect: Option<ServerAddress>,
    link: Option<Link>,
    operations: OperationSet,
    streams: StreamRegistry,
    drain_waiters: Vec<OperationHandle>,
    state_callback: Option<StateCallback>,
    subscribe_callback: Option<SubscribeCallback>,
    notifications: VecDeque<Notification>,
    notifying: bool,
}

impl Context {
    /// Creates an unconnected context with the given display name.
    pub fn new(name: &str) -> Self {
        Self::with_config(name, ClientConfig::default())
    }

    /// Creates an unconnected context with an explicit configuration.
    pub fn with_config(name: &str, config: ClientConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: ContextState::Unconnected,
            error: ErrorCode::Ok,
            ctag: 0,
            cookie: None,
            pending_connect: None,
            link: None,
            operations: OperationSet::default(),
            streams: StreamRegistry::default(),
            drain_waiters: Vec::new(),
            state_callback: None,
            subscribe_callback: None,
            notifications: VecDeque::new(),
            notifying: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connection state.
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The last error recorded, [`ErrorCode::Ok`] if none.
    pub fn last_error(&self) -> ErrorCode {
        self.error
    }

    /// Registers the state-change observer. The callback may re-enter the
    /// context, including calling `disconnect()`.
    pub fn set_state_callback(&mut self, callback: impl FnMut(&mut Context) + 'static) {
        self.state_callback = Some(Box::new(callback));
    }

    /// Registers the handler for server subscription events.
    pub fn set_subscribe_callback(
        &mut self,
        callback: impl FnMut(&mut Context, u32, u32) + 'static,
    ) {
        self.subscribe_callback = Some(Box::new(callback));
    }

    // -----------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------

    /// Starts connecting to `server` (explicit argument, else
    /// `$BROOK_SERVER`, else the configured server, else the default local
    /// socket).
    ///
    /// Loads the auth cookie and resolves the address synchronously; both
    /// failure paths return an error with no state change. On success the
    /// context enters `Connecting` and the driver completes the attempt.
    pub fn connect(&mut self, server: Option<&str>) -> ClientResult<()> {
        if self.state != ContextState::Unconnected {
            return Err(ClientError::InvalidState(format!(
                "cannot connect while {}",
                self.state
            )));
        }

        let cookie_path = self
            .config
            .cookie_path
            .clone()
            .unwrap_or_else(cookie::default_path);
        let cookie = cookie::load(&cookie_path)
            .map_err(|e| ClientError::AuthKey(format!("{}: {}", cookie_path.display(), e)))?;
        self.cookie = Some(cookie);

        let server = match server {
            Some(s) => s.to_string(),
            None => std::env::var(ENV_SERVER)
                .ok()
                .or_else(|| self.config.server.clone())
                .unwrap_or_else(|| config::default_socket_path().to_string_lossy().into_owned()),
        };
        let address = ServerAddress::parse(&server)?;

        info!(server = %address, name = %self.name, "connecting");
        self.pending_connect = Some(address);
        self.set_state(ContextState::Connecting);
        self.dispatch_notifications();
        Ok(())
    }

    /// Hands the address of the in-progress connection attempt to the
    /// driver. The connector is discarded regardless of the outcome.
    pub fn take_pending_connect(&mut self) -> Option<ServerAddress> {
        self.pending_connect.take()
    }

    /// Driver callback: the transport is established. Wires up a fresh
    /// dispatcher and packet stream and starts the handshake.
    pub fn connection_ready(&mut self) {
        if self.state != ContextState::Connecting {
            // disconnect() raced the connector; nothing to wire up.
            return;
        }
        let Some(cookie) = self.cookie else {
            self.fail(ErrorCode::AuthKey);
            self.dispatch_notifications();
            return;
        };

        let mut link = Link {
            dispatch: ReplyDispatcher::new(),
            stream: PacketStream::new(),
        };
        let tag = self.next_tag();
        let mut t = Tagstruct::request(Command::Auth.code(), tag);
        t.put_bytes(&cookie);
        link.stream.send_tagstruct(t);
        let registered = link
            .dispatch
            .register(tag, self.config.reply_timeout(), ReplySlot::Setup);
        debug_assert!(registered, "fresh dispatcher cannot hold the tag");
        self.link = Some(link);

        self.set_state(ContextState::Authorizing);
        self.dispatch_notifications();
    }

    /// Driver callback: the transport could not be established.
    pub fn connection_failed(&mut self) {
        if self.state == ContextState::Connecting {
            self.fail(ErrorCode::ConnectionRefused);
        }
        self.dispatch_notifications();
    }

    /// Driver callback: the live transport died.
    pub fn transport_died(&mut self) {
        if !self.state.is_terminal() {
            self.fail(ErrorCode::ConnectionTerminated);
        }
        self.dispatch_notifications();
    }

    /// Disconnects from the server. Idempotent: a second call produces no
    /// further observer callback.
    pub fn disconnect(&mut self) {
        self.set_state(ContextState::Terminated);
        self.dispatch_notifications();
    }

    fn fail(&mut self, code: ErrorCode) {
        self.error = code;
        self.set_state(ContextState::Failed);
    }

    fn set_state(&mut self, state: ContextState) {
        if self.state == state {
            return;
        }
        if state.is_terminal() {
            let stream_state = if state == ContextState::Failed {
                StreamState::Failed
            } else {
                StreamState::Terminated
            };
            // Teardown order: owned streams go terminal first, then the
            // dispatcher and transport, then any pending connect, all
            // before the observer can look at the context.
            self.streams.force_all(stream_state);
            self.link = None;
            self.pending_connect = None;
            self.drain_waiters.clear();
        }
        debug!(from = %self.state, to = %state, "context state change");
        self.state = state;
        self.notifications.push_back(Notification::State);
    }

    // -----------------------------------------------------------------
    // Outgoing requests
    // -----------------------------------------------------------------

    fn next_tag(&mut self) -> u32 {
        let tag = self.ctag;
        self.ctag = self.ctag.wrapping_add(1);
        tag
    }

    fn register_reply(&mut self, tag: u32, slot: ReplySlot) {
        let timeout = self.config.reply_timeout();
        if let Some(link) = self.link.as_mut()
            && !link.dispatch.register(tag, timeout, slot)
        {
            warn!(tag, "correlation tag collision");
            self.fail(ErrorCode::Protocol);
        }
    }

    /// Sends a bare `(command, tag)` request and tracks it as an operation.
    /// The callback fires exactly once with the reply's success flag.
    pub fn send_simple_command(
        &mut self,
        command: Command,
        callback: impl FnMut(&mut Context, bool) + 'static,
    ) -> ClientResult<OperationHandle> {
        if self.state != ContextState::Ready {
            return Err(ClientError::InvalidState(format!(
                "cannot send requests while {}",
                self.state
            )));
        }

        let tag = self.next_tag();
        let t = Tagstruct::request(command.code(), tag);
        let handle = self.operations.insert(OperationKind::SimpleAck {
            callback: Some(Box::new(callback)),
        });
        if let Some(link) = self.link.as_mut() {
            link.stream.send_tagstruct(t);
        }
        self.register_reply(tag, ReplySlot::SimpleAck(handle));
        self.dispatch_notifications();
        Ok(handle)
    }

    /// Asks the server to shut down.
    pub fn exit_daemon(
        &mut self,
        callback: impl FnMut(&mut Context, bool) + 'static,
    ) -> ClientResult<OperationHandle> {
        self.send_simple_command(Command::Exit, callback)
    }

    /// Cancels a pending operation: it finishes without its callback ever
    /// being invoked, and its reply registration is dropped.
    pub fn cancel_operation(&mut self, handle: OperationHandle) {
        if self.operations.take(handle).is_some() {
            if let Some(link) = self.link.as_mut() {
                link.dispatch.unregister_operation(handle);
            }
            self.drain_waiters.retain(|&h| h != handle);
        }
    }

    /// True while the operation has neither completed nor been cancelled.
    pub fn operation_pending(&self, handle: OperationHandle) -> bool {
        self.operations.contains(handle)
    }

    /// Number of operations still outstanding.
    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    // -----------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------

    /// True while protocol traffic is outstanding: unflushed outbound
    /// frames or pending replies.
    pub fn is_pending(&self) -> bool {
        if self.state != ContextState::Ready {
            return false;
        }
        match &self.link {
            Some(link) => link.stream.has_pending() || link.dispatch.has_pending(),
            None => false,
        }
    }

    /// Requests a callback once no protocol traffic is outstanding.
    /// Returns `None` when there is nothing to wait for.
    pub fn drain(
        &mut self,
        callback: impl FnMut(&mut Context) + 'static,
    ) -> Option<OperationHandle> {
        if !self.is_pending() {
            return None;
        }
        let handle = self.operations.insert(OperationKind::Drain {
            callback: Some(Box::new(callback)),
        });
        self.drain_waiters.push(handle);
        Some(handle)
    }

    fn check_drain(&mut self) {
        if self.drain_waiters.is_empty() {
            return;
        }
        let Some(link) = &self.link else { return };
        // Both sides must be idle: completing one side can have queued new
        // traffic on the other in the meantime.
        if link.stream.has_pending() || link.dispatch.has_pending() {
            return;
        }
        for handle in std::mem::take(&mut self.drain_waiters) {
            if let Some(OperationKind::Drain { callback }) = self.operations.take(handle) {
                self.notifications.push_back(Notification::Drain { callback });
            }
        }
    }

    // -----------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------

    /// Next fully framed outbound message for the driver to write.
    pub fn pop_outbound(&mut self) -> Option<Vec<u8>> {
        self.link.as_mut()?.stream.pop_outbound()
    }

    /// Driver callback: every queued outbound frame has been written.
    pub fn outbound_flushed(&mut self) {
        self.check_drain();
        self.dispatch_notifications();
    }

    /// Feeds raw inbound bytes from the transport. Complete frames are
    /// dispatched; incomplete data is buffered.
    pub fn feed_inbound(&mut self, bytes: &[u8]) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let mut events = Vec::new();
        let parsed = link.stream.feed(bytes, &mut events);

        for event in events {
            if self.state.is_terminal() {
                break;
            }
            match event {
                TransportEvent::Packet(packet) => self.dispatch_packet(&packet),
                TransportEvent::Memchunk {
                    channel,
                    offset,
                    delta: _,
                    data,
                } => self.route_memchunk(channel, offset, data),
            }
        }

        if let Err(e) = parsed
            && !self.state.is_terminal()
        {
            warn!(error = %e, "invalid inbound frame");
            self.fail(ErrorCode::Protocol);
        }
        self.dispatch_notifications();
    }

    /// Earliest reply deadline, for the driver's timer.
    pub fn next_reply_deadline(&self) -> Option<Instant> {
        self.link.as_ref()?.dispatch.next_deadline()
    }

    /// Fires expired reply registrations by synthesizing TIMEOUT replies
    /// delivered through the regular dispatch path.
    pub fn handle_reply_timeouts(&mut self, now: Instant) {
        let expired = match &self.link {
            Some(link) => link.dispatch.expired(now),
            None => return,
        };
        for tag in expired {
            if self.state.is_terminal() {
                break;
            }
            debug!(tag, "reply timed out");
            let t = Tagstruct::request(Command::Timeout.code(), tag);
            self.dispatch_packet(&t.into_vec());
        }
        self.dispatch_notifications();
    }

    // -----------------------------------------------------------------
    // Incoming packet dispatch
    // -----------------------------------------------------------------

    fn dispatch_packet(&mut self, packet: &[u8]) {
        let mut r = TagstructReader::new(packet);
        let command = match r.get_u32() {
            Ok(c) => c,
            Err(_) => {
                self.fail(ErrorCode::Protocol);
                return;
            }
        };
        let tag = match r.get_u32() {
            Ok(t) => t,
            Err(_) => {
                self.fail(ErrorCode::Protocol);
                return;
            }
        };

        match Command::try_from(command) {
            Ok(Command::Request) => self.command_request(&mut r),
            Ok(Command::PlaybackStreamKilled) => {
                self.command_stream_killed(StreamDirection::Playback, &mut r)
            }
            Ok(Command::RecordStreamKilled) => {
                self.command_stream_killed(StreamDirection::Record, &mut r)
            }
            Ok(Command::SubscribeEvent) => self.command_subscribe_event(&mut r),
            _ => {
                // Anything else must correlate with a pending request.
                let slot = self.link.as_mut().and_then(|l| l.dispatch.take(tag));
                match slot {
                    Some(ReplySlot::Setup) => self.setup_complete(command, &mut r),
                    Some(ReplySlot::SimpleAck(handle)) => {
                        self.simple_ack_complete(handle, command, &mut r)
                    }
                    None => {
                        warn!(command, tag, "packet matches no pending tag");
                        self.fail(ErrorCode::Protocol);
                    }
                }
                self.check_drain();
            }
        }
    }

    /// Shared classification of a non-success reply. Returns false when the
    /// reply was so malformed that the context has already been failed.
    fn handle_error(&mut self, command: u32, r: &mut TagstructReader<'_>) -> bool {
        if command == Command::Error.code() {
            match r.get_u32() {
                Ok(code) => {
                    self.error = ErrorCode::from_code(code);
                    true
                }
                Err(_) => {
                    self.fail(ErrorCode::Protocol);
                    false
                }
            }
        } else if command == Command::Timeout.code() {
            self.error = ErrorCode::Timeout;
            true
        } else {
            self.fail(ErrorCode::Protocol);
            false
        }
    }

    /// Continuation for the AUTH and SET_NAME replies.
    fn setup_complete(&mut self, command: u32, r: &mut TagstructReader<'_>) {
        if command != Command::Reply.code() {
            if self.handle_error(command, r) {
                let code = self.error;
                self.fail(code);
            }
            return;
        }
        if !r.eof() {
            self.fail(ErrorCode::Protocol);
            return;
        }

        match self.state {
            ContextState::Authorizing => {
                let tag = self.next_tag();
                let mut t = Tagstruct::request(Command::SetName.code(), tag);
                t.put_string(&self.name);
                if let Some(link) = self.link.as_mut() {
                    link.stream.send_tagstruct(t);
                }
                self.register_reply(tag, ReplySlot::Setup);
                self.set_state(ContextState::SettingName);
            }
            ContextState::SettingName => {
                info!(name = %self.name, "connection ready");
                self.set_state(ContextState::Ready);
            }
            _ => {
                warn!(state = %self.state, "setup reply in unexpected state");
                self.fail(ErrorCode::Protocol);
            }
        }
    }

    fn simple_ack_complete(
        &mut self,
        handle: OperationHandle,
        command: u32,
        r: &mut TagstructReader<'_>,
    ) {
        let Some(OperationKind::SimpleAck { callback }) = self.operations.take(handle) else {
            return;
        };

        let mut success = true;
        if command != Command::Reply.code() {
            if !self.handle_error(command, r) {
                // Context failed on a malformed error payload; the user
                // callback is skipped.
                return;
            }
            success = false;
        } else if !r.eof() {
            self.fail(ErrorCode::Protocol);
            success = false;
        }

        self.notifications
            .push_back(Notification::SimpleAck { callback, success });
    }

    // -----------------------------------------------------------------
    // Unsolicited commands and audio routing
    // -----------------------------------------------------------------

    fn command_request(&mut self, r: &mut TagstructReader<'_>) {
        let (channel, nbytes) = match (r.get_u32(), r.get_u32()) {
            (Ok(c), Ok(n)) => (c, n),
            _ => {
                self.fail(ErrorCode::Protocol);
                return;
            }
        };
        let Some(id) = self.streams.by_channel(StreamDirection::Playback, channel) else {
            trace!(channel, "write request for unbound channel");
            return;
        };
        if let Some(entry) = self.streams.get_mut(id) {
            entry.requested_bytes += u64::from(nbytes);
        }
        self.notifications.push_back(Notification::StreamWrite {
            stream: id,
            requested: nbytes,
        });
    }

    fn command_stream_killed(&mut self, direction: StreamDirection, r: &mut TagstructReader<'_>) {
        let channel = match r.get_u32() {
            Ok(c) if r.eof() => c,
            _ => {
                self.fail(ErrorCode::Protocol);
                return;
            }
        };
        let Some(id) = self.streams.by_channel(direction, channel) else {
            debug!(channel, ?direction, "kill for unbound channel");
            return;
        };
        info!(channel, ?direction, "server killed stream");
        self.streams.kill(id, StreamState::Killed);
    }

    fn command_subscribe_event(&mut self, r: &mut TagstructReader<'_>) {
        let (event, index) = match (r.get_u32(), r.get_u32()) {
            (Ok(e), Ok(i)) => (e, i),
            _ => {
                self.fail(ErrorCode::Protocol);
                return;
            }
        };
        self.notifications
            .push_back(Notification::SubscribeEvent { event, index });
    }

    fn route_memchunk(&mut self, channel: u32, offset: u64, data: Vec<u8>) {
        match self.streams.by_channel(StreamDirection::Record, channel) {
            Some(id) => self.notifications.push_back(Notification::StreamRead {
                stream: id,
                data,
                offset,
            }),
            // The server may still reference a session this client already
            // released; such chunks are dropped, not errors.
            None => trace!(channel, len = data.len(), "chunk for unbound channel dropped"),
        }
    }

    // -----------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------

    /// Creates a streaming session owned by this context.
    pub fn create_stream(&mut self, direction: StreamDirection, name: &str) -> StreamId {
        self.streams.insert(name.to_string(), direction)
    }

    /// Binds a stream to its server-assigned channel id, enabling routing.
    pub fn bind_stream_channel(&mut self, id: StreamId, channel: u32) -> ClientResult<()> {
        if self.streams.bind_channel(id, channel) {
            Ok(())
        } else {
            Err(ClientError::InvalidState(
                "stream is unknown or already terminal".to_string(),
            ))
        }
    }

    /// Registers the data-arrival callback of a record stream.
    pub fn set_stream_read_callback(
        &mut self,
        id: StreamId,
        callback: impl FnMut(&mut Context, StreamId, &[u8], u64) + 'static,
    ) {
        if let Some(entry) = self.streams.get_mut(id) {
            entry.read_callback = Some(Box::new(callback));
        }
    }

    /// Registers the write-request callback of a playback stream.
    pub fn set_stream_write_callback(
        &mut self,
        id: StreamId,
        callback: impl FnMut(&mut Context, StreamId, u32) + 'static,
    ) {
        if let Some(entry) = self.streams.get_mut(id) {
            entry.write_callback = Some(Box::new(callback));
        }
    }

    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(id).map(|entry| entry.state)
    }

    pub fn stream_channel(&self, id: StreamId) -> Option<u32> {
        self.streams.get(id).and_then(|entry| entry.channel)
    }

    pub fn stream_name(&self, id: StreamId) -> Option<&str> {
        self.streams.get(id).map(|entry| entry.name.as_str())
    }

    /// Bytes the server has requested for a playback stream.
    pub fn stream_requested_bytes(&self, id: StreamId) -> Option<u64> {
        self.streams.get(id).map(|entry| entry.requested_bytes)
    }

    /// Releases a streaming session and its channel binding.
    pub fn release_stream(&mut self, id: StreamId) {
        self.streams.release(id);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    // -----------------------------------------------------------------
    // Notification queue
    // -----------------------------------------------------------------

    fn dispatch_notifications(&mut self) {
        if self.notifying {
            // Re-entered from a callback; the outer flush will pick up
            // whatever was queued.
            return;
        }
        self.notifying = true;
        while let Some(notification) = self.notifications.pop_front() {
            match notification {
                Notification::State => {
                    if let Some(mut cb) = self.state_callback.take() {
                        cb(self);
                        if self.state_callback.is_none() {
                            self.state_callback = Some(cb);
                        }
                    }
                }
                Notification::SimpleAck { callback, success } => {
                    if let Some(mut cb) = callback {
                        cb(self, success);
                    }
                }
                Notification::Drain { callback } => {
                    if let Some(mut cb) = callback {
                        cb(self);
                    }
                }
                Notification::StreamRead {
                    stream,
                    data,
                    offset,
                } => {
                    if let Some(mut cb) = self.streams.take_read_callback(stream) {
                        cb(self, stream, &data, offset);
                        self.streams.put_read_callback(stream, cb);
                    }
                }
                Notification::StreamWrite { stream, requested } => {
                    if let Some(mut cb) = self.streams.take_write_callback(stream) {
                        cb(self, stream, requested);
                        self.streams.put_write_callback(stream, cb);
                    }
                }
                Notification::SubscribeEvent { event, index } => {
                    if let Some(mut cb) = self.subscribe_callback.take() {
                        cb(self, event, index);
                        if self.subscribe_callback.is_none() {
                            self.subscribe_callback = Some(cb);
                        }
                    }
                }
            }
        }
        self.notifying = false;
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Pending operations are cancelled (their callbacks never run)
        // before streams are forced terminal, then owned fields drop.
        self.operations.clear();
        self.streams.force_all(StreamState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    use brook_protocol::{DESCRIPTOR_SIZE, FrameHeader, control_frame, memchunk_frame};
    use tempfile::TempDir;

    use super::*;

    fn test_context() -> (Context, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("cookie");
        std::fs::write(&cookie_path, [7u8; COOKIE_LENGTH]).unwrap();
        let config = ClientConfig {
            cookie_path: Some(cookie_path),
            ..ClientConfig::default()
        };
        (Context::with_config("test-client", config), dir)
    }

    fn reply_frame(tag: u32) -> Vec<u8> {
        control_frame(Tagstruct::request(Command::Reply.code(), tag).as_slice()).unwrap()
    }

    fn error_frame(tag: u32, code: u32) -> Vec<u8> {
        let mut t = Tagstruct::request(Command::Error.code(), tag);
        t.put_u32(code);
        control_frame(t.as_slice()).unwrap()
    }

    fn unsolicited_frame(command: Command, fields: &[u32]) -> Vec<u8> {
        let mut t = Tagstruct::request(command.code(), u32::MAX);
        for &f in fields {
            t.put_u32(f);
        }
        control_frame(t.as_slice()).unwrap()
    }

    /// Splits an outbound frame into its control body.
    fn frame_body(frame: &[u8]) -> Vec<u8> {
        let descriptor: [u8; DESCRIPTOR_SIZE] = frame[..DESCRIPTOR_SIZE].try_into().unwrap();
        let header = FrameHeader::decode(&descriptor).unwrap();
        assert!(header.is_control());
        let body = &frame[DESCRIPTOR_SIZE..];
        assert_eq!(body.len(), header.length as usize);
        body.to_vec()
    }

    fn request_head(frame: &[u8]) -> (u32, u32) {
        let body = frame_body(frame);
        let mut r = TagstructReader::new(&body);
        (r.get_u32().unwrap(), r.get_u32().unwrap())
    }

    /// Connects and walks the handshake to `Ready`, leaving the outbound
    /// queue flushed.
    fn ready_context() -> (Context, TempDir) {
        let (mut ctx, dir) = test_context();
        ctx.connect(Some("/tmp/brook-test.socket")).unwrap();
        assert_eq!(ctx.state(), ContextState::Connecting);
        ctx.take_pending_connect().unwrap();
        ctx.connection_ready();
        assert_eq!(ctx.state(), ContextState::Authorizing);
        ctx.feed_inbound(&reply_frame(0));
        assert_eq!(ctx.state(), ContextState::SettingName);
        ctx.feed_inbound(&reply_frame(1));
        assert_eq!(ctx.state(), ContextState::Ready);
        while ctx.pop_outbound().is_some() {}
        ctx.outbound_flushed();
        (ctx, dir)
    }

    #[test]
    fn handshake_walks_to_ready() {
        let (mut ctx, _dir) = test_context();
        let states = Rc::new(RefCell::new(Vec::new()));
        let seen = states.clone();
        ctx.set_state_callback(move |c| seen.borrow_mut().push(c.state()));

        ctx.connect(Some("/tmp/brook-test.socket")).unwrap();
        ctx.take_pending_connect().unwrap();
        ctx.connection_ready();

        let auth = ctx.pop_outbound().unwrap();
        let body = frame_body(&auth);
        let mut r = TagstructReader::new(&body);
        assert_eq!(r.get_u32().unwrap(), Command::Auth.code());
        assert_eq!(r.get_u32().unwrap(), 0);
        assert_eq!(r.get_bytes().unwrap(), &[7u8; COOKIE_LENGTH]);
        assert!(r.eof());

        ctx.feed_inbound(&reply_frame(0));
        let set_name = ctx.pop_outbound().unwrap();
        let body = frame_body(&set_name);
        let mut r = TagstructReader::new(&body);
        assert_eq!(r.get_u32().unwrap(), Command::SetName.code());
        assert_eq!(r.get_u32().unwrap(), 1);
        assert_eq!(r.get_string().unwrap(), "test-client");

        ctx.feed_inbound(&reply_frame(1));
        assert_eq!(ctx.state(), ContextState::Ready);
        assert_eq!(
            *states.borrow(),
            vec![
                ContextState::Connecting,
                ContextState::Authorizing,
                ContextState::SettingName,
                ContextState::Ready,
            ]
        );
    }

    #[test]
    fn connect_rejects_non_unconnected_state() {
        let (mut ctx, _dir) = test_context();
        ctx.connect(Some("/tmp/brook-test.socket")).unwrap();
        let err = ctx.connect(Some("/tmp/brook-test.socket")).unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
        assert_eq!(ctx.state(), ContextState::Connecting);
    }

    #[test]
    fn unreadable_cookie_is_a_synchronous_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            cookie_path: Some(dir.path().join("no-such-cookie")),
            ..ClientConfig::default()
        };
        let mut ctx = Context::with_config("test-client", config);
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        ctx.set_state_callback(move |_| flag.set(true));

        let err = ctx.connect(Some("/tmp/brook-test.socket")).unwrap_err();
        assert!(matches!(err, ClientError::AuthKey(_)));
        assert_eq!(ctx.state(), ContextState::Unconnected);
        assert!(ctx.take_pending_connect().is_none());
        assert!(!fired.get());
    }

    #[test]
    fn invalid_server_is_a_synchronous_error() {
        let (mut ctx, _dir) = test_context();
        let err = ctx.connect(Some("")).unwrap_err();
        assert!(matches!(err, ClientError::InvalidServer(_)));
        assert_eq!(ctx.state(), ContextState::Unconnected);
    }

    #[test]
    fn connection_failed_reports_refused() {
        let (mut ctx, _dir) = test_context();
        ctx.connect(Some("/tmp/brook-test.socket")).unwrap();
        ctx.take_pending_connect().unwrap();
        ctx.connection_failed();
        assert_eq!(ctx.state(), ContextState::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::ConnectionRefused);
    }

    #[test]
    fn auth_error_reply_fails_context() {
        let (mut ctx, _dir) = test_context();
        ctx.connect(Some("/tmp/brook-test.socket")).unwrap();
        ctx.take_pending_connect().unwrap();
        ctx.connection_ready();
        ctx.feed_inbound(&error_frame(0, ErrorCode::Access.code()));
        assert_eq!(ctx.state(), ContextState::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::Access);
    }

    #[test]
    fn set_name_error_reply_carries_server_code() {
        let (mut ctx, _dir) = test_context();
        ctx.connect(Some("/tmp/brook-test.socket")).unwrap();
        ctx.take_pending_connect().unwrap();
        ctx.connection_ready();
        ctx.feed_inbound(&reply_frame(0));
        ctx.feed_inbound(&error_frame(1, 7));
        assert_eq!(ctx.state(), ContextState::Failed);
        assert_eq!(ctx.last_error().code(), 7);
    }

    #[test]
    fn teardown_precedes_the_observer() {
        let (mut ctx, _dir) = ready_context();
        let stream = ctx.create_stream(StreamDirection::Record, "capture");
        ctx.bind_stream_channel(stream, 0).unwrap();

        let checked = Rc::new(Cell::new(false));
        let flag = checked.clone();
        ctx.set_state_callback(move |c| {
            if c.state() == ContextState::Failed {
                assert!(c.link.is_none());
                assert!(c.take_pending_connect().is_none());
                assert_eq!(c.stream_state(stream), Some(StreamState::Failed));
                flag.set(true);
            }
        });

        ctx.transport_died();
        assert!(checked.get());
        assert_eq!(ctx.last_error(), ErrorCode::ConnectionTerminated);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut ctx, _dir) = ready_context();
        let terminations = Rc::new(Cell::new(0u32));
        let count = terminations.clone();
        ctx.set_state_callback(move |c| {
            if c.state() == ContextState::Terminated {
                count.set(count.get() + 1);
            }
        });
        ctx.disconnect();
        ctx.disconnect();
        assert_eq!(terminations.get(), 1);
    }

    #[test]
    fn observer_may_disconnect_reentrantly() {
        let (mut ctx, _dir) = test_context();
        let states = Rc::new(RefCell::new(Vec::new()));
        let seen = states.clone();
        ctx.set_state_callback(move |c| {
            seen.borrow_mut().push(c.state());
            if c.state() == ContextState::Ready {
                c.disconnect();
            }
        });

        ctx.connect(Some("/tmp/brook-test.socket")).unwrap();
        ctx.take_pending_connect().unwrap();
        ctx.connection_ready();
        ctx.feed_inbound(&reply_frame(0));
        ctx.feed_inbound(&reply_frame(1));

        assert_eq!(ctx.state(), ContextState::Terminated);
        assert_eq!(
            states.borrow().last().copied(),
            Some(ContextState::Terminated)
        );
    }

    #[test]
    fn tags_increase_without_reuse() {
        let (mut ctx, _dir) = ready_context();
        let mut tags = Vec::new();
        for _ in 0..3 {
            ctx.send_simple_command(Command::Exit, |_, _| {}).unwrap();
            let (_, tag) = request_head(&ctx.pop_outbound().unwrap());
            tags.push(tag);
        }
        assert_eq!(tags, vec![2, 3, 4]);
        assert_eq!(ctx.pending_operations(), 3);
    }

    #[test]
    fn reply_with_unknown_tag_fails_context() {
        let (mut ctx, _dir) = ready_context();
        ctx.feed_inbound(&reply_frame(99));
        assert_eq!(ctx.state(), ContextState::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::Protocol);
    }

    #[test]
    fn malformed_packet_fails_context() {
        let (mut ctx, _dir) = ready_context();
        ctx.feed_inbound(&control_frame(&[1, 2, 3]).unwrap());
        assert_eq!(ctx.state(), ContextState::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::Protocol);
    }

    #[test]
    fn error_reply_completes_operation_without_failing() {
        let (mut ctx, _dir) = ready_context();
        let result = Rc::new(Cell::new(None));
        let slot = result.clone();
        let op = ctx
            .send_simple_command(Command::Exit, move |_, success| slot.set(Some(success)))
            .unwrap();
        let (_, tag) = request_head(&ctx.pop_outbound().unwrap());

        ctx.feed_inbound(&error_frame(tag, ErrorCode::NoEntity.code()));
        assert_eq!(result.get(), Some(false));
        assert_eq!(ctx.last_error(), ErrorCode::NoEntity);
        assert_eq!(ctx.state(), ContextState::Ready);
        assert!(!ctx.operation_pending(op));
    }

    #[test]
    fn truncated_error_reply_fails_and_skips_callback() {
        let (mut ctx, _dir) = ready_context();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        ctx.send_simple_command(Command::Exit, move |_, _| flag.set(true))
            .unwrap();
        let (_, tag) = request_head(&ctx.pop_outbound().unwrap());

        // ERROR with the code field missing.
        let empty_error = control_frame(
            Tagstruct::request(Command::Error.code(), tag).as_slice(),
        )
        .unwrap();
        ctx.feed_inbound(&empty_error);
        assert_eq!(ctx.state(), ContextState::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::Protocol);
        assert!(!fired.get());
    }

    #[test]
    fn trailing_data_in_reply_is_a_protocol_error() {
        let (mut ctx, _dir) = ready_context();
        let result = Rc::new(Cell::new(None));
        let slot = result.clone();
        ctx.send_simple_command(Command::Exit, move |_, success| slot.set(Some(success)))
            .unwrap();
        let (_, tag) = request_head(&ctx.pop_outbound().unwrap());

        let mut t = Tagstruct::request(Command::Reply.code(), tag);
        t.put_u32(0xdead);
        ctx.feed_inbound(&control_frame(t.as_slice()).unwrap());
        assert_eq!(result.get(), Some(false));
        assert_eq!(ctx.state(), ContextState::Failed);
    }

    #[test]
    fn reply_timeout_synthesizes_a_failed_completion() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_path = dir.path().join("cookie");
        std::fs::write(&cookie_path, [7u8; COOKIE_LENGTH]).unwrap();
        let config = ClientConfig {
            cookie_path: Some(cookie_path),
            reply_timeout_secs: 0,
            ..ClientConfig::default()
        };
        let mut ctx = Context::with_config("test-client", config);

        ctx.connect(Some("/tmp/brook-test.socket")).unwrap();
        ctx.take_pending_connect().unwrap();
        ctx.connection_ready();
        ctx.feed_inbound(&reply_frame(0));
        ctx.feed_inbound(&reply_frame(1));
        assert_eq!(ctx.state(), ContextState::Ready);

        let result = Rc::new(Cell::new(None));
        let slot = result.clone();
        ctx.send_simple_command(Command::Exit, move |_, success| slot.set(Some(success)))
            .unwrap();
        assert!(ctx.next_reply_deadline().is_some());

        ctx.handle_reply_timeouts(Instant::now() + Duration::from_millis(1));
        assert_eq!(result.get(), Some(false));
        assert_eq!(ctx.last_error(), ErrorCode::Timeout);
        assert_eq!(ctx.state(), ContextState::Ready);
        assert!(ctx.next_reply_deadline().is_none());
    }

    #[test]
    fn cancelled_operation_never_completes() {
        let (mut ctx, _dir) = ready_context();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let op = ctx
            .send_simple_command(Command::Exit, move |_, _| flag.set(true))
            .unwrap();
        let (_, tag) = request_head(&ctx.pop_outbound().unwrap());

        ctx.cancel_operation(op);
        assert!(!ctx.operation_pending(op));

        // The registration is gone too, so the late reply is unexpected.
        ctx.feed_inbound(&reply_frame(tag));
        assert!(!fired.get());
        assert_eq!(ctx.state(), ContextState::Failed);
    }

    #[test]
    fn drain_with_nothing_pending_returns_none() {
        let (mut ctx, _dir) = ready_context();
        assert!(!ctx.is_pending());
        assert!(ctx.drain(|_| {}).is_none());
    }

    #[test]
    fn drain_fires_once_after_replies_and_flush() {
        let (mut ctx, _dir) = ready_context();
        let events = Rc::new(RefCell::new(Vec::new()));

        for name in ["first", "second"] {
            let log = events.clone();
            ctx.send_simple_command(Command::Exit, move |_, _| {
                log.borrow_mut().push(name);
            })
            .unwrap();
        }
        let log = events.clone();
        let op = ctx.drain(move |_| log.borrow_mut().push("drain")).unwrap();
        assert!(ctx.operation_pending(op));

        ctx.feed_inbound(&reply_frame(2));
        ctx.feed_inbound(&reply_frame(3));
        // Replies are in, but the requests themselves are still queued.
        assert_eq!(*events.borrow(), vec!["first", "second"]);

        while ctx.pop_outbound().is_some() {}
        ctx.outbound_flushed();
        assert_eq!(*events.borrow(), vec!["first", "second", "drain"]);
        assert!(!ctx.operation_pending(op));
        assert!(!ctx.is_pending());
    }

    #[test]
    fn drop_with_pending_operations_runs_no_callbacks() {
        let fired = Rc::new(Cell::new(false));
        {
            let (mut ctx, _dir) = ready_context();
            let flag = fired.clone();
            ctx.send_simple_command(Command::Exit, move |_, _| flag.set(true))
                .unwrap();
        }
        assert!(!fired.get());
    }

    #[test]
    fn record_chunks_route_by_channel() {
        let (mut ctx, _dir) = ready_context();
        let stream = ctx.create_stream(StreamDirection::Record, "capture");
        ctx.bind_stream_channel(stream, 2).unwrap();

        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        ctx.set_stream_read_callback(stream, move |_, _, data, offset| {
            sink.borrow_mut().push((data.to_vec(), offset));
        });

        ctx.feed_inbound(&memchunk_frame(2, 16, 0, &[1, 2, 3, 4]).unwrap());
        assert_eq!(*received.borrow(), vec![(vec![1, 2, 3, 4], 16)]);
        assert_eq!(ctx.state(), ContextState::Ready);
    }

    #[test]
    fn chunks_for_unbound_channels_are_dropped() {
        let (mut ctx, _dir) = ready_context();
        let stream = ctx.create_stream(StreamDirection::Record, "capture");
        ctx.bind_stream_channel(stream, 0).unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        ctx.set_stream_read_callback(stream, move |_, _, _, _| flag.set(true));

        ctx.feed_inbound(&memchunk_frame(3, 0, 0, &[9, 9]).unwrap());
        assert!(!fired.get());
        assert_eq!(ctx.state(), ContextState::Ready);
    }

    #[test]
    fn request_command_drives_the_write_callback() {
        let (mut ctx, _dir) = ready_context();
        let stream = ctx.create_stream(StreamDirection::Playback, "music");
        ctx.bind_stream_channel(stream, 0).unwrap();

        let requested = Rc::new(Cell::new(0u32));
        let sink = requested.clone();
        ctx.set_stream_write_callback(stream, move |_, _, n| sink.set(sink.get() + n));

        ctx.feed_inbound(&unsolicited_frame(Command::Request, &[0, 1024]));
        ctx.feed_inbound(&unsolicited_frame(Command::Request, &[0, 512]));
        assert_eq!(requested.get(), 1536);
        assert_eq!(ctx.stream_requested_bytes(stream), Some(1536));
    }

    #[test]
    fn stream_killed_marks_the_stream() {
        let (mut ctx, _dir) = ready_context();
        let stream = ctx.create_stream(StreamDirection::Record, "capture");
        ctx.bind_stream_channel(stream, 1).unwrap();

        ctx.feed_inbound(&unsolicited_frame(Command::RecordStreamKilled, &[1]));
        assert_eq!(ctx.stream_state(stream), Some(StreamState::Killed));
        assert_eq!(ctx.state(), ContextState::Ready);

        // A kill for a channel nobody owns is not an error.
        ctx.feed_inbound(&unsolicited_frame(Command::PlaybackStreamKilled, &[5]));
        assert_eq!(ctx.state(), ContextState::Ready);
    }

    #[test]
    fn truncated_kill_command_fails_context() {
        let (mut ctx, _dir) = ready_context();
        ctx.feed_inbound(&unsolicited_frame(Command::RecordStreamKilled, &[]));
        assert_eq!(ctx.state(), ContextState::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::Protocol);
    }

    #[test]
    fn subscribe_events_reach_the_callback() {
        let (mut ctx, _dir) = ready_context();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        ctx.set_subscribe_callback(move |_, event, index| {
            sink.borrow_mut().push((event, index));
        });

        ctx.feed_inbound(&unsolicited_frame(Command::SubscribeEvent, &[2, 17]));
        assert_eq!(*seen.borrow(), vec![(2, 17)]);
    }

    #[test]
    fn exit_daemon_sends_the_exit_command() {
        let (mut ctx, _dir) = ready_context();
        ctx.exit_daemon(|_, _| {}).unwrap();
        let (command, _) = request_head(&ctx.pop_outbound().unwrap());
        assert_eq!(command, Command::Exit.code());
    }

    #[test]
    fn requests_require_the_ready_state() {
        let (mut ctx, _dir) = test_context();
        let err = ctx.send_simple_command(Command::Exit, |_, _| {}).unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[test]
    fn released_streams_stop_receiving() {
        let (mut ctx, _dir) = ready_context();
        let stream = ctx.create_stream(StreamDirection::Record, "capture");
        ctx.bind_stream_channel(stream, 0).unwrap();
        assert_eq!(ctx.stream_count(), 1);

        ctx.release_stream(stream);
        assert_eq!(ctx.stream_count(), 0);
        ctx.feed_inbound(&memchunk_frame(0, 0, 0, &[1]).unwrap());
        assert_eq!(ctx.state(), ContextState::Ready);
    }
}
