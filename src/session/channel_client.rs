//! One remote participant's binding to one channel.
//!
//! A [`ChannelClient`] owns the transport stream, the outgoing pipe, and
//! the incoming/outgoing message drivers for a single (channel, client)
//! pair. It is reference counted; the channel's registry drops its entry
//! on disconnect, but the channel client keeps the channel alive until
//! the last reference goes away.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::caps::{CapabilitySet, ChannelCaps};
use super::channel::Channel;
use super::client::Client;
use super::pipe::{Pipe, PipeItem};
use super::{migrate, SessionError, SessionStream};

/// Size of the compact wire header: message type (u16) then body size
/// (u32), both little-endian.
pub const MINI_HEADER_SIZE: usize = 6;

/// Messages a client may have outstanding before acknowledging.
///
/// A client further behind than twice this window is considered blocked
/// and stops being fed from its pipe.
pub const CLIENT_ACK_WINDOW: u32 = 20;

#[derive(Debug)]
struct OutgoingMessage {
    data: Vec<u8>,
    pos: usize,
}

#[derive(Debug, Default)]
struct IncomingState {
    header: [u8; MINI_HEADER_SIZE],
    header_pos: usize,
    body: Option<Vec<u8>>,
    body_pos: usize,
}

#[derive(Debug)]
struct AckState {
    messages_window: u32,
    client_window: u32,
}

enum FlushOutcome {
    Drained,
    Blocked,
    Failed,
}

/// A single remote participant connected to a single channel.
pub struct ChannelClient {
    channel: Arc<Channel>,
    client: Arc<Client>,
    socket: i32,
    stream: Mutex<Box<dyn SessionStream>>,
    remote_caps: ChannelCaps,
    pipe: Mutex<Pipe>,
    outgoing: Mutex<Option<OutgoingMessage>>,
    incoming: Mutex<IncomingState>,
    ack: Mutex<AckState>,
    connected: AtomicBool,
    blocked: AtomicBool,
    destroying: AtomicBool,
    wait_migrate_data: AtomicBool,
    during_migrate: AtomicBool,
}

impl ChannelClient {
    /// Bind `client` to `channel` over `stream`.
    ///
    /// Runs the backend's `config_socket` hook, then registers the new
    /// channel client with both the channel and the client. The remote
    /// capability words are kept for [`Self::test_remote_cap`] queries.
    ///
    /// # Errors
    ///
    /// [`SessionError::ConfigSocket`] when the backend refuses the
    /// transport; nothing is registered in that case.
    pub fn new(
        channel: &Arc<Channel>,
        client: &Arc<Client>,
        stream: Box<dyn SessionStream>,
        common_caps: &[u32],
        caps: &[u32],
    ) -> Result<Arc<Self>, SessionError> {
        let socket = stream.socket();
        let rcc = Arc::new(Self {
            channel: Arc::clone(channel),
            client: Arc::clone(client),
            socket,
            stream: Mutex::new(stream),
            remote_caps: ChannelCaps {
                common: CapabilitySet::from_words(common_caps),
                channel: CapabilitySet::from_words(caps),
            },
            pipe: Mutex::new(Pipe::default()),
            outgoing: Mutex::new(None),
            incoming: Mutex::new(IncomingState::default()),
            ack: Mutex::new(AckState {
                messages_window: 0,
                client_window: CLIENT_ACK_WINDOW,
            }),
            connected: AtomicBool::new(true),
            blocked: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            wait_migrate_data: AtomicBool::new(false),
            during_migrate: AtomicBool::new(false),
        });

        if !channel.backend().config_socket(&rcc) {
            return Err(SessionError::ConfigSocket);
        }

        channel.add_client(Arc::clone(&rcc));
        client.add_channel(Arc::clone(&rcc));
        trace!(
            channel_type = channel.kind(),
            channel_id = channel.id(),
            socket,
            "channel client connected"
        );
        Ok(rcc)
    }

    /// The channel this client is bound to.
    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// The client aggregate this binding belongs to.
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// The transport's socket descriptor.
    #[must_use]
    pub fn socket(&self) -> i32 {
        self.socket
    }

    /// Whether the remote advertises a common capability.
    #[must_use]
    pub fn test_remote_common_cap(&self, cap: u32) -> bool {
        self.remote_caps.common.test(cap)
    }

    /// Whether the remote advertises a channel-specific capability.
    #[must_use]
    pub fn test_remote_cap(&self, cap: u32) -> bool {
        self.remote_caps.channel.test(cap)
    }

    /// Still present in its channel's registry.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Backpressured: mid-message on a full transport, or out of ack
    /// window.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire) || self.ack_blocked()
    }

    pub(crate) fn set_destroying(&self) {
        self.destroying.store(true, Ordering::Release);
    }

    /// Marked for teardown by its client.
    #[must_use]
    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    // --- outgoing pipe -----------------------------------------------------

    /// Queue an item at the head of the pipe.
    pub fn pipe_add(&self, item: PipeItem) {
        self.pipe.lock().add(item);
    }

    /// Queue an item and immediately drive the send side.
    pub fn pipe_add_push(&self, item: PipeItem) {
        self.pipe_add(item);
        self.push();
    }

    /// Queue an item at the tail: it is sent before everything queued.
    pub fn pipe_add_tail(&self, item: PipeItem) {
        self.pipe.lock().add_tail(item);
    }

    /// Queue a bare item of `item_type`.
    pub fn pipe_add_type(&self, item_type: u32) {
        self.pipe_add(PipeItem::new(item_type));
    }

    /// Queue an empty message of `msg_type`, serialized by the framework.
    pub fn pipe_add_empty_msg(&self, msg_type: u16) {
        self.pipe_add(PipeItem::empty_msg(0, msg_type));
    }

    /// Number of queued pipe items.
    #[must_use]
    pub fn pipe_size(&self) -> u32 {
        self.pipe.lock().len() as u32
    }

    /// Whether the pipe is drained.
    #[must_use]
    pub fn pipe_is_empty(&self) -> bool {
        self.pipe.lock().is_empty()
    }

    /// No partially sent message is in flight.
    #[must_use]
    pub fn no_item_being_sent(&self) -> bool {
        self.outgoing.lock().is_none()
    }

    // --- send side ---------------------------------------------------------

    /// Start sending a message: compact header, then `body`.
    ///
    /// Meant to be called from the backend's `send_item` hook; at most one
    /// message may be in flight per client. Transport backpressure leaves
    /// the remainder for the next [`Self::send`]/[`Self::push`] pass.
    pub fn begin_send_message(&self, msg_type: u16, body: &[u8]) {
        {
            let mut outgoing = self.outgoing.lock();
            debug_assert!(outgoing.is_none(), "a message is already in flight");
            let mut data = Vec::with_capacity(MINI_HEADER_SIZE + body.len());
            data.extend_from_slice(&msg_type.to_le_bytes());
            data.extend_from_slice(&u32::to_le_bytes(body.len() as u32));
            data.extend_from_slice(body);
            *outgoing = Some(OutgoingMessage { data, pos: 0 });
        }
        self.send();
    }

    /// Continue flushing the in-flight message, if any.
    pub fn send(&self) {
        if !self.is_connected() {
            return;
        }
        if matches!(self.flush_outgoing(), FlushOutcome::Failed) {
            self.disconnect();
        }
    }

    /// Drive the pipe: flush the in-flight message, then keep popping
    /// items into the backend's serializer until the transport pushes
    /// back, the ack window runs out, or the pipe drains.
    pub fn push(&self) {
        if !self.is_connected() {
            return;
        }
        loop {
            match self.flush_outgoing() {
                FlushOutcome::Failed => {
                    self.disconnect();
                    return;
                }
                FlushOutcome::Blocked => return,
                FlushOutcome::Drained => {}
            }
            if self.ack_blocked() {
                return;
            }
            let Some(item) = self.pipe.lock().pop() else {
                return;
            };
            self.dispatch_send_item(item);
        }
    }

    fn dispatch_send_item(&self, item: PipeItem) {
        if let Some(msg_type) = item.as_empty_msg() {
            self.begin_send_message(msg_type, &[]);
        } else {
            self.channel.backend().send_item(self, item);
        }
    }

    fn flush_outgoing(&self) -> FlushOutcome {
        let mut outgoing = self.outgoing.lock();
        let Some(message) = outgoing.as_mut() else {
            self.blocked.store(false, Ordering::Release);
            return FlushOutcome::Drained;
        };

        let mut stream = self.stream.lock();
        while message.pos < message.data.len() {
            match stream.write(&message.data[message.pos..]) {
                Ok(0) => return FlushOutcome::Failed,
                Ok(n) => message.pos += n,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    self.blocked.store(true, Ordering::Release);
                    return FlushOutcome::Blocked;
                }
                Err(err) => {
                    debug!(error = %err, socket = self.socket, "write failed");
                    return FlushOutcome::Failed;
                }
            }
        }
        *outgoing = None;
        drop(stream);
        drop(outgoing);

        self.blocked.store(false, Ordering::Release);
        self.on_msg_done();
        FlushOutcome::Drained
    }

    fn on_msg_done(&self) {
        if self.channel.handle_acks() {
            self.ack.lock().messages_window += 1;
        }
    }

    fn ack_blocked(&self) -> bool {
        if !self.channel.handle_acks() {
            return false;
        }
        let ack = self.ack.lock();
        ack.messages_window > ack.client_window * 2
    }

    /// An acknowledgement arrived: one window's worth of messages is no
    /// longer outstanding. Backends call this from their message handler.
    pub fn on_ack_received(&self) {
        let mut ack = self.ack.lock();
        let window = ack.client_window;
        ack.messages_window = ack.messages_window.saturating_sub(window);
    }

    /// Restart ack accounting for this client, then drive the pipe.
    pub fn init_outgoing_window(&self) {
        self.ack.lock().messages_window = 0;
        self.push();
    }

    // --- receive side ------------------------------------------------------

    /// Pump incoming messages until the transport would block.
    ///
    /// Each complete message goes through the backend's parser and
    /// handler; a handler failure, EOF, or a fatal transport error
    /// disconnects the client.
    pub fn receive(&self) {
        if !self.is_connected() {
            return;
        }
        loop {
            match self.receive_step() {
                Ok(Some((msg_type, body))) => {
                    if !self.dispatch_message(msg_type, body) {
                        self.disconnect();
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    if !matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) {
                        debug!(error = %err, socket = self.socket, "read failed");
                        self.disconnect();
                    }
                    return;
                }
            }
        }
    }

    /// Read towards one complete message. `Ok(None)` means the stream is
    /// positioned mid-message with nothing more to read right now.
    fn receive_step(&self) -> io::Result<Option<(u16, Vec<u8>)>> {
        let mut incoming = self.incoming.lock();
        let mut stream = self.stream.lock();

        while incoming.header_pos < MINI_HEADER_SIZE {
            let pos = incoming.header_pos;
            let n = stream.read(&mut incoming.header[pos..])?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            incoming.header_pos += n;
        }

        let msg_type = u16::from_le_bytes([incoming.header[0], incoming.header[1]]);
        let msg_size = u32::from_le_bytes([
            incoming.header[2],
            incoming.header[3],
            incoming.header[4],
            incoming.header[5],
        ]) as usize;

        if incoming.body.is_none() {
            let Some(buf) = self
                .channel
                .backend()
                .alloc_recv_buf(self, msg_type, msg_size as u32)
            else {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "receive buffer allocation refused",
                ));
            };
            if buf.len() < msg_size {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "receive buffer smaller than the announced body",
                ));
            }
            incoming.body = Some(buf);
            incoming.body_pos = 0;
        }

        loop {
            let pos = incoming.body_pos;
            if pos >= msg_size {
                break;
            }
            let Some(body) = incoming.body.as_mut() else {
                break;
            };
            let n = stream.read(&mut body[pos..msg_size])?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            incoming.body_pos += n;
        }

        let Some(mut body) = incoming.body.take() else {
            return Ok(None);
        };
        body.truncate(msg_size);
        incoming.header_pos = 0;
        Ok(Some((msg_type, body)))
    }

    fn dispatch_message(&self, msg_type: u16, body: Vec<u8>) -> bool {
        let backend = self.channel.backend();
        let handled = if let Some(parser) = backend.parser() {
            match parser(msg_type, &body) {
                Some(parsed) => backend.handle_parsed(self, msg_type, parsed),
                None => {
                    warn!(msg_type, socket = self.socket, "incoming message failed to parse");
                    false
                }
            }
        } else {
            backend.handle_message(self, msg_type, &body)
        };
        backend.release_recv_buf(self, msg_type, body);
        handled
    }

    // --- lifecycle ---------------------------------------------------------

    /// Drop this binding from its channel's registry and run the
    /// backend's disconnect hook. Idempotent. The pipe and any in-flight
    /// message are discarded; the reference to the channel survives until
    /// the channel client itself is dropped.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.pipe.lock().clear();
        *self.outgoing.lock() = None;
        self.channel.remove_client(self);
        self.channel.backend().on_disconnect(self);
    }

    /// Disconnect and drop the client aggregate's strong reference.
    pub fn destroy(&self) {
        self.set_destroying();
        self.disconnect();
        self.client.remove_channel(self);
    }

    // --- migration ---------------------------------------------------------

    /// Framework migrate: mark the binding as migrating.
    ///
    /// The wire-level migrate exchange belongs to the protocol layer
    /// above; this layer only tracks the state.
    pub fn migrate(&self) {
        self.during_migrate.store(true, Ordering::Release);
        debug!(
            channel_type = self.channel.kind(),
            channel_id = self.channel.id(),
            "channel client migrating"
        );
    }

    /// Try to move into the awaiting-migration-data state.
    ///
    /// Succeeds only for channels whose migration flags request data
    /// transfer. Returns whether the transition happened; the caller
    /// counts successes towards the client's `num_migrated_channels`.
    pub(crate) fn set_migration_seamless(&self) -> bool {
        if self.channel.migration_flags() & migrate::NEED_DATA_TRANSFER != 0 {
            self.wait_migrate_data.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Awaiting buffered state from the migration source.
    #[must_use]
    pub fn is_waiting_for_migrate_data(&self) -> bool {
        self.wait_migrate_data.load(Ordering::Acquire)
    }

    /// Feed migration data from the source into the backend.
    ///
    /// On success the awaiting state clears and the client's migration
    /// accounting advances; returns false (disconnecting is up to the
    /// caller) when the data is refused or was not expected.
    pub fn handle_migrate_data(&self, data: &[u8]) -> bool {
        if !self.is_waiting_for_migrate_data() {
            warn!(
                channel_type = self.channel.kind(),
                channel_id = self.channel.id(),
                "unexpected migration data"
            );
            return false;
        }
        if !self.channel.backend().handle_migrate_data(self, data) {
            return false;
        }
        self.wait_migrate_data.store(false, Ordering::Release);
        self.client.seamless_migration_done_for_channel();
        true
    }

    /// Semi-seamless migration finished; leave the migrating state.
    pub(crate) fn semi_seamless_migration_complete(&self) {
        self.during_migrate.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("channel_type", &self.channel.kind())
            .field("channel_id", &self.channel.id())
            .field("socket", &self.socket)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
