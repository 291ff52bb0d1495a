//! A typed logical endpoint multiplexing many connected clients.
//!
//! The channel owns the registry of its connected [`ChannelClient`]s and
//! fans operations out across them: pipe-item broadcast, send/receive
//! drivers, capability tests, and the drain loop used before migration
//! and teardown.
//!
//! Every channel is bound to the thread that constructed it; registry
//! mutation from any other thread is logged and tolerated, never turned
//! into a hard failure.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::caps::ChannelCaps;
use super::channel_client::ChannelClient;
use super::client::Client;
use super::pipe::PipeItem;
use super::{
    migrate, ChannelBackend, ClientCallbacks, ConnectFn, CoreDispatcher, DisconnectFn, MigrateFn,
    SessionStream, CHANNEL_MAIN, COMMON_CAP_MINI_HEADER,
};

/// Interval slept between drain passes in [`Channel::wait_all_sent`].
const BLOCKED_SLEEP_INTERVAL: Duration = Duration::from_millis(10);

struct ResolvedClientCbs {
    connect: ConnectFn,
    disconnect: DisconnectFn,
    migrate: MigrateFn,
}

fn default_client_cbs() -> ResolvedClientCbs {
    ResolvedClientCbs {
        connect: Box::new(|channel, _client, _stream, _migration, _common, _caps| {
            panic!(
                "no connect callback registered for channel type {}",
                channel.kind()
            );
        }),
        disconnect: Box::new(|rcc| rcc.disconnect()),
        migrate: Box::new(|rcc| rcc.migrate()),
    }
}

/// Construct-only configuration for a [`Channel`].
pub struct ChannelBuilder {
    core: Arc<dyn CoreDispatcher>,
    kind: u32,
    id: u32,
    handle_acks: bool,
    migration_flags: u32,
}

impl ChannelBuilder {
    /// Start building a channel of the given type and id.
    #[must_use]
    pub fn new(core: Arc<dyn CoreDispatcher>, kind: u32, id: u32) -> Self {
        Self {
            core,
            kind,
            id,
            handle_acks: false,
            migration_flags: 0,
        }
    }

    /// Whether this channel throttles clients on acknowledgement windows.
    #[must_use]
    pub fn handle_acks(mut self, handle_acks: bool) -> Self {
        self.handle_acks = handle_acks;
        self
    }

    /// Migration flags (see [`migrate`](super::migrate)).
    #[must_use]
    pub fn migration_flags(mut self, flags: u32) -> Self {
        self.migration_flags = flags;
        self
    }

    /// Finish construction, binding the channel to the current thread.
    ///
    /// # Panics
    ///
    /// Panics when the migration flags request data transfer but the
    /// backend does not provide `handle_migrate_data`.
    #[must_use]
    pub fn build(self, backend: Box<dyn ChannelBackend>) -> Arc<Channel> {
        assert!(
            backend.handles_migrate_data()
                || self.migration_flags & migrate::NEED_DATA_TRANSFER == 0,
            "channel requests migration data transfer without a handler"
        );

        let mut local_caps = ChannelCaps::default();
        local_caps.common.set(COMMON_CAP_MINI_HEADER);

        let thread_id = thread::current().id();
        let channel = Arc::new_cyclic(|weak_self| Channel {
            kind: self.kind,
            id: self.id,
            handle_acks: self.handle_acks,
            migration_flags: self.migration_flags,
            core: self.core,
            backend,
            local_caps: Mutex::new(local_caps),
            clients: Mutex::new(Vec::new()),
            client_cbs: RwLock::new(default_client_cbs()),
            thread_id: Mutex::new(thread_id),
            weak_self: weak_self.clone(),
        });
        debug!(
            channel_type = channel.kind,
            channel_id = channel.id,
            ?thread_id,
            "channel created"
        );
        channel
    }
}

/// A typed logical endpoint within a session, addressed by (type, id).
pub struct Channel {
    kind: u32,
    id: u32,
    handle_acks: bool,
    migration_flags: u32,
    core: Arc<dyn CoreDispatcher>,
    backend: Box<dyn ChannelBackend>,
    local_caps: Mutex<ChannelCaps>,
    clients: Mutex<Vec<Arc<ChannelClient>>>,
    client_cbs: RwLock<ResolvedClientCbs>,
    thread_id: Mutex<ThreadId>,
    weak_self: Weak<Channel>,
}

impl Channel {
    /// The channel type.
    #[must_use]
    pub fn kind(&self) -> u32 {
        self.kind
    }

    /// The channel id within its type.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether clients of this channel are ack-throttled.
    #[must_use]
    pub fn handle_acks(&self) -> bool {
        self.handle_acks
    }

    /// The migration flags this channel was built with.
    #[must_use]
    pub fn migration_flags(&self) -> u32 {
        self.migration_flags
    }

    /// The server core this channel reports into.
    #[must_use]
    pub fn core(&self) -> &Arc<dyn CoreDispatcher> {
        &self.core
    }

    /// The injected per-channel-type hook table.
    #[must_use]
    pub fn backend(&self) -> &dyn ChannelBackend {
        self.backend.as_ref()
    }

    fn check_thread(&self, what: &str) {
        let owner = *self.thread_id.lock();
        let current = thread::current().id();
        if current != owner {
            warn!(
                channel_type = self.kind,
                channel_id = self.id,
                ?owner,
                ?current,
                "{} invoked off the channel's owning thread",
                what
            );
        }
    }

    /// Rebind the channel to the calling thread.
    pub fn reset_thread_id(&self) {
        *self.thread_id.lock() = thread::current().id();
    }

    // --- registry ----------------------------------------------------------

    pub(crate) fn add_client(&self, rcc: Arc<ChannelClient>) {
        self.clients.lock().insert(0, rcc);
    }

    /// Unlink a channel client from the registry.
    ///
    /// The removed client is not released; it still holds its reference
    /// to this channel. Absence is tolerated (a racing disconnect may
    /// have won).
    pub(crate) fn remove_client(&self, rcc: &ChannelClient) {
        self.check_thread("remove_client");
        let mut clients = self.clients.lock();
        let Some(at) = clients
            .iter()
            .position(|c| std::ptr::eq(Arc::as_ptr(c), rcc))
        else {
            trace!(
                channel_type = self.kind,
                channel_id = self.id,
                "remove_client: not in the registry"
            );
            return;
        };
        clients.remove(at);
    }

    fn snapshot(&self) -> Vec<Arc<ChannelClient>> {
        self.clients.lock().clone()
    }

    /// Whether any client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.clients.lock().is_empty()
    }

    /// Number of connected clients.
    #[must_use]
    pub fn n_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Snapshot of the connected clients, in list order.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<ChannelClient>> {
        self.snapshot()
    }

    /// Run `cb` once for every connected client.
    ///
    /// Iterates a snapshot, so the callback may connect or disconnect
    /// clients without invalidating the walk.
    pub fn apply<F>(&self, mut cb: F)
    where
        F: FnMut(&Arc<ChannelClient>),
    {
        for rcc in self.snapshot() {
            cb(&rcc);
        }
    }

    // --- capabilities ------------------------------------------------------

    /// Whether every connected client advertises the common capability.
    #[must_use]
    pub fn test_remote_common_cap(&self, cap: u32) -> bool {
        self.snapshot()
            .iter()
            .all(|rcc| rcc.test_remote_common_cap(cap))
    }

    /// Whether every connected client advertises the channel capability.
    #[must_use]
    pub fn test_remote_cap(&self, cap: u32) -> bool {
        self.snapshot().iter().all(|rcc| rcc.test_remote_cap(cap))
    }

    /// Advertise a common capability locally.
    pub fn set_common_cap(&self, cap: u32) {
        self.local_caps.lock().common.set(cap);
    }

    /// Advertise a channel-specific capability locally.
    pub fn set_cap(&self, cap: u32) {
        self.local_caps.lock().channel.set(cap);
    }

    /// The capabilities this endpoint advertises.
    #[must_use]
    pub fn local_capabilities(&self) -> ChannelCaps {
        self.local_caps.lock().clone()
    }

    // --- client callbacks --------------------------------------------------

    /// Register the upper layer's connect/disconnect/migrate callbacks.
    ///
    /// # Panics
    ///
    /// Every channel type except the main channel must provide a connect
    /// callback.
    pub fn register_client_cbs(&self, cbs: ClientCallbacks) {
        assert!(
            cbs.connect.is_some() || self.kind == CHANNEL_MAIN,
            "non-main channels must register a connect callback"
        );
        let mut resolved = self.client_cbs.write();
        if let Some(connect) = cbs.connect {
            resolved.connect = connect;
        }
        if let Some(disconnect) = cbs.disconnect {
            resolved.disconnect = disconnect;
        }
        if let Some(migrate) = cbs.migrate {
            resolved.migrate = migrate;
        }
    }

    /// Hand a freshly accepted transport to the connect callback.
    pub fn connect(
        &self,
        client: &Arc<Client>,
        stream: Box<dyn SessionStream>,
        migration: bool,
        common_caps: &[u32],
        caps: &[u32],
    ) {
        let strong = self
            .weak_self
            .upgrade()
            .expect("a channel stays alive while its methods run");
        let cbs = self.client_cbs.read();
        (cbs.connect)(&strong, client, stream, migration, common_caps, caps);
    }

    pub(crate) fn invoke_disconnect(&self, rcc: &Arc<ChannelClient>) {
        let cbs = self.client_cbs.read();
        (cbs.disconnect)(rcc);
    }

    pub(crate) fn invoke_migrate(&self, rcc: &Arc<ChannelClient>) {
        let cbs = self.client_cbs.read();
        (cbs.migrate)(rcc);
    }

    // --- broadcast drivers -------------------------------------------------

    /// Pump incoming data on every client.
    pub fn receive(&self) {
        for rcc in self.snapshot() {
            rcc.receive();
        }
    }

    /// Continue flushing in-flight messages on every client.
    pub fn send(&self) {
        for rcc in self.snapshot() {
            rcc.send();
        }
    }

    /// Drive every client's pipe into its serializer.
    pub fn push(&self) {
        for rcc in self.snapshot() {
            rcc.push();
        }
    }

    /// Restart ack accounting on every client.
    pub fn init_outgoing_window(&self) {
        for rcc in self.snapshot() {
            rcc.init_outgoing_window();
        }
    }

    // --- broadcast pipe operations -----------------------------------------

    /// Queue a bare item of `item_type` on every client, in list order.
    pub fn pipes_add_type(&self, item_type: u32) {
        for rcc in self.snapshot() {
            rcc.pipe_add_type(item_type);
        }
    }

    /// Queue an empty message of `msg_type` on every client.
    pub fn pipes_add_empty_msg(&self, msg_type: u16) {
        for rcc in self.snapshot() {
            rcc.pipe_add_empty_msg(msg_type);
        }
    }

    fn pipes_create_batch<F, A>(&self, mut creator: F, add: A) -> usize
    where
        F: FnMut(&Arc<ChannelClient>, usize) -> Option<PipeItem>,
        A: Fn(&Arc<ChannelClient>, PipeItem),
    {
        let mut added = 0;
        for (index, rcc) in self.snapshot().iter().enumerate() {
            if let Some(item) = creator(rcc, index) {
                add(rcc, item);
                added += 1;
            }
        }
        added
    }

    /// Invoke `creator` once per client (index starts at 0 and counts
    /// every invocation) and queue each produced item. Returns how many
    /// items were produced.
    pub fn pipes_new_add<F>(&self, creator: F) -> usize
    where
        F: FnMut(&Arc<ChannelClient>, usize) -> Option<PipeItem>,
    {
        self.pipes_create_batch(creator, |rcc, item| rcc.pipe_add(item))
    }

    /// [`Self::pipes_new_add`], queueing at the send end of each pipe.
    pub fn pipes_new_add_tail<F>(&self, creator: F) -> usize
    where
        F: FnMut(&Arc<ChannelClient>, usize) -> Option<PipeItem>,
    {
        self.pipes_create_batch(creator, |rcc, item| rcc.pipe_add_tail(item))
    }

    /// [`Self::pipes_new_add`] followed by a push pass.
    pub fn pipes_new_add_push<F>(&self, creator: F) -> usize
    where
        F: FnMut(&Arc<ChannelClient>, usize) -> Option<PipeItem>,
    {
        let added = self.pipes_new_add(creator);
        self.push();
        added
    }

    // --- reductions --------------------------------------------------------

    /// Deepest per-client pipe.
    #[must_use]
    pub fn max_pipe_size(&self) -> u32 {
        self.snapshot()
            .iter()
            .map(|rcc| rcc.pipe_size())
            .max()
            .unwrap_or(0)
    }

    /// Shallowest per-client pipe; 0 when no clients are connected.
    #[must_use]
    pub fn min_pipe_size(&self) -> u32 {
        self.snapshot()
            .iter()
            .map(|rcc| rcc.pipe_size())
            .min()
            .unwrap_or(0)
    }

    /// Total queued items across all clients.
    #[must_use]
    pub fn sum_pipes_size(&self) -> u32 {
        self.snapshot().iter().map(|rcc| rcc.pipe_size()).sum()
    }

    /// Socket descriptor of the first-listed client; -1 when none.
    #[must_use]
    pub fn first_socket(&self) -> i32 {
        self.clients.lock().first().map_or(-1, |rcc| rcc.socket())
    }

    /// Every connected client is blocked (false when none are connected).
    #[must_use]
    pub fn all_blocked(&self) -> bool {
        let clients = self.snapshot();
        !clients.is_empty() && clients.iter().all(|rcc| rcc.is_blocked())
    }

    /// At least one connected client is blocked.
    #[must_use]
    pub fn any_blocked(&self) -> bool {
        self.snapshot().iter().any(|rcc| rcc.is_blocked())
    }

    /// No client has a partially sent message in flight.
    #[must_use]
    pub fn no_item_being_sent(&self) -> bool {
        self.snapshot().iter().all(|rcc| rcc.no_item_being_sent())
    }

    /// A single connected client is waiting for migration data.
    #[must_use]
    pub fn is_waiting_for_migrate_data(&self) -> bool {
        let clients = self.snapshot();
        if clients.len() != 1 {
            return false;
        }
        clients[0].is_waiting_for_migrate_data()
    }

    // --- teardown ----------------------------------------------------------

    /// Disconnect every client.
    pub fn disconnect(&self) {
        for rcc in self.snapshot() {
            rcc.disconnect();
        }
    }

    /// Tear the channel down: destroy every connected client.
    pub fn destroy(&self) {
        for rcc in self.snapshot() {
            rcc.destroy();
        }
    }

    // --- quiesce -----------------------------------------------------------

    /// Drain all outgoing pipes, sleeping between passes.
    ///
    /// Pushes, then loops receive/send/push at a fixed interval while any
    /// pipe holds items or any client is blocked. `None` waits forever.
    /// Returns whether everything drained before the deadline; on timeout
    /// the pending state is logged and false returned.
    pub fn wait_all_sent(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);

        self.push();
        loop {
            let pipe_size = self.max_pipe_size();
            let blocked = self.any_blocked();
            if pipe_size == 0 && !blocked {
                assert!(self.no_item_being_sent());
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    pipe_size,
                    blocked, "timeout: pending outgoing messages exist"
                );
                return false;
            }
            trace!(pipe_size, blocked, "waiting for outgoing pipes to drain");
            thread::sleep(BLOCKED_SLEEP_INTERVAL);
            self.receive();
            self.send();
            self.push();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("n_clients", &self.n_clients())
            .finish_non_exhaustive()
    }
}
