//! The aggregate of all channel bindings of one remote participant.
//!
//! A [`Client`] tracks every [`ChannelClient`] it spawned, plus the
//! migration state shared between them. Its channels may live on other
//! threads, so the list and the migration flags sit behind one lock;
//! completion notifications to the server core are made outside it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::channel_client::ChannelClient;
use super::CoreDispatcher;

#[derive(Default)]
struct ClientState {
    channels: Vec<Arc<ChannelClient>>,
    main_channel_client: Option<Arc<ChannelClient>>,
    during_target_migrate: bool,
    seamless_migrate: bool,
    num_migrated_channels: u32,
}

/// One remote participant: the owner of a set of channel clients.
pub struct Client {
    core: Arc<dyn CoreDispatcher>,
    thread_id: ThreadId,
    state: Mutex<ClientState>,
    weak_self: Weak<Client>,
}

impl Client {
    /// Create a client, bound to the calling thread.
    ///
    /// `migrated` marks a client connecting as the target side of a
    /// migration; channel clients added while the migration is seamless
    /// enter the awaiting-data state automatically.
    #[must_use]
    pub fn new(core: Arc<dyn CoreDispatcher>, migrated: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            core,
            thread_id: thread::current().id(),
            state: Mutex::new(ClientState {
                during_target_migrate: migrated,
                ..ClientState::default()
            }),
            weak_self: weak_self.clone(),
        })
    }

    fn strong_self(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("a client stays alive while its methods run")
    }

    fn check_thread(&self, what: &str) {
        let current = thread::current().id();
        if current != self.thread_id {
            warn!(
                owner = ?self.thread_id,
                ?current,
                "{} invoked off the client's owning thread",
                what
            );
        }
    }

    /// Register a freshly connected channel client.
    ///
    /// When the client is the target of a seamless migration, the new
    /// channel client is moved into the awaiting-data state and counted.
    pub(crate) fn add_channel(&self, rcc: Arc<ChannelClient>) {
        let mut state = self.state.lock();
        if state.during_target_migrate
            && state.seamless_migrate
            && rcc.set_migration_seamless()
        {
            state.num_migrated_channels += 1;
        }
        state.channels.insert(0, rcc);
    }

    /// Unregister a channel client (its teardown path).
    pub(crate) fn remove_channel(&self, rcc: &ChannelClient) {
        let mut state = self.state.lock();
        if let Some(at) = state
            .channels
            .iter()
            .position(|c| std::ptr::eq(Arc::as_ptr(c), rcc))
        {
            state.channels.remove(at);
        }
        if state
            .main_channel_client
            .as_ref()
            .is_some_and(|main| std::ptr::eq(Arc::as_ptr(main), rcc))
        {
            state.main_channel_client = None;
        }
    }

    /// First channel client bound to (`kind`, `id`), if any.
    #[must_use]
    pub fn get_channel(&self, kind: u32, id: u32) -> Option<Arc<ChannelClient>> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|rcc| rcc.channel().kind() == kind && rcc.channel().id() == id)
            .cloned()
    }

    /// Number of channel clients this client holds.
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// The designated main channel client.
    #[must_use]
    pub fn main_channel_client(&self) -> Option<Arc<ChannelClient>> {
        self.state.lock().main_channel_client.clone()
    }

    /// Designate the main channel client.
    pub fn set_main_channel_client(&self, rcc: Arc<ChannelClient>) {
        self.state.lock().main_channel_client = Some(rcc);
    }

    /// Whether this client is the target side of an ongoing migration.
    #[must_use]
    pub fn during_migrate_at_target(&self) -> bool {
        self.state.lock().during_target_migrate
    }

    /// Switch the ongoing target-side migration to seamless.
    ///
    /// Channel clients connected before the migration type was known are
    /// transitioned here; later arrivals are handled by
    /// [`Self::add_channel`].
    pub fn set_migration_seamless(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.during_target_migrate);
        state.seamless_migrate = true;
        let channels = state.channels.clone();
        for rcc in &channels {
            if rcc.set_migration_seamless() {
                state.num_migrated_channels += 1;
            }
        }
    }

    /// One channel finished receiving its migration data.
    ///
    /// Returns true iff this was the last channel with data outstanding;
    /// the migration flags are cleared and the server core is notified
    /// (outside the lock) in that case.
    pub(crate) fn seamless_migration_done_for_channel(&self) -> bool {
        let mut state = self.state.lock();
        state.num_migrated_channels = state.num_migrated_channels.saturating_sub(1);
        if state.num_migrated_channels > 0 {
            return false;
        }
        state.during_target_migrate = false;
        state.seamless_migrate = false;
        drop(state);
        debug!("seamless migration complete");
        self.core.seamless_migrate_complete(&self.strong_self());
        true
    }

    /// Semi-seamless migration reached its end on the target.
    ///
    /// Reports a program error and does nothing when the client is not in
    /// a semi-seamless target migration. Every channel client is notified
    /// under the lock; the server core afterwards, outside it.
    pub fn semi_seamless_migrate_complete(&self) {
        {
            let mut state = self.state.lock();
            if !state.during_target_migrate || state.seamless_migrate {
                error!("unexpected semi-seamless migration completion");
                return;
            }
            state.during_target_migrate = false;
            for rcc in state.channels.clone() {
                rcc.semi_seamless_migration_complete();
            }
        }
        self.core.semi_seamless_migrate_complete(&self.strong_self());
    }

    /// Ask every connected channel client to migrate, through its
    /// channel's migrate callback.
    pub fn migrate(&self) {
        self.check_thread("migrate");
        let channels = self.state.lock().channels.clone();
        debug!(n_channels = channels.len(), "migrating client");
        for rcc in channels {
            if rcc.is_connected() {
                rcc.channel().invoke_migrate(&rcc);
            }
        }
    }

    /// Tear the client down: disconnect and release every channel client.
    ///
    /// The disconnect callback is assumed synchronous; afterwards each
    /// channel client must have drained (an undrained pipe at teardown is
    /// a programming error and asserts).
    pub fn destroy(&self) {
        self.check_thread("destroy");
        let channels = {
            let mut state = self.state.lock();
            state.main_channel_client = None;
            std::mem::take(&mut state.channels)
        };
        debug!(n_channels = channels.len(), "destroying client");
        for rcc in channels {
            rcc.set_destroying();
            rcc.channel().invoke_disconnect(&rcc);
            assert!(rcc.pipe_is_empty(), "pipe not empty at teardown");
            assert!(
                rcc.no_item_being_sent(),
                "message still in flight at teardown"
            );
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Client")
            .field("n_channels", &state.channels.len())
            .field("during_target_migrate", &state.during_target_migrate)
            .field("seamless_migrate", &state.seamless_migrate)
            .finish_non_exhaustive()
    }
}
