//! In-process model of a multiplexed remote-desktop session.
//!
//! One remote participant is a [`Client`]; its binding to each typed
//! channel is a [`ChannelClient`]; the channel itself is a [`Channel`]
//! that dispatches send/receive work across every participant bound to
//! it. Channels are subclassed through the [`ChannelBackend`] trait,
//! which supplies the per-channel-type parsing and serialization hooks.
//!
//! # Threading
//!
//! Affinity, not work-stealing: each channel is bound to the thread that
//! built it and its client registry must only be mutated there. Clients
//! have their own owning thread (usually the main one) and guard their
//! state with a lock, because a client's channels may live on other
//! threads. Violating affinity is logged, never fatal.
//!
//! # Lifetimes
//!
//! A channel's registry holds only currently-connected channel clients;
//! disconnecting removes the entry but the channel client keeps its
//! strong reference to the channel until it is dropped. Destroying a
//! client disconnects and releases every channel client it spawned.

pub mod caps;
pub mod channel;
pub mod channel_client;
pub mod client;
pub mod pipe;

#[cfg(test)]
pub(crate) mod testing;

pub use caps::{CapabilitySet, ChannelCaps};
pub use channel::{Channel, ChannelBuilder};
pub use channel_client::{ChannelClient, CLIENT_ACK_WINDOW, MINI_HEADER_SIZE};
pub use client::Client;
pub use pipe::{PipeItem, PipeItemPayload};

use std::any::Any;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Channel type of the main (control) channel.
///
/// The main channel is special in one way: it may rely on the framework's
/// default connect callback, every other channel type must register its
/// own.
pub const CHANNEL_MAIN: u32 = 1;

/// Common capability: compact `{type, size}` message headers.
///
/// Advertised unconditionally by every channel this crate builds.
pub const COMMON_CAP_MINI_HEADER: u32 = 3;

/// Migration behavior flags a channel is constructed with.
pub mod migrate {
    /// Outgoing pipes must drain before migration proceeds.
    pub const NEED_FLUSH: u32 = 1 << 0;
    /// The channel transfers buffered state to the migration target and
    /// its backend must provide `handle_migrate_data`.
    pub const NEED_DATA_TRANSFER: u32 = 1 << 1;
}

/// Errors surfaced when wiring a channel client up.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backend's `config_socket` hook refused the transport.
    #[error("transport configuration rejected by the channel backend")]
    ConfigSocket,
}

/// Converts a raw wire message into a parsed representation.
///
/// Returning `None` marks the message invalid and disconnects the client.
pub type MessageParser = fn(msg_type: u16, data: &[u8]) -> Option<Box<dyn Any + Send>>;

/// Transport carried by a channel client.
///
/// Read/write semantics mirror POSIX: `Ok(0)` is EOF, would-block and
/// interrupted are retried on the next driver pass, other errors
/// disconnect the client.
pub trait SessionStream: Send {
    /// The underlying socket descriptor, for readiness polling.
    fn socket(&self) -> i32;

    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// The per-channel-type hook table, injected at channel construction.
///
/// This is the seam a concrete channel (display, cursor, inputs, ...)
/// plugs its message parsers and pipe-item serializers into. Hooks are
/// invoked from the channel's owning thread and must not re-enter the
/// receive driver of the same client.
pub trait ChannelBackend: Send + Sync {
    /// Configure a freshly accepted transport (socket options and the
    /// like). Returning false aborts the connection.
    fn config_socket(&self, rcc: &ChannelClient) -> bool {
        let _ = rcc;
        true
    }

    /// The client is gone; release per-client backend state.
    fn on_disconnect(&self, rcc: &ChannelClient);

    /// Provide a buffer of at least `size` bytes for an incoming message
    /// body. `None` refuses the message and disconnects the client.
    fn alloc_recv_buf(&self, rcc: &ChannelClient, msg_type: u16, size: u32) -> Option<Vec<u8>>;

    /// Return a buffer handed out by [`Self::alloc_recv_buf`].
    fn release_recv_buf(&self, rcc: &ChannelClient, msg_type: u16, buf: Vec<u8>);

    /// Handle a raw incoming message. Returning false disconnects the
    /// client. Only called when [`Self::parser`] is `None`.
    fn handle_message(&self, rcc: &ChannelClient, msg_type: u16, data: &[u8]) -> bool;

    /// Handle a message converted by [`Self::parser`]. Returning false
    /// disconnects the client.
    fn handle_parsed(&self, rcc: &ChannelClient, msg_type: u16, parsed: Box<dyn Any + Send>) -> bool {
        let _ = (rcc, msg_type, parsed);
        false
    }

    /// Optional wire-to-struct parser; when present, incoming messages go
    /// through it and [`Self::handle_parsed`].
    fn parser(&self) -> Option<MessageParser> {
        None
    }

    /// Serialize one pipe item and start sending it, typically via
    /// [`ChannelClient::begin_send_message`].
    fn send_item(&self, rcc: &ChannelClient, item: PipeItem);

    /// Whether [`Self::handle_migrate_data`] is implemented. Channels
    /// whose migration flags request data transfer require it.
    fn handles_migrate_data(&self) -> bool {
        false
    }

    /// Restore buffered state received from the migration source.
    /// Returning false disconnects the client.
    fn handle_migrate_data(&self, rcc: &ChannelClient, data: &[u8]) -> bool {
        let _ = (rcc, data);
        false
    }
}

/// Callback invoked when a peer connects to a channel.
pub type ConnectFn = Box<
    dyn Fn(&Arc<Channel>, &Arc<Client>, Box<dyn SessionStream>, bool, &[u32], &[u32])
        + Send
        + Sync,
>;

/// Callback invoked to disconnect a channel client.
pub type DisconnectFn = Box<dyn Fn(&Arc<ChannelClient>) + Send + Sync>;

/// Callback invoked to migrate a channel client.
pub type MigrateFn = Box<dyn Fn(&Arc<ChannelClient>) + Send + Sync>;

/// Client-level callbacks an upper layer registers on a channel.
///
/// Unset entries keep the framework defaults: the default connect is a
/// program error (except on the main channel, which is exempt from
/// registering one), the default disconnect performs the generic
/// disconnect, the default migrate performs the framework migrate.
#[derive(Default)]
pub struct ClientCallbacks {
    /// Replaces the connect behavior.
    pub connect: Option<ConnectFn>,
    /// Replaces the disconnect behavior.
    pub disconnect: Option<DisconnectFn>,
    /// Replaces the migrate behavior.
    pub migrate: Option<MigrateFn>,
}

/// The server core seam: where the session layer reports migration
/// progress.
///
/// Completion may be noticed on any channel's thread; implementations
/// posting to a main dispatcher must be thread-safe.
pub trait CoreDispatcher: Send + Sync {
    /// Seamless migration finished for `client`.
    fn seamless_migrate_complete(&self, client: &Arc<Client>);

    /// Semi-seamless migration finished for `client`.
    fn semi_seamless_migrate_complete(&self, client: &Arc<Client>);
}
