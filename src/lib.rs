//! Deskmux: the network front-end core of a remote-desktop session server.
//!
//! # Overview
//!
//! Two tightly coupled subsystems:
//!
//! - [`ws`]: a server-side WebSocket (RFC 6455) framing layer over an
//!   arbitrary byte-oriented transport. It performs the HTTP Upgrade
//!   handshake, then shuttles opaque binary payloads while producing and
//!   consuming frames invisibly, resuming cleanly across partial I/O.
//! - [`session`]: the in-process model of a multiplexed session. One
//!   [`Client`](session::Client) is composed of many
//!   [`ChannelClient`](session::ChannelClient)s, each bound to a
//!   [`Channel`](session::Channel); channels fan send/receive work out
//!   across their connected clients, track outgoing queues, coordinate
//!   capability negotiation, and drive the migration handshake.
//!
//! # Core Guarantees
//!
//! - **Non-blocking framing**: transport callbacks may return would-block
//!   or interrupted at any point; state machines resume on the next call
//!   and nothing below the explicit drain loop ever sleeps.
//! - **Ordered delivery**: the bytes of one write appear in order on the
//!   wire behind at most one new frame header; a client's pipe items are
//!   delivered in FIFO order.
//! - **Tolerant affinity**: thread-affinity violations on channels and
//!   clients are logged and tolerated, never fatal.
//!
//! # Module Structure
//!
//! - [`ws`]: frame codec, upgrade handshake, stateful stream
//! - [`session`]: channels, channel clients, the client aggregate

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod session;
pub mod ws;

pub use session::{
    CapabilitySet, Channel, ChannelBackend, ChannelBuilder, ChannelCaps, ChannelClient, Client,
    ClientCallbacks, CoreDispatcher, PipeItem, PipeItemPayload, SessionError, SessionStream,
};
pub use ws::{upgrade, FrameError, HandshakeError, RawTransport, WebSocket};
