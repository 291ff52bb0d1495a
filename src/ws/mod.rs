//! Server-side WebSocket framing (RFC 6455).
//!
//! This module wraps an arbitrary byte-oriented transport in WebSocket
//! framing: [`handshake::upgrade`] validates the HTTP Upgrade request and
//! produces a [`WebSocket`] stream that reads and writes opaque binary
//! payloads, handling headers, masking and the close handshake invisibly.
//!
//! # Architecture
//!
//! - `frame`: wire format parse/emit (RFC 6455 Section 5)
//! - `handshake`: HTTP upgrade negotiation (RFC 6455 Section 4)
//! - `stream`: stateful read/write over [`RawTransport`] callbacks
//!
//! Deliberate deviations from the RFC, inherited from the remote-desktop
//! use case: continuation frames are never reassembled (a non-final
//! continuation is treated as binary so bytes flow with minimal latency),
//! pings are not answered, and only binary final frames are produced.

mod frame;
mod handshake;
mod stream;

pub use frame::{extract_length, fill_header, FrameError, Opcode, ReadFrame, MAX_HEADER_SIZE};
pub use handshake::{compute_accept_key, upgrade, HandshakeError};
pub use stream::WebSocket;

use std::io::{self, IoSlice};

/// Byte-oriented transport consumed by the framing layer.
///
/// Semantics mirror POSIX I/O: `Ok(0)` means orderly EOF, an error of
/// kind [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::Interrupted`]
/// means try again on readiness, anything else is fatal. The framing
/// layer never retries a call itself.
pub trait RawTransport {
    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Vectored write; may accept fewer bytes than the slices carry.
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
}
