//! HTTP Upgrade handshake (RFC 6455 Section 4).
//!
//! The server accepts exactly one flavor of upgrade: a `GET` request
//! carrying a `Sec-WebSocket-Key` and a `Sec-WebSocket-Protocol` whose
//! first token is `binary`. Anything else is rejected and no stream is
//! produced.
//!
//! The request is completed with a single additional transport read into
//! a fixed 4 KiB buffer. A `GET` fragmented across more than the caller's
//! prefix plus that one read therefore fails the handshake; a typical
//! upgrade request is a few hundred bytes, so this does not occur with
//! real peers, but it is a known limitation of the design.

use std::io;

use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

use super::stream::WebSocket;
use super::RawTransport;

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Size of the request assembly buffer.
const REQUEST_BUF_SIZE: usize = 4096;

/// The only subprotocol this server speaks.
const PROTOCOL: &str = "binary";

/// Reasons an upgrade request is refused.
///
/// None of these leave a usable stream behind; the caller decides whether
/// to drop the connection or hand it to a different front-end.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Not a `GET`, or the request terminator never arrived in the
    /// assembled buffer.
    #[error("request is not a complete websocket upgrade")]
    NotAnUpgrade,
    /// A required header is absent.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    /// `Sec-WebSocket-Protocol` does not offer `binary` first.
    #[error("unsupported websocket subprotocol")]
    ProtocolMismatch,
    /// The 101 response could not be written in full.
    #[error("short write sending the 101 response")]
    ShortResponse,
    /// Transport failure while assembling the request.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// Per RFC 6455 Section 4.2.2: base64(SHA1(key ∥ GUID)). The key is used
/// exactly as it appears on the wire after whitespace trimming.
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Perform the server side of the upgrade handshake.
///
/// `prefix` is whatever the caller has already read from the transport
/// (typically the bytes it sniffed to decide this is a WebSocket client).
/// One additional read completes the request, the headers are validated,
/// and the 101 response is written back. On success the transport is
/// wrapped in a [`WebSocket`] ready for framed I/O.
///
/// # Errors
///
/// Returns [`HandshakeError`] when the request is not an acceptable
/// upgrade; the transport is dropped in that case.
pub fn upgrade<T: RawTransport>(prefix: &[u8], mut transport: T) -> Result<WebSocket<T>, HandshakeError> {
    if prefix.len() >= REQUEST_BUF_SIZE {
        return Err(HandshakeError::NotAnUpgrade);
    }

    let mut buf = [0u8; REQUEST_BUF_SIZE];
    buf[..prefix.len()].copy_from_slice(prefix);
    let mut len = prefix.len();

    let rc = transport.read(&mut buf[len..])?;
    if rc == 0 {
        return Err(HandshakeError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    len += rc;

    let request =
        std::str::from_utf8(&buf[..len]).map_err(|_| HandshakeError::NotAnUpgrade)?;

    if !request.starts_with("GET ") || !request.ends_with("\r\n\r\n") {
        return Err(HandshakeError::NotAnUpgrade);
    }

    let protocol = header_value(request, "Sec-WebSocket-Protocol")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Protocol"))?;
    let first_token = protocol
        .split([',', ' ', '\t'])
        .next()
        .unwrap_or_default();
    if first_token != PROTOCOL {
        return Err(HandshakeError::ProtocolMismatch);
    }

    let key = header_value(request, "Sec-WebSocket-Key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Protocol: {PROTOCOL}\r\n\r\n",
        compute_accept_key(key)
    );
    let written = transport.write(response.as_bytes())?;
    if written != response.len() {
        return Err(HandshakeError::ShortResponse);
    }

    Ok(WebSocket::new(transport))
}

/// Locate a header by name (case-insensitive) and return its value with
/// surrounding whitespace removed.
///
/// Matches `\n<name>:` so a header name appearing inside a value cannot
/// be picked up.
fn header_value<'a>(request: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("\n{name}:");
    let needle = needle.as_bytes();
    let hay = request.as_bytes();

    let at = hay
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))?;
    let rest = &request[at + needle.len()..];
    let end = rest.find('\r').unwrap_or(rest.len());
    Some(rest[..end].trim())
}
