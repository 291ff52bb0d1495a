//! Stateful WebSocket stream over a raw byte transport.
//!
//! [`WebSocket`] shuttles opaque binary payloads between the caller and a
//! [`RawTransport`], producing and consuming RFC 6455 frames invisibly.
//! Both directions are resumable: the transport may return would-block or
//! interrupted at any point and the state machine picks up where it left
//! off on the next call. Nothing here ever retries or sleeps.
//!
//! Outbound traffic is exclusively final unmasked binary frames, at most
//! one in flight at a time. Inbound close frames are acknowledged with a
//! bare two-byte close; ping, pong and text frames are discarded with a
//! warning after their payload has been consumed from the transport.

use std::io::{self, IoSlice};

use tracing::warn;

use super::frame::{fill_header, Opcode, ReadFrame, CONTROL_BIT, FIN_FLAG, MAX_HEADER_SIZE};
use super::RawTransport;

/// Reciprocal close frame: FIN | close opcode, zero payload.
const CLOSE_ACK: [u8; 2] = [FIN_FLAG | CONTROL_BIT, 0x00];

/// Bytes drained per call from a half-closed peer so a still-sending
/// remote cannot livelock the event loop.
const CLOSE_DRAIN_SIZE: usize = 128;

/// Outgoing side of the stream.
///
/// At most one binary frame is in flight. A frame's header must be fully
/// flushed before any of its payload leaves, and the close acknowledgement
/// may only start while no data frame is in progress.
#[derive(Debug, Clone, Copy)]
enum WriteState {
    /// Nothing in flight.
    Idle,
    /// A frame header is partially written; `payload` bytes follow it.
    Header {
        buf: [u8; MAX_HEADER_SIZE],
        pos: usize,
        len: usize,
        payload: u64,
    },
    /// The header is out; the caller still owes `remaining` payload bytes.
    Payload { remaining: u64 },
    /// The close acknowledgement is partially written.
    CloseAck { pos: usize },
}

/// Server-side WebSocket framing over a byte-oriented transport.
///
/// Created by [`upgrade`](super::handshake::upgrade) after a successful
/// HTTP handshake. Once the stream is closed every read returns 0 (after
/// draining a little peer data) and every write fails with broken-pipe.
#[derive(Debug)]
pub struct WebSocket<T> {
    transport: T,
    read_frame: ReadFrame,
    write: WriteState,
    close_pending: bool,
    closed: bool,
}

impl<T: RawTransport> WebSocket<T> {
    /// Wrap an already-upgraded transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            read_frame: ReadFrame::default(),
            write: WriteState::Idle,
            close_pending: false,
            closed: false,
        }
    }

    /// Whether the stream has been closed (by either side).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Borrow the underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Unwrap the stream, discarding framing state.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Read unframed payload bytes into `buf`.
    ///
    /// Loops until `buf` is full or the transport would block. Returns the
    /// number of payload bytes delivered, 0 on orderly close, or the
    /// transport error. If the transport reports would-block or
    /// interrupted after some bytes were already delivered, the positive
    /// count is returned and the error is swallowed.
    ///
    /// A malformed frame header closes the stream and surfaces as
    /// [`io::ErrorKind::InvalidData`].
    ///
    /// # Errors
    ///
    /// Transport errors are propagated verbatim when no payload bytes
    /// were delivered by this call.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed || self.close_pending {
            let mut discard = [0u8; CLOSE_DRAIN_SIZE];
            let _ = self.transport.read(&mut discard);
            return Ok(0);
        }

        let mut delivered = 0;
        while delivered < buf.len() {
            if !self.read_frame.frame_ready {
                let needed = self.read_frame.bytes_needed();
                let pos = self.read_frame.header_pos;
                match self.transport.read(&mut self.read_frame.header[pos..pos + needed]) {
                    Ok(0) => {
                        self.closed = true;
                        return Ok(delivered);
                    }
                    Ok(rc) => {
                        self.read_frame.header_pos += rc;
                        if self.read_frame.bytes_needed() == 0 {
                            if let Err(err) = self.read_frame.parse() {
                                self.closed = true;
                                return Err(io::Error::new(io::ErrorKind::InvalidData, err));
                            }
                        }
                    }
                    Err(err) => return Self::partial_or_error(delivered, err),
                }
                continue;
            }

            match self.read_frame.opcode {
                Opcode::Close => {
                    self.close_pending = true;
                    self.read_frame.clear();
                    // Best effort: the reciprocal close goes out now if the
                    // transport allows, otherwise on the next write attempt.
                    let _ = self.flush_pending();
                    return Ok(delivered);
                }
                Opcode::Binary => {
                    if self.read_frame.remaining() == 0 {
                        self.read_frame.clear();
                        continue;
                    }
                    let want = (buf.len() - delivered)
                        .min(usize::try_from(self.read_frame.remaining()).unwrap_or(usize::MAX));
                    match self.transport.read(&mut buf[delivered..delivered + want]) {
                        Ok(0) => {
                            self.closed = true;
                            return Ok(delivered);
                        }
                        Ok(rc) => {
                            self.read_frame.relay(&mut buf[delivered..delivered + rc]);
                            delivered += rc;
                            if self.read_frame.remaining() == 0 {
                                self.read_frame.clear();
                            }
                        }
                        Err(err) => return Self::partial_or_error(delivered, err),
                    }
                }
                opcode => {
                    if self.read_frame.relayed == 0 {
                        warn!(
                            ?opcode,
                            len = self.read_frame.expected_len,
                            "discarding unexpected websocket frame"
                        );
                    }
                    if let Err(err) = self.skip_frame_payload() {
                        return Self::partial_or_error(delivered, err);
                    }
                    if self.closed {
                        return Ok(delivered);
                    }
                }
            }
        }

        Ok(delivered)
    }

    /// Consume the payload of a discarded frame from the transport.
    ///
    /// Resumable: on would-block the frame stays in place with its
    /// `relayed` cursor advanced and the next read continues the skip.
    fn skip_frame_payload(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; CLOSE_DRAIN_SIZE];
        let want = self
            .read_frame
            .remaining()
            .min(scratch.len() as u64) as usize;
        if want == 0 {
            self.read_frame.clear();
            return Ok(());
        }
        match self.transport.read(&mut scratch[..want]) {
            Ok(0) => {
                self.closed = true;
                Ok(())
            }
            Ok(rc) => {
                self.read_frame.relay(&mut scratch[..rc]);
                if self.read_frame.remaining() == 0 {
                    self.read_frame.clear();
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn partial_or_error(delivered: usize, err: io::Error) -> io::Result<usize> {
        if delivered > 0
            && matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            )
        {
            Ok(delivered)
        } else {
            Err(err)
        }
    }

    /// Drive whatever the outgoing side still owes the wire.
    ///
    /// Finishes a partially written frame header, then (only when no data
    /// frame is in flight) emits the pending close acknowledgement.
    /// Returns `Ok` once new payload may be written or the stream has
    /// nothing pending; would-block is surfaced when the transport stalls
    /// mid-header or mid-acknowledgement.
    fn flush_pending(&mut self) -> io::Result<()> {
        loop {
            match self.write {
                WriteState::Payload { remaining } => {
                    if remaining > 0 {
                        // The caller still owes payload for the current
                        // frame; nothing else may go out before it.
                        return Ok(());
                    }
                    self.write = WriteState::Idle;
                }
                WriteState::Header { buf, pos, len, payload } => {
                    let rc = self.transport.write(&buf[pos..len])?;
                    if rc == 0 {
                        return Err(io::ErrorKind::WriteZero.into());
                    }
                    let pos = pos + rc;
                    if pos < len {
                        self.write = WriteState::Header { buf, pos, len, payload };
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                    self.write = WriteState::Payload { remaining: payload };
                    if payload > 0 {
                        return Ok(());
                    }
                }
                WriteState::CloseAck { pos } => {
                    let rc = self.transport.write(&CLOSE_ACK[pos..])?;
                    let pos = pos + rc;
                    if pos < CLOSE_ACK.len() {
                        self.write = WriteState::CloseAck { pos };
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                    self.write = WriteState::Idle;
                    self.close_pending = false;
                    self.closed = true;
                }
                WriteState::Idle => {
                    if self.close_pending {
                        self.write = WriteState::CloseAck { pos: 0 };
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Start a new outgoing binary frame of `len` payload bytes.
    fn begin_frame(&mut self, len: u64) -> io::Result<()> {
        debug_assert!(matches!(self.write, WriteState::Idle));
        let mut buf = [0u8; MAX_HEADER_SIZE];
        let header_len = fill_header(&mut buf, len);
        self.write = WriteState::Header {
            buf,
            pos: 0,
            len: header_len,
            payload: len,
        };
        self.flush_pending()
    }

    /// Write payload bytes as (part of) a binary frame.
    ///
    /// When a previous frame's payload is still owed, the write continues
    /// that frame and is clamped so it cannot straddle the frame boundary;
    /// otherwise a header for `buf.len()` bytes is emitted first. Returns
    /// the number of payload bytes accepted.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::BrokenPipe`] once the stream is closed,
    /// and with would-block if the transport stalls before any payload of
    /// this call is accepted.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.flush_pending()?;
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let len = match self.write {
            WriteState::Payload { remaining } => {
                buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX))
            }
            WriteState::Idle => {
                self.begin_frame(buf.len() as u64)?;
                buf.len()
            }
            WriteState::Header { .. } | WriteState::CloseAck { .. } => {
                unreachable!("flush_pending never leaves a partial header behind on success")
            }
        };

        let rc = self.transport.write(&buf[..len])?;
        if let WriteState::Payload { remaining } = &mut self.write {
            *remaining -= rc as u64;
            if *remaining == 0 {
                self.write = WriteState::Idle;
            }
        }
        Ok(rc)
    }

    /// Vectored variant of [`Self::write`].
    ///
    /// For a new frame the freshly built header is prepended as a
    /// synthetic first slice and the whole thing goes out in a single
    /// `writev`. If the transport accepts fewer bytes than the header
    /// length, the header position is recorded and would-block is
    /// returned; the next call finishes the header before any payload.
    /// Otherwise the surplus beyond the header is returned as the payload
    /// byte count.
    ///
    /// # Errors
    ///
    /// Same error surface as [`Self::write`].
    pub fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.flush_pending()?;
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        match self.write {
            WriteState::Payload { remaining } => {
                let constrained = constrain_iov(bufs, remaining);
                let rc = self.transport.writev(&constrained)?;
                if let WriteState::Payload { remaining } = &mut self.write {
                    *remaining -= rc as u64;
                    if *remaining == 0 {
                        self.write = WriteState::Idle;
                    }
                }
                Ok(rc)
            }
            WriteState::Idle => {
                let total: u64 = bufs.iter().map(|b| b.len() as u64).sum();
                let mut header = [0u8; MAX_HEADER_SIZE];
                let header_len = fill_header(&mut header, total);

                let mut out = Vec::with_capacity(bufs.len() + 1);
                out.push(IoSlice::new(&header[..header_len]));
                out.extend_from_slice(bufs);

                let rc = self.transport.writev(&out)?;
                if rc < header_len {
                    self.write = WriteState::Header {
                        buf: header,
                        pos: rc,
                        len: header_len,
                        payload: total,
                    };
                    return Err(io::ErrorKind::WouldBlock.into());
                }

                let surplus = rc - header_len;
                let remaining = total - surplus as u64;
                self.write = if remaining > 0 {
                    WriteState::Payload { remaining }
                } else {
                    WriteState::Idle
                };
                Ok(surplus)
            }
            WriteState::Header { .. } | WriteState::CloseAck { .. } => {
                unreachable!("flush_pending never leaves a partial header behind on success")
            }
        }
    }
}

/// Clamp an iovec to at most `maxlen` total bytes.
fn constrain_iov<'s>(bufs: &'s [IoSlice<'s>], maxlen: u64) -> Vec<IoSlice<'s>> {
    let mut out = Vec::with_capacity(bufs.len());
    let mut left = maxlen;
    for buf in bufs {
        if left == 0 {
            break;
        }
        let take = (buf.len() as u64).min(left) as usize;
        out.push(IoSlice::new(&buf[..take]));
        left -= take as u64;
    }
    out
}
