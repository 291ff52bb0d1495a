#![allow(dead_code)]
//! Shared integration test utilities.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Once;

use deskmux::RawTransport;
use proptest::prelude::ProptestConfig;

static INIT_LOGGING: Once = Once::new();

/// Install a tracing subscriber once per test binary.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Proptest configuration with an explicit case count.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    ProptestConfig {
        cases,
        ..ProptestConfig::default()
    }
}

/// Scripted byte transport shared by the websocket integration tests.
///
/// Reads hand out queued chunks; writes are recorded and can be capped
/// per call (a cap of 0 forces would-block).
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub input: VecDeque<Vec<u8>>,
    pub eof: bool,
    pub written: Vec<u8>,
    pub calls: Vec<Vec<u8>>,
    pub accept: VecDeque<usize>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn with_input<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        Self {
            input: chunks.into_iter().map(|c| c.as_ref().to_vec()).collect(),
            ..Self::default()
        }
    }

    fn take(&mut self, buf: &[u8]) -> io::Result<usize> {
        let cap = self.accept.pop_front().unwrap_or(usize::MAX).min(buf.len());
        if cap == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.written.extend_from_slice(&buf[..cap]);
        self.calls.push(buf[..cap].to_vec());
        Ok(cap)
    }
}

impl RawTransport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(chunk) = self.input.front_mut() else {
            return if self.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        };
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.input.pop_front();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.take(buf)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let flat: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
        self.take(&flat)
    }
}

/// Frame a payload the way a masking client would put it on the wire.
#[must_use]
pub fn client_frame(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(payload.len() + 14);
    wire.push(0x82);
    let len = payload.len();
    if len > 65535 {
        wire.push(0x80 | 127);
        wire.extend_from_slice(&(len as u64).to_be_bytes());
    } else if len >= 126 {
        wire.push(0x80 | 126);
        wire.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        wire.push(0x80 | len as u8);
    }
    wire.extend_from_slice(&mask);
    wire.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4]),
    );
    wire
}
