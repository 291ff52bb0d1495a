//! Shared fixtures for the session unit tests: a scripted transport, a
//! recording backend, and a recording server core.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::channel::{Channel, ChannelBuilder};
use super::channel_client::ChannelClient;
use super::client::Client;
use super::pipe::PipeItem;
use super::{ChannelBackend, CoreDispatcher, SessionStream};

/// Server core that counts migration notifications.
#[derive(Default)]
pub(crate) struct TestCore {
    pub seamless_done: AtomicUsize,
    pub semi_done: AtomicUsize,
}

impl CoreDispatcher for TestCore {
    fn seamless_migrate_complete(&self, _client: &Arc<Client>) {
        self.seamless_done.fetch_add(1, Ordering::AcqRel);
    }

    fn semi_seamless_migrate_complete(&self, _client: &Arc<Client>) {
        self.semi_done.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn test_core() -> Arc<dyn CoreDispatcher> {
    Arc::new(TestCore::default())
}

#[derive(Default)]
struct StreamState {
    input: VecDeque<Vec<u8>>,
    eof: bool,
    written: Vec<u8>,
    accept: VecDeque<usize>,
    fail_writes: bool,
    block_writes: bool,
}

/// Scripted session transport.
pub(crate) struct TestStream {
    socket: i32,
    state: Arc<Mutex<StreamState>>,
}

/// Handle tests keep after boxing the stream into a channel client.
#[derive(Clone)]
pub(crate) struct StreamHandle {
    state: Arc<Mutex<StreamState>>,
}

impl TestStream {
    pub fn new(socket: i32) -> (Self, StreamHandle) {
        let state = Arc::new(Mutex::new(StreamState::default()));
        (
            Self {
                socket,
                state: Arc::clone(&state),
            },
            StreamHandle { state },
        )
    }
}

impl StreamHandle {
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Queue per-write byte caps; a cap of 0 makes that write block.
    pub fn accept_bytes(&self, caps: &[usize]) {
        self.state.lock().accept.extend(caps.iter().copied());
    }

    pub fn fail_writes(&self) {
        self.state.lock().fail_writes = true;
    }

    pub fn block_writes(&self) {
        self.state.lock().block_writes = true;
    }

    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().input.push_back(bytes.to_vec());
    }

    pub fn set_eof(&self) {
        self.state.lock().eof = true;
    }
}

impl SessionStream for TestStream {
    fn socket(&self) -> i32 {
        self.socket
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let Some(chunk) = state.input.front_mut() else {
            return if state.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        };
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            state.input.pop_front();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::other("scripted write failure"));
        }
        if state.block_writes {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let cap = state.accept.pop_front().unwrap_or(usize::MAX).min(buf.len());
        if cap == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.written.extend_from_slice(&buf[..cap]);
        Ok(cap)
    }
}

/// Recording state shared between a [`TestBackend`] and its test.
#[derive(Default)]
pub(crate) struct TestBackendState {
    pub refuse_config: AtomicBool,
    pub reject_messages: AtomicBool,
    pub serialize_items: AtomicBool,
    pub disconnects: AtomicUsize,
    pub sent_items: Mutex<Vec<u32>>,
    pub messages: Mutex<Vec<(u16, Vec<u8>)>>,
    pub migrate_data: Mutex<Vec<Vec<u8>>>,
}

/// Channel backend that records every hook invocation.
#[derive(Clone, Default)]
pub(crate) struct TestBackend {
    pub state: Arc<TestBackendState>,
}

impl ChannelBackend for TestBackend {
    fn config_socket(&self, _rcc: &ChannelClient) -> bool {
        !self.state.refuse_config.load(Ordering::Acquire)
    }

    fn on_disconnect(&self, _rcc: &ChannelClient) {
        self.state.disconnects.fetch_add(1, Ordering::AcqRel);
    }

    fn alloc_recv_buf(
        &self,
        _rcc: &ChannelClient,
        _msg_type: u16,
        size: u32,
    ) -> Option<Vec<u8>> {
        Some(vec![0; size as usize])
    }

    fn release_recv_buf(&self, _rcc: &ChannelClient, _msg_type: u16, _buf: Vec<u8>) {}

    fn handle_message(&self, _rcc: &ChannelClient, msg_type: u16, data: &[u8]) -> bool {
        if self.state.reject_messages.load(Ordering::Acquire) {
            return false;
        }
        self.state.messages.lock().push((msg_type, data.to_vec()));
        true
    }

    fn send_item(&self, rcc: &ChannelClient, item: PipeItem) {
        self.state.sent_items.lock().push(item.item_type());
        if self.state.serialize_items.load(Ordering::Acquire) {
            rcc.begin_send_message(item.item_type() as u16, b"item-body");
        }
    }

    fn handles_migrate_data(&self) -> bool {
        true
    }

    fn handle_migrate_data(&self, _rcc: &ChannelClient, data: &[u8]) -> bool {
        self.state.migrate_data.lock().push(data.to_vec());
        true
    }
}

pub(crate) fn test_channel_with(
    configure: impl FnOnce(ChannelBuilder) -> ChannelBuilder,
) -> (Arc<Channel>, TestBackend) {
    let backend = TestBackend::default();
    let builder = configure(ChannelBuilder::new(test_core(), 2, 0));
    let channel = builder.build(Box::new(backend.clone()));
    (channel, backend)
}

pub(crate) fn test_channel() -> (Arc<Channel>, TestBackend) {
    test_channel_with(|builder| builder)
}

pub(crate) fn test_channel_kind(kind: u32) -> (Arc<Channel>, TestBackend) {
    let backend = TestBackend::default();
    let channel = ChannelBuilder::new(test_core(), kind, 0).build(Box::new(backend.clone()));
    (channel, backend)
}

pub(crate) fn test_client() -> Arc<Client> {
    Client::new(test_core(), false)
}

pub(crate) fn test_client_with_core(core: &Arc<TestCore>) -> Arc<Client> {
    Client::new(Arc::clone(core) as Arc<dyn CoreDispatcher>, false)
}
