//! Channel fan-out driven through the public API: a three-client channel
//! with a serializing backend, drained by the quiesce loop.

mod common;

use common::init_test_logging;
use deskmux::session::{migrate, ChannelBuilder, MINI_HEADER_SIZE};
use deskmux::{
    ChannelBackend, ChannelClient, Client, CoreDispatcher, PipeItem, SessionStream,
};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct NullCore {
    seamless: AtomicUsize,
}

impl CoreDispatcher for NullCore {
    fn seamless_migrate_complete(&self, _client: &Arc<Client>) {
        self.seamless.fetch_add(1, Ordering::AcqRel);
    }
    fn semi_seamless_migrate_complete(&self, _client: &Arc<Client>) {}
}

struct SinkStream {
    socket: i32,
    written: Arc<Mutex<Vec<u8>>>,
}

impl SinkStream {
    fn new(socket: i32) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                socket,
                written: Arc::clone(&written),
            },
            written,
        )
    }
}

impl SessionStream for SinkStream {
    fn socket(&self) -> i32 {
        self.socket
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Serializes every pipe item as a message whose type is the item type.
#[derive(Clone, Default)]
struct CursorBackend {
    items_seen: Arc<Mutex<Vec<(i32, u32)>>>,
}

impl ChannelBackend for CursorBackend {
    fn on_disconnect(&self, _rcc: &ChannelClient) {}

    fn alloc_recv_buf(
        &self,
        _rcc: &ChannelClient,
        _msg_type: u16,
        size: u32,
    ) -> Option<Vec<u8>> {
        Some(vec![0; size as usize])
    }

    fn release_recv_buf(&self, _rcc: &ChannelClient, _msg_type: u16, _buf: Vec<u8>) {}

    fn handle_message(&self, _rcc: &ChannelClient, _msg_type: u16, _data: &[u8]) -> bool {
        true
    }

    fn send_item(&self, rcc: &ChannelClient, item: PipeItem) {
        self.items_seen.lock().push((rcc.socket(), item.item_type()));
        rcc.begin_send_message(item.item_type() as u16, b"cursor-shape");
    }

    fn handles_migrate_data(&self) -> bool {
        true
    }

    fn handle_migrate_data(&self, _rcc: &ChannelClient, _data: &[u8]) -> bool {
        true
    }
}

#[test]
fn broadcast_reaches_every_client_and_drains() {
    init_test_logging();
    let core = Arc::new(NullCore::default());
    let backend = CursorBackend::default();
    let channel = ChannelBuilder::new(core.clone(), 4, 0).build(Box::new(backend.clone()));
    let client = Client::new(core, false);

    let mut sinks = Vec::new();
    for socket in 1..=3 {
        let (stream, written) = SinkStream::new(socket);
        ChannelClient::new(&channel, &client, Box::new(stream), &[], &[]).expect("connect");
        sinks.push(written);
    }

    channel.pipes_add_type(7);
    assert_eq!(channel.sum_pipes_size(), 3);
    assert_eq!(channel.max_pipe_size(), 1);

    assert!(channel.wait_all_sent(Some(Duration::from_secs(1))));

    // Every client got exactly one serialized message.
    for written in &sinks {
        let bytes = written.lock();
        assert_eq!(&bytes[..2], &7u16.to_le_bytes());
        assert_eq!(bytes.len(), MINI_HEADER_SIZE + "cursor-shape".len());
    }
    // The backend saw each client once.
    assert_eq!(backend.items_seen.lock().len(), 3);
}

#[test]
fn creator_fan_out_counts_and_filters() {
    init_test_logging();
    let core = Arc::new(NullCore::default());
    let backend = CursorBackend::default();
    let channel = ChannelBuilder::new(core.clone(), 4, 0).build(Box::new(backend));
    let client = Client::new(core, false);

    for socket in 1..=3 {
        let (stream, _written) = SinkStream::new(socket);
        ChannelClient::new(&channel, &client, Box::new(stream), &[], &[]).expect("connect");
    }

    let added = channel.pipes_new_add(|rcc, index| {
        (rcc.socket() != 2).then(|| PipeItem::new(index as u32 + 100))
    });
    assert_eq!(added, 2);
    assert_eq!(channel.sum_pipes_size(), 2);
    assert_eq!(channel.min_pipe_size(), 0);
}

#[test]
fn seamless_migration_completes_through_public_api() {
    init_test_logging();
    let core = Arc::new(NullCore::default());
    let backend = CursorBackend::default();
    let channel = ChannelBuilder::new(core.clone(), 4, 0)
        .migration_flags(migrate::NEED_DATA_TRANSFER)
        .build(Box::new(backend));
    let client = Client::new(core.clone(), true);

    let (stream, _written) = SinkStream::new(1);
    let rcc = ChannelClient::new(&channel, &client, Box::new(stream), &[], &[]).expect("connect");

    client.set_migration_seamless();
    assert!(channel.is_waiting_for_migrate_data());

    assert!(rcc.handle_migrate_data(b"buffered cursor state"));
    assert!(!channel.is_waiting_for_migrate_data());
    assert_eq!(core.seamless.load(Ordering::Acquire), 1);
    assert!(!client.during_migrate_at_target());
}
