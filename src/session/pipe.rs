//! Pipe items: lazily serialized units of outgoing work.
//!
//! A pipe item carries a numeric type the owning channel's backend
//! understands, plus an optional payload. The item is not serialized when
//! enqueued; the backend's `send_item` hook marshals it when it reaches
//! the head of a client's pipe.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

/// One unit of outgoing work queued on a channel client.
pub struct PipeItem {
    item_type: u32,
    payload: PipeItemPayload,
}

/// Payload variants a pipe item can carry.
pub enum PipeItemPayload {
    /// A bare marker; the type alone tells the backend what to send.
    None,
    /// An empty wire message of the given message type, serialized by the
    /// framework rather than the backend.
    EmptyMsg {
        /// Message type to put in the wire header.
        msg_type: u16,
    },
    /// Backend-defined payload, downcast by the backend's `send_item`.
    Custom(Box<dyn Any + Send>),
}

impl PipeItem {
    /// A bare item of the given type.
    #[must_use]
    pub fn new(item_type: u32) -> Self {
        Self {
            item_type,
            payload: PipeItemPayload::None,
        }
    }

    /// An item that sends an empty message of `msg_type`.
    #[must_use]
    pub fn empty_msg(item_type: u32, msg_type: u16) -> Self {
        Self {
            item_type,
            payload: PipeItemPayload::EmptyMsg { msg_type },
        }
    }

    /// An item carrying a backend-defined payload.
    #[must_use]
    pub fn with_payload(item_type: u32, payload: Box<dyn Any + Send>) -> Self {
        Self {
            item_type,
            payload: PipeItemPayload::Custom(payload),
        }
    }

    /// The channel-defined item type.
    #[must_use]
    pub fn item_type(&self) -> u32 {
        self.item_type
    }

    /// The payload, if any.
    #[must_use]
    pub fn payload(&self) -> &PipeItemPayload {
        &self.payload
    }

    /// The message type when this is an empty-message item.
    #[must_use]
    pub fn as_empty_msg(&self) -> Option<u16> {
        match self.payload {
            PipeItemPayload::EmptyMsg { msg_type } => Some(msg_type),
            _ => None,
        }
    }

    /// Borrow the custom payload downcast to `T`.
    #[must_use]
    pub fn downcast_payload<T: Any>(&self) -> Option<&T> {
        match &self.payload {
            PipeItemPayload::Custom(payload) => payload.downcast_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for PipeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match self.payload {
            PipeItemPayload::None => "none",
            PipeItemPayload::EmptyMsg { .. } => "empty-msg",
            PipeItemPayload::Custom(_) => "custom",
        };
        f.debug_struct("PipeItem")
            .field("item_type", &self.item_type)
            .field("payload", &payload)
            .finish()
    }
}

/// FIFO of pipe items belonging to one channel client.
///
/// New work enters at the head; sending consumes from the tail, so items
/// leave in the order they were queued. `add_tail` jumps the queue and is
/// sent before everything already queued.
#[derive(Debug, Default)]
pub(crate) struct Pipe {
    items: VecDeque<PipeItem>,
}

impl Pipe {
    pub fn add(&mut self, item: PipeItem) {
        self.items.push_front(item);
    }

    pub fn add_tail(&mut self, item: PipeItem) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<PipeItem> {
        self.items.pop_back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
