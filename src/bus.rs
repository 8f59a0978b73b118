//! In-process message hub feeding the engine loop.
//!
//! Inbound network requests, replies to our own requests, timer expirations and
//! local commands all arrive here. Delivery is FIFO to a single consumer and
//! publishing never blocks.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::event::Event;

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    sender: mpsc::UnboundedSender<Event>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BusInner {
                sender,
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    /// Enqueues an event. Returns false when the consumer is gone.
    pub fn publish(&self, event: Event) -> bool {
        match self.inner.sender.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                trace!("Dropping {:?}: bus consumer has stopped", event);
                false
            }
        }
    }

    /// Hands out the receiving end. Only the first caller gets it.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.inner.receiver.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.is_closed()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
