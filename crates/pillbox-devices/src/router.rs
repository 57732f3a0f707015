//! Hand-off queue between the receive loop and the foreground consumer.
//!
//! The receive loop never calls into application code; it routes each
//! decoded message here and goes back to reading. The consumer drains the
//! queue on its own schedule. Delivery is FIFO and exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::protocol::{DeviceMessage, MessageKind};

/// A routed message with its arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Monotonic per-router sequence number, starting at 0
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    pub message: DeviceMessage,
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

/// Create a connected producer/consumer pair.
pub fn channel() -> (MessageRouter, MessageReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MessageRouter {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        },
        MessageReceiver { rx },
    )
}

/// Producer side, owned by the receive loop.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    tx: mpsc::UnboundedSender<Envelope>,
    seq: Arc<AtomicU64>,
}

impl MessageRouter {
    /// Queue a message. Returns `false` if the consumer is gone.
    pub fn route(&self, message: DeviceMessage) -> bool {
        let envelope = Envelope {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            received_at: Utc::now(),
            message,
        };
        self.tx.send(envelope).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side.
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl MessageReceiver {
    /// Wait for the next message. `None` once every router is dropped and
    /// the queue is empty.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next message if one is queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
