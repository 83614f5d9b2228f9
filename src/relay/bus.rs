//! Message bus between reader tasks and the broadcaster.
//!
//! A bounded FIFO: many producers, one consumer. When it fills up,
//! producers wait up to a deadline and then give up, so memory stays
//! bounded under load. Per-producer order is the channel's FIFO order.

use crate::error::RelayError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

/// One framed payload and the client that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender_id: Arc<str>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(sender_id: Arc<str>, payload: Bytes) -> Self {
        Self { sender_id, payload }
    }
}

/// Create a bus holding at most `capacity` undelivered messages.
pub fn channel(capacity: usize) -> (BusSender, BusReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (BusSender { tx }, BusReceiver { rx })
}

/// Producer side, cloned into every reader task.
#[derive(Debug, Clone)]
pub struct BusSender {
    tx: mpsc::Sender<Message>,
}

impl BusSender {
    /// Enqueue a message, waiting at most `deadline` for free capacity.
    pub async fn publish(&self, message: Message, deadline: Duration) -> Result<(), RelayError> {
        self.tx
            .send_timeout(message, deadline)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => RelayError::Capacity(deadline),
                SendTimeoutError::Closed(_) => RelayError::BusClosed,
            })
    }
}

/// Consumer side, owned by the broadcaster.
#[derive(Debug)]
pub struct BusReceiver {
    rx: mpsc::Receiver<Message>,
}

impl BusReceiver {
    /// Wait for the next message. `None` once every sender is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}
