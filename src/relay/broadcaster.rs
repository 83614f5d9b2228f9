//! Broadcaster task.
//!
//! Drains the bus and writes each message to every registered client except
//! its sender. Writes to distinct peers run concurrently, but the whole
//! fan-out finishes before the next message is taken, so every recipient
//! sees a sender's messages in order.

use crate::error::RelayError;
use crate::relay::bus::{BusReceiver, Message};
use crate::relay::connection::Client;
use crate::relay::framing;
use crate::relay::registry::Registry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

/// Outcome of delivering one message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
    /// Peers already closed elsewhere, e.g. by shutdown.
    pub skipped: usize,
}

pub struct Broadcaster {
    bus: BusReceiver,
    registry: Registry,
}

impl Broadcaster {
    pub fn new(bus: BusReceiver, registry: Registry) -> Self {
        Self { bus, registry }
    }

    /// Run until every bus sender is gone and the queue is empty. Returns
    /// the totals over every message handled.
    pub async fn run(mut self) -> FanOut {
        let mut messages = 0u64;
        let mut totals = FanOut::default();
        while let Some(message) = self.bus.recv().await {
            let result = fan_out(&self.registry, &message).await;
            trace!(
                sender = %message.sender_id,
                delivered = result.delivered,
                failed = result.failed,
                skipped = result.skipped,
                "Broadcast message"
            );
            totals.delivered += result.delivered;
            totals.failed += result.failed;
            totals.skipped += result.skipped;
            messages += 1;
        }
        debug!(
            messages,
            delivered = totals.delivered,
            failed = totals.failed,
            skipped = totals.skipped,
            "Broadcaster stopped"
        );
        totals
    }
}

/// Deliver `message` to every client in the current registry snapshot
/// except the sender. Failed peers are removed and closed; the rest of the
/// fan-out is unaffected.
pub async fn fan_out(registry: &Registry, message: &Message) -> FanOut {
    let frame = framing::encode(&message.payload);
    let mut writes: JoinSet<(Arc<Client>, Result<(), RelayError>)> = JoinSet::new();

    let mut outcome = FanOut::default();
    for peer in registry.snapshot() {
        if *peer.id() == message.sender_id {
            continue;
        }
        if peer.is_closed() {
            outcome.skipped += 1;
            continue;
        }
        let frame = frame.clone();
        writes.spawn(async move {
            let result = peer.send(&frame).await;
            (peer, result)
        });
    }

    while let Some(joined) = writes.join_next().await {
        match joined {
            Ok((_, Ok(()))) => outcome.delivered += 1,
            // Closed while the write was in flight; already reported there
            Ok((peer, Err(_))) if peer.is_closed() => outcome.skipped += 1,
            Ok((peer, Err(e))) => {
                outcome.failed += 1;
                warn!(client = %peer.id(), error = %e, "Failed to send message");
                registry.remove_client(&peer);
                peer.close().await;
            }
            Err(e) => {
                outcome.failed += 1;
                error!(error = %e, "Send task failed");
            }
        }
    }

    outcome
}
