//! Lifecycle event fan-out.
//!
//! Consumers subscribe explicitly and pull events from the returned stream;
//! dropping the stream unsubscribes. Events are observability signals for
//! UI/analytics collaborators, never required for pool correctness.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::id::ConnectionId;
use crate::pool::slot::lock_or_recover;

/// Events emitted by the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A slot was registered and its transport opened.
    ConnectionAdded { id: ConnectionId },
    /// The transport handshake completed.
    ConnectionOpened { id: ConnectionId },
    /// The transport closed.
    ConnectionClosed { id: ConnectionId, reason: String },
    /// A transport-level error; the connection may still close afterwards.
    ConnectionError { id: ConnectionId, error: String },
    /// A supervised reconnection succeeded.
    ConnectionReconnected { id: ConnectionId, attempts: u32 },
    /// The retry budget is exhausted; the slot stays down until the
    /// application removes or re-adds it.
    ConnectionFailed { id: ConnectionId, attempts: u32 },
    /// The slot was deleted.
    ConnectionRemoved { id: ConnectionId },
    /// An inbound application message.
    Message { id: ConnectionId, payload: Value },
    /// The reachability signal flipped to available; the queue is draining.
    NetworkRestored,
    /// The reachability signal flipped to unavailable.
    NetworkLost,
    /// A health sweep finished.
    HealthCheckCompleted {
        connections: usize,
        connected: usize,
        queued: usize,
    },
}

struct Subscriber {
    tx: mpsc::UnboundedSender<PoolEvent>,
}

/// Multi-subscriber event bus. Closed subscribers are pruned on emit.
#[derive(Clone)]
pub(crate) struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_or_recover(&self.subscribers).push(Subscriber { tx });
        EventStream { rx }
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        lock_or_recover(&self.subscribers).retain(|s| s.tx.send(event.clone()).is_ok());
    }

    pub(crate) fn clear(&self) {
        lock_or_recover(&self.subscribers).clear();
    }
}

/// Stream of pool events. Dropping it unsubscribes.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<PoolEvent>,
}

impl EventStream {
    /// Receive the next event. Returns `None` once the pool has shut down.
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<PoolEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_to_all_current_subscribers() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.emit(PoolEvent::NetworkLost);
        assert!(matches!(first.try_recv(), Some(PoolEvent::NetworkLost)));
        assert!(matches!(second.try_recv(), Some(PoolEvent::NetworkLost)));
    }

    #[test]
    fn dropped_streams_are_pruned() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        drop(stream);
        bus.emit(PoolEvent::NetworkRestored);
        assert!(lock_or_recover(&bus.subscribers).is_empty());
    }

    #[test]
    fn clear_disconnects_subscribers() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        bus.clear();
        bus.emit(PoolEvent::NetworkLost);
        assert!(stream.try_recv().is_none());
    }
}
