//! The connection pool façade.
//!
//! Owns the map of named connections and wires the balancer, supervisor,
//! health sweep, outbound queue, and network signal together. All shared
//! state mutation flows through the pool; the background tasks request
//! transitions rather than mutating slots directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::Balancer;
use crate::config::{PoolConfig, PoolConfigUpdate};
use crate::error::{Error, Result};
use crate::event::{EventBus, EventStream, PoolEvent};
use crate::id::ConnectionId;
use crate::metrics::ConnectionMetrics;
use crate::network;
use crate::queue::OutboundQueue;
use crate::transport::TransportFactory;

mod actor;
mod health;
pub(crate) mod slot;
mod supervisor;

pub use slot::{ConnectionInfo, ConnectionState};

use actor::spawn_actor;
use health::health_task;
use slot::{lock_or_recover, PoolCounters, Slot, SlotShared, COMMAND_BUFFER};
use supervisor::{
    flush_queue, network_task, open_transport, send_on, supervisor_task, transmit, PoolContext,
};

/// Outcome of a load-balanced send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was transmitted on a pooled connection.
    Sent,
    /// The message was buffered for a later drain.
    Queued,
}

/// On-demand statistics snapshot. Derived from pool state, never stored.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    /// Mean latency EMA across connected connections (ms).
    pub average_latency_ms: f64,
    pub total_bytes_transferred: u64,
    pub queued_messages: usize,
    pub network_available: bool,
    pub total_reconnects: u64,
    pub messages_queued_total: u64,
    pub messages_dropped_total: u64,
}

/// A pool of named, supervised transport connections.
///
/// Construct one per backend at the application's composition root; there is
/// no global instance. Dropping the pool tears it down.
pub struct ConnectionPool {
    ctx: PoolContext,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool. Must be called within a tokio runtime: the supervisor,
    /// health, and network-watcher tasks are spawned here.
    ///
    /// The pool subscribes to `network` once, at construction; hand it
    /// [`network::always_available`] when no reachability source exists.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](crate::error::ConfigError) when the
    /// configuration is invalid.
    pub fn new(
        config: PoolConfig,
        factory: TransportFactory,
        network: watch::Receiver<bool>,
    ) -> Result<Self> {
        config.validate()?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let ctx = PoolContext {
            config: Arc::new(Mutex::new(config)),
            connections: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new(Mutex::new(OutboundQueue::new())),
            balancer: Arc::new(Balancer::new()),
            events: EventBus::new(),
            counters: Arc::new(PoolCounters::new()),
            factory,
            signals: signal_tx,
            network,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_epoch: Arc::new(AtomicU64::new(1)),
            next_seq: Arc::new(AtomicU64::new(0)),
        };
        let tasks = vec![
            tokio::spawn(supervisor_task(ctx.clone(), signal_rx)),
            tokio::spawn(health_task(ctx.clone())),
            tokio::spawn(network_task(ctx.clone())),
        ];
        Ok(Self {
            ctx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Create a pool with default configuration and no reachability source.
    pub fn with_defaults(factory: TransportFactory) -> Result<Self> {
        Self::new(PoolConfig::default(), factory, network::always_available())
    }

    /// Register a connection and open its transport.
    ///
    /// The slot is visible (in `Connecting` state) while the handshake runs,
    /// and counts toward `max_connections` immediately, so concurrent adds
    /// cannot overshoot the bound.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolExhausted`] at the connection bound
    /// - [`Error::DuplicateConnection`] when the id is already present
    /// - [`Error::ConnectTimeout`] or the transport's own error when the
    ///   handshake fails; the reservation is rolled back
    pub async fn add_connection(
        &self,
        id: impl Into<ConnectionId>,
        url: impl Into<String>,
    ) -> Result<()> {
        if self.ctx.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let id = id.into();
        let url = url.into();

        let epoch = {
            let max_connections = lock_or_recover(&self.ctx.config).max_connections;
            let mut connections = lock_or_recover(&self.ctx.connections);
            if connections.contains_key(&id) {
                return Err(Error::DuplicateConnection(id));
            }
            if connections.len() >= max_connections {
                return Err(Error::PoolExhausted {
                    max: max_connections,
                });
            }
            let epoch = self.ctx.next_epoch.fetch_add(1, Ordering::Relaxed);
            let seq = self.ctx.next_seq.fetch_add(1, Ordering::Relaxed);
            connections.insert(id.clone(), Slot::reserved(id.clone(), url.clone(), epoch, seq));
            epoch
        };

        info!(connection = %id, url = %url, "Opening connection");
        let timeout_ms = lock_or_recover(&self.ctx.config).connection_timeout_ms;
        match open_transport(&self.ctx.factory, &id, &url, timeout_ms).await {
            Ok(transport) => {
                let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
                let installed = {
                    let mut connections = lock_or_recover(&self.ctx.connections);
                    match connections.get_mut(&id) {
                        Some(slot) if slot.epoch == epoch => {
                            let shared = SlotShared::new();
                            let actor = spawn_actor(
                                id.clone(),
                                epoch,
                                transport,
                                shared.clone(),
                                self.ctx.events.clone(),
                                self.ctx.signals.clone(),
                                commands_rx,
                            );
                            slot.state = ConnectionState::Connected;
                            slot.connected_at = Some(Instant::now());
                            slot.shared = shared;
                            slot.commands = Some(commands_tx);
                            slot.actor = Some(actor);
                            true
                        }
                        // Removed while the handshake was in flight.
                        _ => false,
                    }
                };
                if !installed {
                    debug!(connection = %id, "Connection removed during handshake");
                    return Err(Error::UnknownConnection(id));
                }
                self.ctx.events.emit(PoolEvent::ConnectionAdded { id: id.clone() });
                self.ctx.events.emit(PoolEvent::ConnectionOpened { id });
                if !lock_or_recover(&self.ctx.queue).is_empty() {
                    flush_queue(&self.ctx).await;
                }
                Ok(())
            }
            Err(error) => {
                {
                    let mut connections = lock_or_recover(&self.ctx.connections);
                    if connections
                        .get(&id)
                        .is_some_and(|slot| slot.epoch == epoch)
                    {
                        connections.remove(&id);
                    }
                }
                warn!(connection = %id, %error, "Failed to open connection");
                Err(error)
            }
        }
    }

    /// Delete a connection: cancel its reconnect timer, close the transport
    /// cleanly (so no reconnection is scheduled), and drop the slot.
    /// Idempotent; removing an absent id returns `false`.
    pub fn remove_connection(&self, id: &ConnectionId) -> bool {
        let removed = {
            let mut connections = lock_or_recover(&self.ctx.connections);
            connections.remove(id)
        };
        let Some(mut slot) = removed else {
            return false;
        };
        slot.retire();
        info!(connection = %id, "Connection removed");
        self.ctx
            .events
            .emit(PoolEvent::ConnectionRemoved { id: id.clone() });
        true
    }

    /// Send a payload over the pool.
    ///
    /// While the network is unavailable the message is buffered without
    /// consulting the balancer. Otherwise the balancer picks a connected
    /// transport; a failed transmission, or an empty connected subset, falls
    /// back to the buffer. Never errors: transient failures surface as
    /// [`SendOutcome::Queued`].
    pub async fn send(&self, payload: Value, priority: i32) -> SendOutcome {
        if !self.ctx.network_available() {
            self.enqueue(payload, priority);
            return SendOutcome::Queued;
        }
        match transmit(&self.ctx, &payload).await {
            Ok(()) => SendOutcome::Sent,
            Err(error) => {
                debug!(%error, "Send fell back to the queue");
                self.enqueue(payload, priority);
                SendOutcome::Queued
            }
        }
    }

    /// Send to a specific connection, bypassing load balancing.
    ///
    /// # Errors
    ///
    /// Fails when the id is unknown, the connection is not currently
    /// connected, or the transmission fails. Targeted sends are never
    /// queued.
    pub async fn send_to_connection(&self, id: &ConnectionId, payload: Value) -> Result<()> {
        send_on(&self.ctx, id, &payload).await
    }

    /// Statistics snapshot, computed from live state.
    pub fn statistics(&self) -> PoolStats {
        let (total, connected, latency_sum, bytes) = {
            let connections = lock_or_recover(&self.ctx.connections);
            let mut connected = 0usize;
            let mut latency_sum = 0.0f64;
            let mut bytes = 0u64;
            for slot in connections.values() {
                let metrics = lock_or_recover(&slot.shared.metrics);
                bytes += metrics.bytes_transferred;
                if slot.state == ConnectionState::Connected {
                    connected += 1;
                    latency_sum += metrics.latency_ms;
                }
            }
            (connections.len(), connected, latency_sum, bytes)
        };
        PoolStats {
            total_connections: total,
            active_connections: connected,
            average_latency_ms: if connected > 0 {
                latency_sum / connected as f64
            } else {
                0.0
            },
            total_bytes_transferred: bytes,
            queued_messages: lock_or_recover(&self.ctx.queue).len(),
            network_available: self.ctx.network_available(),
            total_reconnects: self.ctx.counters.total_reconnects.load(Ordering::Relaxed),
            messages_queued_total: self.ctx.counters.messages_queued.load(Ordering::Relaxed),
            messages_dropped_total: self.ctx.counters.messages_dropped.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of one connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        lock_or_recover(&self.ctx.connections)
            .get(id)
            .map(Slot::info)
    }

    /// Snapshots of every connection, in creation order.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let connections = lock_or_recover(&self.ctx.connections);
        let mut slots: Vec<&Slot> = connections.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.iter().map(|slot| slot.info()).collect()
    }

    /// Per-connection metrics keyed by id.
    pub fn connection_metrics(&self) -> HashMap<ConnectionId, ConnectionMetrics> {
        lock_or_recover(&self.ctx.connections)
            .values()
            .map(|slot| (slot.id.clone(), slot.info().metrics))
            .collect()
    }

    /// Merge a partial configuration update. Strategy changes apply to the
    /// next selection, interval changes to the next health tick; in-flight
    /// operations are undisturbed.
    ///
    /// # Errors
    ///
    /// Rejects updates that would make the configuration invalid; the
    /// current configuration is kept.
    pub fn update_config(&self, update: PoolConfigUpdate) -> Result<()> {
        let mut config = lock_or_recover(&self.ctx.config);
        let mut candidate = config.clone();
        candidate.apply(&update);
        candidate.validate()?;
        *config = candidate;
        Ok(())
    }

    /// Current configuration.
    pub fn config(&self) -> PoolConfig {
        lock_or_recover(&self.ctx.config).clone()
    }

    /// Subscribe to the lifecycle event stream.
    pub fn subscribe(&self) -> EventStream {
        self.ctx.events.subscribe()
    }

    /// Deterministic teardown: stops the background tasks, cancels every
    /// reconnect timer, closes every transport cleanly, clears the queue,
    /// and drops all event subscribers. Safe to call more than once; the
    /// second call is a no-op.
    pub fn shutdown(&self) {
        if self.ctx.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down connection pool");
        for task in lock_or_recover(&self.tasks).drain(..) {
            task.abort();
        }
        let slots: Vec<Slot> = {
            let mut connections = lock_or_recover(&self.ctx.connections);
            connections.drain().map(|(_, slot)| slot).collect()
        };
        for mut slot in slots {
            slot.retire();
        }
        lock_or_recover(&self.ctx.queue).clear();
        self.ctx.events.clear();
    }

    fn enqueue(&self, payload: Value, priority: i32) {
        let dropped = lock_or_recover(&self.ctx.queue).enqueue(payload, priority);
        self.ctx
            .counters
            .messages_queued
            .fetch_add(1, Ordering::Relaxed);
        if dropped > 0 {
            self.ctx
                .counters
                .messages_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
