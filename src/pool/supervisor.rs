//! Lifecycle supervision: state transitions, reconnection scheduling, and
//! queue draining.
//!
//! Actors report close/error conditions as signals; the supervisor task
//! applies the resulting transitions under the pool lock and schedules
//! backoff-delayed reconnection attempts. Every timer-driven mutation
//! re-validates the slot's generation under the lock first, which defuses
//! the zombie-timer hazard: a timer firing after removal or replacement
//! discards itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::balancer::{Balancer, Candidate};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::event::{EventBus, PoolEvent};
use crate::id::ConnectionId;
use crate::queue::OutboundQueue;
use crate::reconnect::ReconnectPolicy;
use crate::transport::{Transport, TransportFactory};
use crate::wire;

use super::actor::spawn_actor;
use super::slot::{lock_or_recover, ActorCommand, ConnectionState, PoolCounters, Slot, SlotShared, COMMAND_BUFFER};

/// Shared resources threaded through the supervisor, health, and network
/// tasks. All mutation of the connection map and queue flows through here,
/// with the pool façade as the single owner.
#[derive(Clone)]
pub(crate) struct PoolContext {
    pub(crate) config: Arc<Mutex<PoolConfig>>,
    pub(crate) connections: Arc<Mutex<HashMap<ConnectionId, Slot>>>,
    pub(crate) queue: Arc<Mutex<OutboundQueue>>,
    pub(crate) balancer: Arc<Balancer>,
    pub(crate) events: EventBus,
    pub(crate) counters: Arc<PoolCounters>,
    pub(crate) factory: TransportFactory,
    pub(crate) signals: mpsc::UnboundedSender<Signal>,
    pub(crate) network: watch::Receiver<bool>,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) next_epoch: Arc<AtomicU64>,
    pub(crate) next_seq: Arc<AtomicU64>,
}

impl PoolContext {
    pub(crate) fn network_available(&self) -> bool {
        *self.network.borrow()
    }
}

/// Lifecycle report from a connection actor.
pub(crate) struct Signal {
    pub(crate) id: ConnectionId,
    /// Slot generation the actor was spawned under; stale signals from a
    /// replaced connection are discarded.
    pub(crate) epoch: u64,
    pub(crate) kind: SignalKind,
}

pub(crate) enum SignalKind {
    Errored { error: String },
    Closed { clean: bool, reason: String },
}

/// Drive lifecycle signals until the pool shuts down.
pub(crate) async fn supervisor_task(ctx: PoolContext, mut signals: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = signals.recv().await {
        if ctx.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match signal.kind {
            SignalKind::Errored { error } => {
                on_transport_error(&ctx, signal.id, signal.epoch, error);
            }
            SignalKind::Closed { clean, reason } => {
                on_transport_closed(&ctx, signal.id, signal.epoch, clean, reason);
            }
        }
    }
}

/// Error transition: the slot moves to `Error` and the error counter ticks,
/// but the socket stays up until a close follows.
pub(crate) fn on_transport_error(ctx: &PoolContext, id: ConnectionId, epoch: u64, error: String) {
    {
        let mut connections = lock_or_recover(&ctx.connections);
        let Some(slot) = connections.get_mut(&id) else {
            return;
        };
        if slot.epoch != epoch {
            return;
        }
        slot.state = ConnectionState::Error;
        lock_or_recover(&slot.shared.metrics).record_error();
    }
    ctx.events.emit(PoolEvent::ConnectionError { id, error });
}

/// Close transition. Unclean closes feed the reconnection scheduler while
/// failover is enabled; intentional closes (or teardown) do not.
pub(crate) fn on_transport_closed(
    ctx: &PoolContext,
    id: ConnectionId,
    epoch: u64,
    clean: bool,
    reason: String,
) {
    let (enable_failover, max_attempts) = {
        let config = lock_or_recover(&ctx.config);
        (config.enable_failover, config.max_reconnect_attempts)
    };

    let decision = {
        let mut connections = lock_or_recover(&ctx.connections);
        let Some(slot) = connections.get_mut(&id) else {
            return;
        };
        if slot.epoch != epoch {
            return;
        }
        slot.state = ConnectionState::Disconnected;
        slot.connected_at = None;
        slot.commands = None;
        slot.actor = None;
        if clean || !enable_failover || ctx.shutdown.load(Ordering::SeqCst) {
            None
        } else {
            Some(slot.reconnect_attempts)
        }
    };

    info!(connection = %id, clean, reason = %reason, "Connection closed");
    ctx.events.emit(PoolEvent::ConnectionClosed {
        id: id.clone(),
        reason,
    });

    let Some(attempts) = decision else { return };
    if attempts >= max_attempts {
        warn!(connection = %id, attempts, "Retry budget exhausted, giving up");
        ctx.events.emit(PoolEvent::ConnectionFailed { id, attempts });
        return;
    }
    schedule_reconnect(ctx, id, epoch, attempts + 1);
}

/// Arm the backoff timer for reconnection attempt `attempt`.
pub(crate) fn schedule_reconnect(ctx: &PoolContext, id: ConnectionId, epoch: u64, attempt: u32) {
    let policy = ReconnectPolicy::from_config(&lock_or_recover(&ctx.config));
    let delay = policy.delay(attempt);
    info!(
        connection = %id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        "Scheduling reconnection"
    );

    let task_ctx = ctx.clone();
    let task_id = id.clone();
    let handle = tokio::spawn(async move {
        reconnect_after(task_ctx, task_id, epoch, attempt, delay).await;
    });

    // Register the timer so removal and shutdown can abort the sleep early.
    let mut connections = lock_or_recover(&ctx.connections);
    match connections.get_mut(&id) {
        Some(slot) if slot.epoch == epoch => slot.reconnect_task = Some(handle),
        _ => handle.abort(),
    }
}

async fn reconnect_after(
    ctx: PoolContext,
    id: ConnectionId,
    epoch: u64,
    mut attempt: u32,
    first_delay: Duration,
) {
    let mut delay = first_delay;
    loop {
        tokio::time::sleep(delay).await;
        if ctx.shutdown.load(Ordering::SeqCst) {
            return;
        }

        // Re-validate under the lock; removal or replacement invalidates
        // this timer through the epoch guard.
        let url = {
            let mut connections = lock_or_recover(&ctx.connections);
            let Some(slot) = connections.get_mut(&id) else {
                return;
            };
            if slot.epoch != epoch {
                return;
            }
            slot.state = ConnectionState::Connecting;
            slot.reconnect_attempts = attempt;
            slot.url.clone()
        };

        let (timeout_ms, policy) = {
            let config = lock_or_recover(&ctx.config);
            (
                config.connection_timeout_ms,
                ReconnectPolicy::from_config(&config),
            )
        };

        match open_transport(&ctx.factory, &id, &url, timeout_ms).await {
            Ok(transport) => {
                if install_replacement(&ctx, &id, epoch, transport, attempt) {
                    flush_queue(&ctx).await;
                }
                return;
            }
            Err(error) => {
                warn!(connection = %id, attempt, %error, "Reconnection attempt failed");
                {
                    let mut connections = lock_or_recover(&ctx.connections);
                    let Some(slot) = connections.get_mut(&id) else {
                        return;
                    };
                    if slot.epoch != epoch {
                        return;
                    }
                    slot.state = ConnectionState::Disconnected;
                }
                if policy.exhausted(attempt) {
                    warn!(connection = %id, attempts = attempt, "Retry budget exhausted, giving up");
                    ctx.events
                        .emit(PoolEvent::ConnectionFailed { id, attempts: attempt });
                    return;
                }
                attempt += 1;
                delay = policy.delay(attempt);
            }
        }
    }
}

/// Swap a freshly opened transport into the slot. A reconnection never
/// reuses the previous connection value: the slot gets a new generation,
/// fresh metrics, and a new actor, while keeping its id and creation order.
fn install_replacement(
    ctx: &PoolContext,
    id: &ConnectionId,
    epoch: u64,
    transport: Box<dyn Transport>,
    attempt: u32,
) -> bool {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let installed = {
        let mut connections = lock_or_recover(&ctx.connections);
        let Some(slot) = connections.get_mut(id) else {
            return false;
        };
        if slot.epoch != epoch {
            return false;
        }
        let new_epoch = ctx.next_epoch.fetch_add(1, Ordering::Relaxed);
        let shared = SlotShared::new();
        let actor = spawn_actor(
            id.clone(),
            new_epoch,
            transport,
            shared.clone(),
            ctx.events.clone(),
            ctx.signals.clone(),
            commands_rx,
        );
        slot.epoch = new_epoch;
        slot.state = ConnectionState::Connected;
        slot.connected_at = Some(Instant::now());
        slot.reconnect_attempts = 0;
        slot.shared = shared;
        slot.commands = Some(commands_tx);
        slot.actor = Some(actor);
        slot.reconnect_task = None;
        true
    };
    if installed {
        ctx.counters.total_reconnects.fetch_add(1, Ordering::Relaxed);
        info!(connection = %id, attempts = attempt, "Reconnected");
        ctx.events.emit(PoolEvent::ConnectionReconnected {
            id: id.clone(),
            attempts: attempt,
        });
    }
    installed
}

/// Open a transport for `url`, bounded by the handshake timeout.
pub(crate) async fn open_transport(
    factory: &TransportFactory,
    id: &ConnectionId,
    url: &str,
    timeout_ms: u64,
) -> Result<Box<dyn Transport>> {
    let mut transport = factory(url);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), transport.connect()).await {
        Ok(Ok(())) => Ok(transport),
        Ok(Err(error)) => Err(error),
        Err(_) => {
            debug!(connection = %id, timeout_ms, "Transport handshake timed out");
            Err(Error::ConnectTimeout { timeout_ms })
        }
    }
}

/// Copy-on-read view of the connected subset, in creation order.
pub(crate) fn connected_candidates(ctx: &PoolContext) -> Vec<Candidate> {
    let connections = lock_or_recover(&ctx.connections);
    let mut snapshot: Vec<(u64, Candidate)> = connections
        .values()
        .filter(|slot| slot.state == ConnectionState::Connected)
        .map(|slot| {
            let metrics = lock_or_recover(&slot.shared.metrics);
            (
                slot.seq,
                Candidate {
                    id: slot.id.clone(),
                    latency_ms: metrics.latency_ms,
                    messages_per_second: metrics.messages_per_second,
                },
            )
        })
        .collect();
    snapshot.sort_by_key(|(seq, _)| *seq);
    snapshot.into_iter().map(|(_, candidate)| candidate).collect()
}

/// Serialize `payload` and push it through the named connection's actor.
pub(crate) async fn send_on(ctx: &PoolContext, id: &ConnectionId, payload: &Value) -> Result<()> {
    let commands = {
        let connections = lock_or_recover(&ctx.connections);
        let slot = connections
            .get(id)
            .ok_or_else(|| Error::UnknownConnection(id.clone()))?;
        if slot.state != ConnectionState::Connected {
            return Err(Error::NotConnected(id.clone()));
        }
        slot.commands
            .clone()
            .ok_or_else(|| Error::NotConnected(id.clone()))?
    };
    let frame = wire::encode_envelope(payload, wire::epoch_millis())?;
    let (reply_tx, reply_rx) = oneshot::channel();
    commands
        .send(ActorCommand::Send {
            frame,
            reply: Some(reply_tx),
        })
        .await
        .map_err(|_| Error::Transport("connection actor unavailable".to_string()))?;
    reply_rx
        .await
        .map_err(|_| Error::Transport("connection actor dropped the send".to_string()))?
}

/// Pick a connection via the balancer and transmit one payload.
pub(crate) async fn transmit(ctx: &PoolContext, payload: &Value) -> Result<()> {
    let strategy = lock_or_recover(&ctx.config).load_balancing_strategy;
    let candidates = connected_candidates(ctx);
    let Some(target) = ctx.balancer.select(strategy, &candidates) else {
        return Err(Error::NoConnectionAvailable);
    };
    send_on(ctx, &target, payload).await
}

/// Drain buffered messages, highest priority and oldest first, stopping at
/// the first failed transmission so ordering survives partial progress.
pub(crate) async fn flush_queue(ctx: &PoolContext) {
    if !ctx.network_available() {
        return;
    }
    let mut drained = 0usize;
    loop {
        let message = {
            let mut queue = lock_or_recover(&ctx.queue);
            queue.pop_front()
        };
        let Some(message) = message else {
            if drained > 0 {
                debug!(drained, "Outbound queue drained");
            }
            return;
        };
        match transmit(ctx, &message.payload).await {
            Ok(()) => drained += 1,
            Err(error) => {
                debug!(drained, %error, "Queue drain halted by send failure");
                lock_or_recover(&ctx.queue).requeue(message);
                return;
            }
        }
    }
}

/// Watch the external reachability signal: buffer while down, drain on
/// recovery.
pub(crate) async fn network_task(mut ctx: PoolContext) {
    let mut available = *ctx.network.borrow();
    loop {
        if ctx.network.changed().await.is_err() {
            return;
        }
        if ctx.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now_available = *ctx.network.borrow();
        if now_available == available {
            continue;
        }
        available = now_available;
        if now_available {
            info!("Network restored, draining outbound queue");
            ctx.events.emit(PoolEvent::NetworkRestored);
            flush_queue(&ctx).await;
        } else {
            warn!("Network lost, buffering outbound traffic");
            ctx.events.emit(PoolEvent::NetworkLost);
        }
    }
}
