//! Pool slot state types.
//!
//! A slot is the pool's record of one named connection: lifecycle state, the
//! command channel into its actor, shared metrics, and the generation guard
//! that invalidates stale timer callbacks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Result;
use crate::id::ConnectionId;
use crate::metrics::ConnectionMetrics;
use crate::wire::epoch_millis;

/// Command channel depth per connection actor.
pub(crate) const COMMAND_BUFFER: usize = 32;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// Commands accepted by a connection actor.
pub(crate) enum ActorCommand {
    /// Transmit a frame. `reply` is `None` for fire-and-forget probes.
    Send {
        frame: Vec<u8>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Close the transport cleanly and stop the actor. Intentional closes
    /// never reschedule a reconnection.
    Close,
}

/// State shared between a connection actor and the pool.
pub(crate) struct SlotShared {
    /// Epoch milliseconds of the most recent inbound frame or successful send.
    pub(crate) last_activity: AtomicU64,
    pub(crate) metrics: Mutex<ConnectionMetrics>,
}

impl SlotShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            last_activity: AtomicU64::new(epoch_millis()),
            metrics: Mutex::new(ConnectionMetrics::default()),
        })
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(epoch_millis(), Ordering::Relaxed);
    }
}

/// One named entry in the pool map.
pub(crate) struct Slot {
    pub(crate) id: ConnectionId,
    pub(crate) url: String,
    pub(crate) state: ConnectionState,
    /// Generation guard. Reconnect timers and actor signals carry the epoch
    /// they were created under and are discarded when it no longer matches,
    /// so a timer firing after removal or replacement cannot resurrect a
    /// dead slot.
    pub(crate) epoch: u64,
    /// Creation order, kept stable across reconnections so balancer
    /// iteration has a fixed cyclical order.
    pub(crate) seq: u64,
    pub(crate) reconnect_attempts: u32,
    pub(crate) connected_at: Option<Instant>,
    pub(crate) shared: Arc<SlotShared>,
    pub(crate) commands: Option<mpsc::Sender<ActorCommand>>,
    pub(crate) actor: Option<JoinHandle<()>>,
    pub(crate) reconnect_task: Option<JoinHandle<()>>,
}

impl Slot {
    /// A freshly reserved slot: registered in the map, transport not yet open.
    pub(crate) fn reserved(id: ConnectionId, url: String, epoch: u64, seq: u64) -> Self {
        Self {
            id,
            url,
            state: ConnectionState::Connecting,
            epoch,
            seq,
            reconnect_attempts: 0,
            connected_at: None,
            shared: SlotShared::new(),
            commands: None,
            actor: None,
            reconnect_task: None,
        }
    }

    /// Read-only snapshot for the accessor API.
    pub(crate) fn info(&self) -> ConnectionInfo {
        let mut metrics = lock_or_recover(&self.shared.metrics).clone();
        if self.state == ConnectionState::Connected {
            if let Some(connected_at) = self.connected_at {
                metrics.uptime_ms = connected_at.elapsed().as_millis() as u64;
            }
        }
        ConnectionInfo {
            id: self.id.clone(),
            url: self.url.clone(),
            state: self.state,
            last_activity_ms: self.shared.last_activity.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts,
            metrics,
        }
    }

    /// Tear the slot down: cancel any pending reconnect timer and close the
    /// actor. Falls back to aborting the actor task when the command channel
    /// cannot take the close.
    pub(crate) fn retire(&mut self) {
        if let Some(timer) = self.reconnect_task.take() {
            timer.abort();
        }
        match self.commands.take() {
            Some(commands) => {
                if commands.try_send(ActorCommand::Close).is_err() {
                    if let Some(actor) = self.actor.take() {
                        actor.abort();
                    }
                }
            }
            None => {
                if let Some(actor) = self.actor.take() {
                    actor.abort();
                }
            }
        }
    }
}

/// Public snapshot of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub url: String,
    pub state: ConnectionState,
    /// Epoch milliseconds of the most recent activity.
    pub last_activity_ms: u64,
    /// Reconnection attempts since the last successful open.
    pub reconnect_attempts: u32,
    pub metrics: ConnectionMetrics,
}

/// Cumulative pool counters, updated atomically across tasks.
pub(crate) struct PoolCounters {
    pub(crate) total_reconnects: AtomicU64,
    pub(crate) messages_queued: AtomicU64,
    pub(crate) messages_dropped: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn new() -> Self {
        Self {
            total_reconnects: AtomicU64::new(0),
            messages_queued: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Lock a mutex, recovering from poisoning if necessary.
///
/// If a thread panicked while holding the lock, logs a warning and recovers
/// the data. This keeps the pool operational while surfacing the issue.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Mutex poisoned (previous holder panicked), recovering");
            poisoned.into_inner()
        }
    }
}
