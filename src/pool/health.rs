//! Periodic health sweep.
//!
//! Each sweep resets the per-interval message rate, refreshes uptime,
//! probes idle connections with a heartbeat frame, and hands connections
//! whose actor died without a close signal to the reconnection scheduler.
//! Staleness alone never triggers a reconnect; liveness is inferred from
//! subsequent activity or an eventual close/error.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::PoolEvent;
use crate::id::ConnectionId;
use crate::wire;

use super::slot::{lock_or_recover, ActorCommand, ConnectionState};
use super::supervisor::{on_transport_closed, PoolContext};

/// Run sweeps until shutdown. The interval is re-read every cycle so config
/// updates take effect on the next tick.
pub(crate) async fn health_task(ctx: PoolContext) {
    loop {
        let interval_ms = lock_or_recover(&ctx.config).health_check_interval_ms;
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        if ctx.shutdown.load(Ordering::SeqCst) {
            return;
        }
        sweep(&ctx);
    }
}

/// One health sweep over every slot.
pub(crate) fn sweep(ctx: &PoolContext) {
    let now_ms = wire::epoch_millis();
    let interval_ms = lock_or_recover(&ctx.config).health_check_interval_ms;
    let stale_cutoff_ms = 2 * interval_ms;

    let mut stale: Vec<(ConnectionId, mpsc::Sender<ActorCommand>)> = Vec::new();
    let mut dead: Vec<(ConnectionId, u64)> = Vec::new();

    let (total, connected) = {
        let mut connections = lock_or_recover(&ctx.connections);
        let total = connections.len();
        let mut connected = 0;
        for slot in connections.values_mut() {
            {
                let mut metrics = lock_or_recover(&slot.shared.metrics);
                metrics.start_interval();
                if slot.state == ConnectionState::Connected {
                    if let Some(connected_at) = slot.connected_at {
                        metrics.uptime_ms = connected_at.elapsed().as_millis() as u64;
                    }
                }
            }
            if slot.state != ConnectionState::Connected {
                continue;
            }
            connected += 1;

            if slot.actor.as_ref().is_some_and(|actor| actor.is_finished()) {
                warn!(connection = %slot.id, "Actor finished without a close signal");
                dead.push((slot.id.clone(), slot.epoch));
                continue;
            }

            let last = slot.shared.last_activity.load(Ordering::Relaxed);
            let idle_ms = now_ms.saturating_sub(last);
            if idle_ms > stale_cutoff_ms {
                debug!(connection = %slot.id, idle_ms, "Connection stale, probing with heartbeat");
                if let Some(commands) = slot.commands.clone() {
                    stale.push((slot.id.clone(), commands));
                }
            }
        }
        (total, connected)
    };

    // Probes go out after the map lock is released. A full command channel
    // just skips the probe; the next sweep retries.
    for (id, commands) in stale {
        let frame = wire::ping_frame(wire::epoch_millis());
        if commands
            .try_send(ActorCommand::Send { frame, reply: None })
            .is_err()
        {
            debug!(connection = %id, "Heartbeat skipped, command channel busy");
        }
    }

    for (id, epoch) in dead {
        on_transport_closed(ctx, id, epoch, false, "actor task terminated".to_string());
    }

    let queued = lock_or_recover(&ctx.queue).len();
    ctx.events.emit(PoolEvent::HealthCheckCompleted {
        connections: total,
        connected,
        queued,
    });
}
