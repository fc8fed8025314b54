//! Per-connection actor task.
//!
//! Each connection runs as a tokio task that exclusively owns its transport.
//! The actor services send commands from the pool, forwards inbound frames
//! into metrics and the event bus, and reports lifecycle transitions to the
//! supervisor. State transitions themselves happen in the supervisor under
//! the pool lock, so transitions for one id are always linearized.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::{EventBus, PoolEvent};
use crate::id::ConnectionId;
use crate::transport::{Transport, TransportEvent};
use crate::wire;

use super::slot::{lock_or_recover, ActorCommand, SlotShared};
use super::supervisor::{Signal, SignalKind};

/// Spawn the run loop for a connected transport.
pub(crate) fn spawn_actor(
    id: ConnectionId,
    epoch: u64,
    transport: Box<dyn Transport>,
    shared: Arc<SlotShared>,
    events: EventBus,
    signals: mpsc::UnboundedSender<Signal>,
    commands: mpsc::Receiver<ActorCommand>,
) -> JoinHandle<()> {
    tokio::spawn(run_actor(
        id, epoch, transport, shared, events, signals, commands,
    ))
}

async fn run_actor(
    id: ConnectionId,
    epoch: u64,
    mut transport: Box<dyn Transport>,
    shared: Arc<SlotShared>,
    events: EventBus,
    signals: mpsc::UnboundedSender<Signal>,
    mut commands: mpsc::Receiver<ActorCommand>,
) {
    debug!(connection = %id, epoch, "Connection actor started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ActorCommand::Send { frame, reply }) => {
                    let frame_len = frame.len();
                    let result = transport.send(frame).await;
                    if result.is_ok() {
                        shared.touch();
                        lock_or_recover(&shared.metrics).record_frame(frame_len);
                    }
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(error) = result {
                                debug!(connection = %id, %error, "Fire-and-forget send failed");
                            }
                        }
                    }
                }
                // A closed command channel means the slot was retired.
                Some(ActorCommand::Close) | None => {
                    transport.close().await;
                    debug!(connection = %id, "Connection actor closed");
                    return;
                }
            },
            event = transport.next_event() => match event {
                Some(TransportEvent::Frame(frame)) => {
                    shared.touch();
                    {
                        let mut metrics = lock_or_recover(&shared.metrics);
                        metrics.record_frame(frame.len());
                        if let Some(sent_at) = wire::frame_timestamp(&frame) {
                            let sample = wire::epoch_millis().saturating_sub(sent_at);
                            metrics.record_latency(sample as f64);
                        }
                    }
                    match wire::decode_frame(&frame) {
                        Some(payload) => events.emit(PoolEvent::Message {
                            id: id.clone(),
                            payload,
                        }),
                        None => {
                            debug!(connection = %id, bytes = frame.len(), "Discarding non-JSON inbound frame");
                        }
                    }
                }
                Some(TransportEvent::Error(error)) => {
                    // Errors do not close the channel by themselves; a close,
                    // if the transport follows up with one, arrives separately.
                    warn!(connection = %id, %error, "Transport error");
                    let _ = signals.send(Signal {
                        id: id.clone(),
                        epoch,
                        kind: SignalKind::Errored { error },
                    });
                }
                Some(TransportEvent::Closed { clean, reason }) => {
                    let _ = signals.send(Signal {
                        id: id.clone(),
                        epoch,
                        kind: SignalKind::Closed { clean, reason },
                    });
                    return;
                }
                None => {
                    let _ = signals.send(Signal {
                        id: id.clone(),
                        epoch,
                        kind: SignalKind::Closed {
                            clean: false,
                            reason: "transport stream ended".to_string(),
                        },
                    });
                    return;
                }
            },
        }
    }
}
