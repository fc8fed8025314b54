//! Wirepool - resilient realtime transport pool.
//!
//! This crate maintains a pool of persistent bidirectional connections to a
//! backend, routes outbound messages across them with pluggable
//! load-balancing strategies, recovers from failures via supervised
//! reconnection with exponential backoff, monitors connection health, and
//! buffers outbound traffic while no connection is available.
//!
//! # Architecture
//!
//! Each connection runs as a separate tokio task (an "actor") that owns its
//! transport, services send commands, and forwards inbound frames into the
//! pool's metrics and event stream. The [`pool::ConnectionPool`] façade owns
//! the map of connection slots and wires the pieces together:
//!
//! - **`balancer`** - Strategy-based selection over the connected subset
//!   (round-robin, least-latency, least-load)
//! - **`queue`** - Bounded, priority-ordered buffer for messages that cannot
//!   be sent immediately
//! - **`pool::supervisor`** - Lifecycle transitions and backoff-scheduled
//!   reconnection, guarded against stale timers by per-slot generations
//! - **`pool::health`** - Periodic sweep that ages out idle connections and
//!   probes them with heartbeat frames
//! - **`network`** - External reachability signal toggling send-vs-queue
//!   behavior
//!
//! Transports are pluggable through the [`transport::Transport`] trait; a
//! WebSocket implementation over `tokio-tungstenite` ships behind the
//! `websocket` feature (enabled by default).
//!
//! # Example
//!
//! ```no_run
//! use wirepool::pool::ConnectionPool;
//! use wirepool::transport::ws::websocket_factory;
//! use serde_json::json;
//!
//! # async fn run() -> wirepool::Result<()> {
//! let pool = ConnectionPool::with_defaults(websocket_factory())?;
//! pool.add_connection("primary", "wss://realtime.example.com/socket").await?;
//! pool.send(json!({ "type": "chat", "body": "hello" }), 5).await;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod metrics;
pub mod network;
pub mod pool;
pub mod queue;
mod reconnect;
pub mod transport;
pub mod wire;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use balancer::LoadBalancingStrategy;
pub use config::{PoolConfig, PoolConfigUpdate};
pub use error::{ConfigError, Error, Result};
pub use event::{EventStream, PoolEvent};
pub use id::ConnectionId;
pub use metrics::ConnectionMetrics;
pub use pool::{ConnectionInfo, ConnectionPool, ConnectionState, PoolStats, SendOutcome};
pub use queue::{QueuedMessage, MAX_QUEUED_MESSAGES};
pub use transport::{Transport, TransportEvent, TransportFactory};
