//! Transport abstraction for the connection pool.
//!
//! The pool is transport-agnostic: anything that can open a duplex
//! message-oriented channel, push frames, and report close/error conditions
//! can back a pooled connection. Implementations handle framing and protocol
//! details; the pool treats frames as opaque bytes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

#[cfg(feature = "websocket")]
pub mod ws;

/// Events surfaced by a transport to its owning connection actor.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound message frame.
    Frame(Vec<u8>),
    /// The peer (or the local stack) closed the channel.
    ///
    /// `clean` is true for a normal/intentional shutdown; an unclean close
    /// makes the connection eligible for failover.
    Closed { clean: bool, reason: String },
    /// A transport-level error that did not by itself close the channel.
    Error(String),
}

/// A duplex, message-oriented channel to the backend.
#[async_trait]
pub trait Transport: Send {
    /// Perform the handshake. Must be called before `send`/`next_event`.
    async fn connect(&mut self) -> Result<()>;

    /// Transmit one frame.
    ///
    /// # Errors
    ///
    /// Fails when the channel is not open or the write fails; the caller
    /// queues the message rather than surfacing the error.
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Receive the next transport event.
    ///
    /// Blocks until an event is available. Returns `None` once the
    /// underlying stream has ended; the pool treats that as an unclean
    /// close.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Best-effort clean close. Errors are swallowed; the transport is
    /// unusable afterwards.
    async fn close(&mut self);
}

/// Factory producing a fresh transport for an endpoint URL.
///
/// Used by the pool to open initial connections and to recreate failed ones
/// during reconnection.
pub type TransportFactory = Arc<dyn Fn(&str) -> Box<dyn Transport> + Send + Sync>;
