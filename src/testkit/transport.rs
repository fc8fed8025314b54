//! Mock [`Transport`] implementations for testing.
//!
//! Two mock transport types for different testing needs:
//!
//! - [`ScriptedTransport`] — Pre-loaded connect/send results and events.
//!   Best for: handshake failures, reconnection logic, retry ceilings.
//!
//! - [`ChannelTransport`] — Externally controlled through a
//!   [`ChannelTransportHandle`]: push frames, force send failures, close
//!   cleanly or uncleanly, all on demand. Best for: end-to-end pool tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent};

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

/// A mock transport with scripted connect/send results and a fixed event
/// queue.
///
/// Each `connect()`/`send()` pops the next result from the corresponding
/// queue (defaulting to `Ok(())` when exhausted). Events are delivered once;
/// an explicit `None` entry ends the stream, while an exhausted queue blocks
/// forever (a quiet but live connection).
pub struct ScriptedTransport {
    connect_results: VecDeque<Result<()>>,
    connect_delay: Option<Duration>,
    send_results: VecDeque<Result<()>>,
    events: VecDeque<Option<TransportEvent>>,
    connect_count: Arc<AtomicU32>,
    send_count: Arc<AtomicU32>,
    sent_frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            connect_results: VecDeque::new(),
            connect_delay: None,
            send_results: VecDeque::new(),
            events: VecDeque::new(),
            connect_count: Arc::new(AtomicU32::new(0)),
            send_count: Arc::new(AtomicU32::new(0)),
            sent_frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_connect_results(mut self, results: Vec<Result<()>>) -> Self {
        self.connect_results = results.into();
        self
    }

    /// Delay every `connect()` call, for handshake-timeout tests.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn with_send_results(mut self, results: Vec<Result<()>>) -> Self {
        self.send_results = results.into();
        self
    }

    pub fn with_events(mut self, events: Vec<Option<TransportEvent>>) -> Self {
        self.events = events.into();
        self
    }

    /// Replace the connect counter with a shared one.
    ///
    /// Useful when a factory creates multiple transports that should share a
    /// single counter (e.g. counting total reconnection attempts).
    pub fn set_connect_count(&mut self, counter: Arc<AtomicU32>) {
        self.connect_count = counter;
    }

    /// Shared counters for asserting connect/send call counts.
    pub fn counts(&self) -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        (self.connect_count.clone(), self.send_count.clone())
    }

    /// Shared recorder of every frame passed to `send`.
    pub fn frames(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.sent_frames.clone()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.connect_results.pop_front().unwrap_or(Ok(()))
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        let result = self.send_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.sent_frames.lock().unwrap().push(frame);
        }
        result
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        match self.events.pop_front() {
            Some(Some(event)) => Some(event),
            Some(None) => None,
            // Script exhausted: stay quiet but alive.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

/// A mock transport controlled externally via a [`ChannelTransportHandle`].
///
/// Events are pushed through the handle and read by the pool's actor via
/// `next_event()`. No real network I/O.
pub struct ChannelTransport {
    event_rx: mpsc::UnboundedReceiver<Option<TransportEvent>>,
    connect_count: Arc<AtomicU32>,
    send_count: Arc<AtomicU32>,
    close_count: Arc<AtomicU32>,
    fail_sends: Arc<AtomicBool>,
    sent_frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// Control handle for a [`ChannelTransport`].
#[derive(Clone)]
pub struct ChannelTransportHandle {
    event_tx: mpsc::UnboundedSender<Option<TransportEvent>>,
    connect_count: Arc<AtomicU32>,
    send_count: Arc<AtomicU32>,
    close_count: Arc<AtomicU32>,
    fail_sends: Arc<AtomicBool>,
    sent_frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ChannelTransportHandle {
    /// Deliver an inbound JSON frame.
    pub fn frame(&self, payload: Value) {
        let bytes = serde_json::to_vec(&payload).unwrap();
        let _ = self.event_tx.send(Some(TransportEvent::Frame(bytes)));
    }

    /// Deliver a raw inbound frame.
    pub fn frame_bytes(&self, bytes: Vec<u8>) {
        let _ = self.event_tx.send(Some(TransportEvent::Frame(bytes)));
    }

    /// Deliver a close event.
    pub fn close(&self, clean: bool, reason: &str) {
        let _ = self.event_tx.send(Some(TransportEvent::Closed {
            clean,
            reason: reason.to_string(),
        }));
    }

    /// Deliver a transport error event.
    pub fn error(&self, error: &str) {
        let _ = self.event_tx.send(Some(TransportEvent::Error(
            error.to_string(),
        )));
    }

    /// End the event stream (an abrupt transport death).
    pub fn end(&self) {
        let _ = self.event_tx.send(None);
    }

    /// Make subsequent `send` calls fail (or succeed again).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Every frame passed to `send` so far.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent_frames.lock().unwrap().clone()
    }

    /// Sent frames decoded as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_slice(frame).ok())
            .collect()
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> u32 {
        self.send_count.load(Ordering::SeqCst)
    }

    /// How many times the pool closed the transport cleanly.
    pub fn close_count(&self) -> u32 {
        self.close_count.load(Ordering::SeqCst)
    }
}

/// Create a [`ChannelTransport`] and its control [`ChannelTransportHandle`].
pub fn channel_transport() -> (ChannelTransport, ChannelTransportHandle) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let connect_count = Arc::new(AtomicU32::new(0));
    let send_count = Arc::new(AtomicU32::new(0));
    let close_count = Arc::new(AtomicU32::new(0));
    let fail_sends = Arc::new(AtomicBool::new(false));
    let sent_frames = Arc::new(Mutex::new(Vec::new()));
    (
        ChannelTransport {
            event_rx,
            connect_count: connect_count.clone(),
            send_count: send_count.clone(),
            close_count: close_count.clone(),
            fail_sends: fail_sends.clone(),
            sent_frames: sent_frames.clone(),
        },
        ChannelTransportHandle {
            event_tx,
            connect_count,
            send_count,
            close_count,
            fail_sends,
            sent_frames,
        },
    )
}

/// Factory that records a [`ChannelTransportHandle`] per created transport,
/// for inspection. The endpoint URL passed by the pool is ignored.
pub fn tracked_factory() -> (
    crate::transport::TransportFactory,
    Arc<Mutex<Vec<ChannelTransportHandle>>>,
) {
    let handles: Arc<Mutex<Vec<ChannelTransportHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = handles.clone();
    let factory: crate::transport::TransportFactory = Arc::new(move |_url| {
        let (transport, handle) = channel_transport();
        recorded.lock().unwrap().push(handle);
        Box::new(transport)
    });
    (factory, handles)
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("scripted send failure".to_string()));
        }
        self.sent_frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        match self.event_rx.recv().await {
            Some(Some(event)) => Some(event),
            Some(None) | None => None,
        }
    }

    async fn close(&mut self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}
