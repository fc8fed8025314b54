//! WebSocket transport over `tokio-tungstenite`.
//!
//! The default transport shipped with the crate. Text and binary frames are
//! both surfaced as opaque bytes; close codes 1000 (normal) and 1001 (going
//! away) count as clean closes and do not trigger failover.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent, TransportFactory};

/// A pooled WebSocket connection endpoint.
pub struct WebSocketTransport {
    url: String,
    socket: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WebSocketTransport {
    /// Create a transport for `url`. The endpoint is validated and dialed on
    /// [`connect`](Transport::connect), not here.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: None,
        }
    }
}

/// Factory wiring [`WebSocketTransport`] into a pool.
pub fn websocket_factory() -> TransportFactory {
    Arc::new(|url| Box::new(WebSocketTransport::new(url)))
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> Result<()> {
        let url = Url::parse(&self.url)?;
        let (socket, _response) = connect_async(url.as_str()).await?;
        debug!(url = %self.url, "WebSocket handshake complete");
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| Error::Transport("socket not open".to_string()))?;
        // JSON envelopes go out as text frames; anything else as binary.
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(raw) => Message::Binary(raw.into_bytes()),
        };
        socket.send(message).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        let socket = self.socket.as_mut()?;
        let event = loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    break Some(TransportEvent::Frame(text.into_bytes()))
                }
                Some(Ok(Message::Binary(bytes))) => break Some(TransportEvent::Frame(bytes)),
                Some(Ok(Message::Close(frame))) => {
                    let (clean, reason) = match frame {
                        Some(frame) => (
                            matches!(frame.code, CloseCode::Normal | CloseCode::Away),
                            frame.reason.to_string(),
                        ),
                        None => (false, String::new()),
                    };
                    break Some(TransportEvent::Closed { clean, reason });
                }
                // Control frames keep the connection alive but carry no payload.
                Some(Ok(_)) => continue,
                Some(Err(error)) => break Some(TransportEvent::Error(error.to_string())),
                None => break None,
            }
        };
        if !matches!(event, Some(TransportEvent::Frame(_))) {
            self.socket = None;
        }
        event
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }
}
