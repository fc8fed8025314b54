use thiserror::Error;

use crate::id::ConnectionId;

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection pool full: limit of {max} reached")]
    PoolExhausted { max: usize },

    #[error("connection '{0}' already exists in the pool")]
    DuplicateConnection(ConnectionId),

    #[error("no connection '{0}' in the pool")]
    UnknownConnection(ConnectionId),

    #[error("connection '{0}' is not connected")]
    NotConnected(ConnectionId),

    #[error("no connected transport available")]
    NoConnectionAvailable,

    #[error("connection attempt timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pool is shut down")]
    Shutdown,

    #[cfg(feature = "websocket")]
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[cfg(feature = "websocket")]
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "websocket")]
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(err))
    }
}
