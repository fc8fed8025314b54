//! Identifier types with proper encapsulation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection identifier - newtype for type safety.
///
/// The inner String is private to ensure all construction goes through
/// the defined constructors. Identifiers are unique within a pool and
/// survive reconnection: a replaced connection keeps its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new `ConnectionId` from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the connection ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
