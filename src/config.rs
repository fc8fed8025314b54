//! Pool and reconnection configuration.

use serde::Deserialize;

use crate::balancer::LoadBalancingStrategy;
use crate::error::{ConfigError, Result};

/// Connection pool configuration.
///
/// All fields have defaults, so a TOML fragment only needs to name the
/// settings it overrides. Replaceable at runtime via
/// [`ConnectionPool::update_config`](crate::pool::ConnectionPool::update_config).
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Transport handshake timeout (milliseconds).
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Maximum reconnection attempts before a connection is declared failed.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Base delay before the first reconnection attempt (milliseconds).
    /// Attempt `n` waits `reconnect_delay_ms * 2^(n-1)`.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Ceiling on the backoff delay (milliseconds).
    #[serde(default = "default_reconnect_delay_max_ms")]
    pub reconnect_delay_max_ms: u64,
    /// Health check sweep interval (milliseconds).
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Strategy used to pick a connection for each outbound message.
    #[serde(default = "default_load_balancing_strategy")]
    pub load_balancing_strategy: LoadBalancingStrategy,
    /// Whether unexpected closes trigger supervised reconnection.
    #[serde(default = "default_enable_failover")]
    pub enable_failover: bool,
    /// Hint for transport factories that support per-message compression.
    #[serde(default = "default_compression_enabled")]
    pub compression_enabled: bool,
}

const fn default_max_connections() -> usize {
    3
}

const fn default_connection_timeout_ms() -> u64 {
    10_000
}

const fn default_max_reconnect_attempts() -> u32 {
    5
}

const fn default_reconnect_delay_ms() -> u64 {
    1000
}

const fn default_reconnect_delay_max_ms() -> u64 {
    60_000
}

const fn default_health_check_interval_ms() -> u64 {
    30_000
}

const fn default_load_balancing_strategy() -> LoadBalancingStrategy {
    LoadBalancingStrategy::LeastLatency
}

const fn default_enable_failover() -> bool {
    true
}

const fn default_compression_enabled() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_delay_max_ms: default_reconnect_delay_max_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            load_balancing_strategy: default_load_balancing_strategy(),
            enable_failover: default_enable_failover(),
            compression_enabled: default_compression_enabled(),
        }
    }
}

impl PoolConfig {
    /// Parse a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the TOML is malformed or a field
    /// has the wrong type.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(ConfigError::Parse)?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReadFile`] when the file cannot be read and
    /// [`ConfigError::Parse`] when its contents are malformed.
    pub fn from_toml_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::from_toml_str(&raw)
    }

    /// Validate configuration values.
    pub(crate) fn validate(&self) -> Result<()> {
        let invalid = |field: &'static str, reason: &str| -> crate::error::Error {
            ConfigError::InvalidValue {
                field,
                reason: reason.to_string(),
            }
            .into()
        };

        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be > 0"));
        }
        if self.connection_timeout_ms == 0 {
            return Err(invalid("connection_timeout_ms", "must be > 0"));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(invalid("reconnect_delay_ms", "must be > 0"));
        }
        if self.reconnect_delay_max_ms < self.reconnect_delay_ms {
            return Err(invalid(
                "reconnect_delay_max_ms",
                "must be >= reconnect_delay_ms",
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(invalid("health_check_interval_ms", "must be > 0"));
        }
        Ok(())
    }

    /// Merge a partial update into this configuration.
    pub fn apply(&mut self, update: &PoolConfigUpdate) {
        if let Some(max_connections) = update.max_connections {
            self.max_connections = max_connections;
        }
        if let Some(connection_timeout_ms) = update.connection_timeout_ms {
            self.connection_timeout_ms = connection_timeout_ms;
        }
        if let Some(max_reconnect_attempts) = update.max_reconnect_attempts {
            self.max_reconnect_attempts = max_reconnect_attempts;
        }
        if let Some(reconnect_delay_ms) = update.reconnect_delay_ms {
            self.reconnect_delay_ms = reconnect_delay_ms;
        }
        if let Some(reconnect_delay_max_ms) = update.reconnect_delay_max_ms {
            self.reconnect_delay_max_ms = reconnect_delay_max_ms;
        }
        if let Some(health_check_interval_ms) = update.health_check_interval_ms {
            self.health_check_interval_ms = health_check_interval_ms;
        }
        if let Some(load_balancing_strategy) = update.load_balancing_strategy {
            self.load_balancing_strategy = load_balancing_strategy;
        }
        if let Some(enable_failover) = update.enable_failover {
            self.enable_failover = enable_failover;
        }
        if let Some(compression_enabled) = update.compression_enabled {
            self.compression_enabled = compression_enabled;
        }
    }
}

/// Partial configuration for runtime updates; `None` fields keep their
/// current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolConfigUpdate {
    pub max_connections: Option<usize>,
    pub connection_timeout_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
    pub reconnect_delay_max_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub load_balancing_strategy: Option<LoadBalancingStrategy>,
    pub enable_failover: Option<bool>,
    pub compression_enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.connection_timeout_ms, 10_000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay_ms, 1000);
        assert_eq!(config.health_check_interval_ms, 30_000);
        assert_eq!(
            config.load_balancing_strategy,
            LoadBalancingStrategy::LeastLatency
        );
        assert!(config.enable_failover);
        assert!(config.compression_enabled);
    }

    #[test]
    fn parses_partial_toml_with_kebab_case_strategy() {
        let config = PoolConfig::from_toml_str(
            r#"
            max_connections = 5
            load_balancing_strategy = "round-robin"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(
            config.load_balancing_strategy,
            LoadBalancingStrategy::RoundRobin
        );
        // untouched fields fall back to defaults
        assert_eq!(config.reconnect_delay_ms, 1000);
    }

    #[test]
    fn rejects_unknown_strategy() {
        assert!(PoolConfig::from_toml_str(r#"load_balancing_strategy = "fastest""#).is_err());
    }

    #[test]
    fn validate_rejects_zero_max_connections() {
        let config = PoolConfig {
            max_connections: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_cap_below_base_delay() {
        let config = PoolConfig {
            reconnect_delay_ms: 5000,
            reconnect_delay_max_ms: 1000,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn apply_merges_only_set_fields() {
        let mut config = PoolConfig::default();
        config.apply(&PoolConfigUpdate {
            max_connections: Some(7),
            load_balancing_strategy: Some(LoadBalancingStrategy::LeastLoad),
            ..PoolConfigUpdate::default()
        });
        assert_eq!(config.max_connections, 7);
        assert_eq!(
            config.load_balancing_strategy,
            LoadBalancingStrategy::LeastLoad
        );
        assert_eq!(config.connection_timeout_ms, 10_000);
    }
}
