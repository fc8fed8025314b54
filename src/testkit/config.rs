//! Canonical test configurations.
//!
//! Single source of truth for config structs used across tests.
//! Avoids each test module defining its own slightly-different defaults.

use crate::balancer::LoadBalancingStrategy;
use crate::config::PoolConfig;

/// Fast pool config: millisecond backoff, generous capacity, and a health
/// interval long enough that sweeps never fire unless a test runs them
/// directly. Override individual fields for timing-specific tests.
pub fn pool() -> PoolConfig {
    PoolConfig {
        max_connections: 8,
        connection_timeout_ms: 1000,
        max_reconnect_attempts: 3,
        reconnect_delay_ms: 1,
        reconnect_delay_max_ms: 16,
        health_check_interval_ms: 60_000,
        load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
        enable_failover: true,
        compression_enabled: false,
    }
}
