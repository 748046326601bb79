//! Fabric configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and identity of one fabric instance. All durations are in
/// milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Unique per process; generated when not configured.
    pub server_id: String,
    pub host: String,
    pub port: u16,
    /// How often the heartbeat refreshes this server's liveness.
    pub heartbeat_interval_ms: u64,
    /// A server whose last heartbeat is older than this is dead. Its
    /// registry hash expires after three times this.
    pub heartbeat_ttl_ms: u64,
    /// Connections idle longer than this are swept.
    pub stale_connection_ms: u64,
    pub cleanup_interval_ms: u64,
    pub failure_check_interval_ms: u64,
    /// TTL of connection hashes.
    pub connection_ttl_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            server_id: causeway_core::new_id(),
            host: "127.0.0.1".to_string(),
            port: 0,
            heartbeat_interval_ms: 10_000,
            heartbeat_ttl_ms: 30_000,
            stale_connection_ms: 300_000,
            cleanup_interval_ms: 60_000,
            failure_check_interval_ms: 30_000,
            connection_ttl_ms: 3_600_000,
        }
    }
}

impl FabricConfig {
    pub fn server_ttl_ms(&self) -> u64 {
        self.heartbeat_ttl_ms.saturating_mul(3)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    pub fn failure_check_interval(&self) -> Duration {
        Duration::from_millis(self.failure_check_interval_ms.max(1))
    }
}

/// Builder for fabric configuration.
pub struct FabricConfigBuilder {
    config: FabricConfig,
}

impl FabricConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FabricConfig::default(),
        }
    }

    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.config.server_id = id.into();
        self
    }

    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    pub fn heartbeat_ttl_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat_ttl_ms = ms;
        self
    }

    pub fn stale_connection_ms(mut self, ms: u64) -> Self {
        self.config.stale_connection_ms = ms;
        self
    }

    pub fn cleanup_interval_ms(mut self, ms: u64) -> Self {
        self.config.cleanup_interval_ms = ms;
        self
    }

    pub fn failure_check_interval_ms(mut self, ms: u64) -> Self {
        self.config.failure_check_interval_ms = ms;
        self
    }

    pub fn connection_ttl_ms(mut self, ms: u64) -> Self {
        self.config.connection_ttl_ms = ms;
        self
    }

    pub fn build(self) -> FabricConfig {
        self.config
    }
}

impl Default for FabricConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
