//! Process configuration, loaded from TOML.
//!
//! Every section is optional; missing keys take their defaults.
//!
//! ```toml
//! [engine]
//! compression_threshold = 512
//!
//! [state]
//! writer_id = "server-a"
//! merge_strategy = "LAST_WRITE_WINS"
//!
//! [fabric]
//! heartbeat_interval_ms = 5000
//!
//! [simulation]
//! servers = 3
//! ```

use causeway_delta::SyncEngineConfig;
use causeway_fabric::FabricConfig;
use causeway_state::StateConfig;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CausewayConfig {
    pub engine: SyncEngineConfig,
    pub state: StateConfig,
    pub fabric: FabricConfig,
    pub simulation: SimulationConfig,
}

/// Shape of the replication run started by the binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub servers: usize,
    pub clients_per_server: usize,
    pub edits_per_server: usize,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
    /// How long to wait for replication before giving up.
    pub settle_timeout_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            servers: 2,
            clients_per_server: 2,
            edits_per_server: 25,
            seed: None,
            settle_timeout_ms: 5_000,
        }
    }
}

impl CausewayConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: CausewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation.servers == 0 {
            return Err(ConfigError::Invalid("simulation.servers must be at least 1".into()));
        }
        if self.fabric.heartbeat_ttl_ms < self.fabric.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "fabric.heartbeat_ttl_ms must not be shorter than heartbeat_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_state::MergeStrategy;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CausewayConfig::parse("").unwrap();
        assert_eq!(config.simulation.servers, 2);
        assert_eq!(config.engine.compression_threshold, 1024);
        assert_eq!(config.fabric.heartbeat_ttl_ms, 30_000);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = CausewayConfig::parse(
            r#"
            [state]
            writer_id = "a"
            merge_strategy = "LAST_WRITE_WINS"

            [fabric]
            server_id = "s1"
            heartbeat_interval_ms = 100
            heartbeat_ttl_ms = 300

            [simulation]
            servers = 4
            seed = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.state.writer_id, "a");
        assert_eq!(config.state.merge_strategy, MergeStrategy::LastWriteWins);
        assert_eq!(config.fabric.server_id, "s1");
        assert_eq!(config.simulation.servers, 4);
        assert_eq!(config.simulation.seed, Some(7));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            CausewayConfig::parse("[simulation]\nservers = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CausewayConfig::parse("[fabric]\nheartbeat_interval_ms = 10\nheartbeat_ttl_ms = 5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CausewayConfig::parse("[simulation\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
