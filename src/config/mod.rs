//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(std::io::Error),

    #[error("failed to write config: {0}")]
    Write(std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration for a tunnel node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(ConfigError::Write)
    }
}

/// Node identity and peering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Tunnel id; generated when empty
    #[serde(default)]
    pub id: String,
    /// Address to listen on
    pub address: String,
    /// Shared token for the overlay
    #[serde(default)]
    pub token: String,
    /// Peer node addresses
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            address: "0.0.0.0:9096".to_string(),
            token: String::new(),
            nodes: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut config = Config::default();
        config.node.address = "127.0.0.1:7000".to_string();
        config.node.nodes = vec!["10.0.0.2:9096".to_string()];

        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: Config = toml::from_str(&encoded).unwrap();

        assert_eq!(decoded.node.address, "127.0.0.1:7000");
        assert_eq!(decoded.node.nodes.len(), 1);
        assert_eq!(decoded.logging.level, "info");
    }

    #[test]
    fn test_defaults_from_minimal_file() {
        let decoded: Config = toml::from_str(
            r#"
            [node]
            address = "0.0.0.0:9000"

            [logging]
            level = "debug"
            format = "compact"
            "#,
        )
        .unwrap();

        assert!(decoded.node.id.is_empty());
        assert!(decoded.node.nodes.is_empty());
        assert_eq!(decoded.logging.level, "debug");
    }
}
