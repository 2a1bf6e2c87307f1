//! Bridge configuration
//!
//! Loads server and close-handshake settings from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::close::{ClosingTimeout, DEFAULT_CLOSING_TIMEOUT_SECS};

/// Configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "closing-bridge.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum number of simultaneous connections
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
            max_connections: 1024,
        }
    }
}

/// WebSocket close-handshake settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebSocketSection {
    /// Seconds to wait for the peer to finish closing.
    /// Negative waits forever, zero closes at once.
    pub closing_timeout: i64,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            closing_timeout: DEFAULT_CLOSING_TIMEOUT_SECS,
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerSection,
    pub websocket: WebSocketSection,
}

impl BridgeConfig {
    /// Load configuration from a file, falling back to defaults if it is missing
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but make no sense
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be at least 1".to_string(),
            ));
        }
        if self.server.bind.is_empty() {
            return Err(ConfigError::Invalid(
                "server.bind cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Closing timeout policy derived from the configured seconds
    pub fn closing_timeout(&self) -> ClosingTimeout {
        ClosingTimeout::from_secs(self.websocket.closing_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(
            config.closing_timeout(),
            ClosingTimeout::After(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let config = BridgeConfig::load(&temp.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_load_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0"
port = 8080

[websocket]
closing_timeout = -1
"#,
        )
        .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        // Unset fields keep their defaults
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.closing_timeout(), ClosingTimeout::Disabled);
    }

    #[test]
    fn test_zero_timeout_is_immediate() {
        let config = BridgeConfig::parse("[websocket]\nclosing_timeout = 0\n").unwrap();
        assert_eq!(config.closing_timeout(), ClosingTimeout::Immediate);
    }

    #[test]
    fn test_invalid_toml() {
        let result = BridgeConfig::parse("[server\nport = 1");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let result = BridgeConfig::parse("[server]\nmax_connections = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
