//! Configuration management for the STUN relay agent

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Prefix of every environment variable read by [`RelayConfig::from_env`]
pub const ENV_PREFIX: &str = "STUN_RELAY";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Console,
    Json,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Interface used by OPEN_CONN when none is given
    pub default_iface: String,
    /// Port range spec used by OPEN_CONN when none is given
    pub default_ports: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Per-transport datagram buffer
    pub recv_buffer_size: usize,
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        let config: RelayConfig = Config::builder()
            .set_default("default_iface", "0.0.0.0")?
            .set_default("default_ports", "0")?
            .set_default("log_level", "info")?
            .set_default("log_format", "console")?
            .set_default("recv_buffer_size", 65536)?
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        if config.recv_buffer_size == 0 {
            return Err(ConfigError::Message(
                "recv_buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}
