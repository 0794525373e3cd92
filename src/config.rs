//! Typed configuration record (spec §6). The core never reads a file
//! itself; `main.rs` is the thin external wrapper that does that and hands
//! a [`GatewayConfig`] to [`crate::run`].

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub id: String,
    pub port: String,
    pub baud: u32,
}

fn default_scan_period_s() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    pub port: String,
    pub baud: u32,
    pub slave_id: u8,
    #[serde(default = "default_scan_period_s")]
    pub scan_period_s: u32,
}

fn default_topic_prefix() -> String {
    "oi7500".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub console: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub networks: Vec<NetworkConfig>,
    pub modbus: ModbusConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub duration_hours: Option<u32>,
}

impl GatewayConfig {
    /// Structural validation the supervisor relies on before starting any
    /// task. Anything wrong here is a [`ConfigError`] and startup aborts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.networks.is_empty() {
            return Err(ConfigError::NoNetworks);
        }
        let mut seen = std::collections::HashSet::new();
        for net in &self.networks {
            if !seen.insert(net.id.as_str()) {
                return Err(ConfigError::DuplicateNetworkId(net.id.clone()));
            }
        }
        Ok(())
    }
}
