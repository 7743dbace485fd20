//! Runtime configuration for the `obd2-cli` binary.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::info;
use serde::Deserialize;

/// Settings loaded from `config.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub adapter: AdapterConfig,
}

/// The `[adapter]` table: how to reach the ELM327 dongle.
#[derive(Debug, Deserialize)]
pub struct AdapterConfig {
    /// BLE device address.
    pub address: Option<String>,
    /// GATT service to use instead of auto-discovery.
    pub service_uuid: Option<String>,
    pub notify_uuid: Option<String>,
    pub write_uuid: Option<String>,
    /// Serial port path, when the adapter is wired instead of BLE.
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl AdapterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            address: None,
            service_uuid: None,
            notify_uuid: None,
            write_uuid: None,
            port: None,
            baud_rate: default_baud_rate(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_timeout_secs() -> u64 {
    10
}

/// Load `config.toml` from the working directory, falling back to the
/// packaged defaults.
pub fn load_config() -> Result<Config> {
    let config_path = "config.toml";

    let config_content = if Path::new(config_path).exists() {
        fs::read_to_string(config_path)?
    } else {
        include_str!("../config.toml").to_string()
    };

    let config: Config = toml::from_str(&config_content)?;
    info!("Loaded adapter configuration");

    Ok(config)
}
