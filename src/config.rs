//! Agent configuration.
//!
//! Built once at startup from a JSON file and passed by reference to each
//! component; nothing reads the environment at steady state.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// One meter the agent watches. `length_bytes` is the packed-BCD width the
/// EGM reports for this code; there is no usable default, so it is required.
#[derive(Debug, Clone, Deserialize)]
pub struct MeterListener {
    pub code: u8,
    pub length_bytes: u8,
    /// Cumulative meter: a decrease is reported as suspect.
    #[serde(default)]
    pub monotonic: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub com_port: String,
    #[serde(default = "defaults::baudrate")]
    pub baudrate: u32,
    /// SAS address of the EGM on this link (1..=127).
    pub address: u8,
    /// Wakeup marker; SAS fixes this at 128 (9th bit via parity).
    #[serde(default = "defaults::wakeup_bit")]
    pub wakeup_bit: u8,
    /// House asset number of this machine, stamped on meter rows.
    pub asset_number: u32,

    pub db_connection_string: String,
    #[serde(default = "defaults::db_driver")]
    pub db_driver: String,

    pub ws_server_url: String,
    pub api_key: String,

    pub listeners: Vec<MeterListener>,

    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::aft_poll_interval_ms")]
    pub aft_poll_interval_ms: u64,
    #[serde(default = "defaults::inter_byte_timeout_ms")]
    pub inter_byte_timeout_ms: u64,
    #[serde(default = "defaults::response_timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default = "defaults::journal_path")]
    pub journal_path: PathBuf,
    #[serde(default = "defaults::max_journal_bytes")]
    pub max_journal_bytes: u64,
    #[serde(default = "defaults::freshness_window_s")]
    pub freshness_window_s: u64,

    #[serde(default = "defaults::meter_table")]
    pub meter_table: String,
    #[serde(default = "defaults::aft_table")]
    pub aft_table: String,
    #[serde(default = "defaults::event_table")]
    pub event_table: String,
}

mod defaults {
    use std::path::PathBuf;

    pub fn baudrate() -> u32 {
        19200
    }
    pub fn wakeup_bit() -> u8 {
        128
    }
    pub fn db_driver() -> String {
        "postgres".to_string()
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn poll_interval_ms() -> u64 {
        40
    }
    pub fn aft_poll_interval_ms() -> u64 {
        500
    }
    pub fn inter_byte_timeout_ms() -> u64 {
        20
    }
    pub fn response_timeout_ms() -> u64 {
        200
    }
    pub fn journal_path() -> PathBuf {
        PathBuf::from("egm-agent.journal")
    }
    pub fn max_journal_bytes() -> u64 {
        16 * 1024 * 1024
    }
    pub fn freshness_window_s() -> u64 {
        30
    }
    pub fn meter_table() -> String {
        "meter_changes".to_string()
    }
    pub fn aft_table() -> String {
        "aft_results".to_string()
    }
    pub fn event_table() -> String {
        "egm_events".to_string()
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("cannot read {}: {e}", path.display())))?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|e| ConfigError(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=127).contains(&self.address) {
            return Err(ConfigError(format!("address {} outside 1..=127", self.address)));
        }
        if self.wakeup_bit != 128 {
            return Err(ConfigError(format!("wakeup_bit must be 128, got {}", self.wakeup_bit)));
        }
        if self.baudrate == 0 {
            return Err(ConfigError("baudrate must be non-zero".into()));
        }
        if self.db_driver != "postgres" {
            return Err(ConfigError(format!("unsupported db_driver {:?}", self.db_driver)));
        }
        if self.listeners.is_empty() {
            return Err(ConfigError("at least one meter listener is required".into()));
        }
        for listener in &self.listeners {
            if !(1..=8).contains(&listener.length_bytes) {
                return Err(ConfigError(format!(
                    "meter {:#04x}: length_bytes {} outside 1..=8",
                    listener.code, listener.length_bytes
                )));
            }
        }
        if self.max_journal_bytes == 0 {
            return Err(ConfigError("max_journal_bytes must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "com_port": "/dev/ttyUSB0",
            "address": 1,
            "asset_number": 10,
            "db_connection_string": "postgres://agent@localhost/agent",
            "ws_server_url": "wss://backend.example/agent",
            "api_key": "secret",
            "listeners": [{ "code": 0x11, "length_bytes": 5, "monotonic": true }]
        })
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_json::from_value(minimal_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.baudrate, 19200);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.aft_poll_interval_ms, 500);
        assert_eq!(config.freshness_window_s, 30);
        assert_eq!(config.meter_table, "meter_changes");
    }

    #[test]
    fn zero_address_rejected() {
        let mut raw = minimal_json();
        raw["address"] = serde_json::json!(0);
        let config: Config = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn listener_without_length_rejected() {
        let mut raw = minimal_json();
        raw["listeners"] = serde_json::json!([{ "code": 17 }]);
        assert!(serde_json::from_value::<Config>(raw).is_err());
    }
}
