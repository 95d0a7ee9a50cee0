// Protocol defaults and controller configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::Device;

// Serial link to the USB-CAN adapter
pub const DEFAULT_BAUDRATE: u32 = 921_600;

// CAN id the controller uses as the host address
pub const DEFAULT_HOST_ID: u8 = 253;

// Time allowed for a motor to answer a request
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

// Wait between a parameter write and its read-back
pub const PARAM_SETTLE: Duration = Duration::from_millis(100);

// Window used to discard stale input before each write
pub const DRAIN_WINDOW: Duration = Duration::from_millis(1);

// Upper bound on one drain, for motors that never go quiet
pub const DRAIN_BUDGET: Duration = Duration::from_millis(20);

// Back-off when the link has nothing buffered yet
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Motor id {0} is listed more than once")]
    DuplicateDevice(u8),
}

/// Everything a controller needs to reach one bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_host_id")]
    pub host_id: u8,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Ping every device right after the port opens
    #[serde(default = "default_verify_on_connect")]
    pub verify_on_connect: bool,
    #[serde(default)]
    pub devices: Vec<Device>,
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_host_id() -> u8 {
    DEFAULT_HOST_ID
}

fn default_response_timeout_ms() -> u64 {
    RESPONSE_TIMEOUT.as_millis() as u64
}

fn default_settle_ms() -> u64 {
    PARAM_SETTLE.as_millis() as u64
}

fn default_verify_on_connect() -> bool {
    true
}

impl ControllerConfig {
    pub fn new(port: impl Into<String>, devices: Vec<Device>) -> Self {
        Self {
            port: port.into(),
            baudrate: DEFAULT_BAUDRATE,
            host_id: DEFAULT_HOST_ID,
            response_timeout_ms: default_response_timeout_ms(),
            settle_ms: default_settle_ms(),
            verify_on_connect: true,
            devices,
        }
    }

    /// Load a config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for device in &self.devices {
            if !seen.insert(device.id) {
                return Err(ConfigError::DuplicateDevice(device.id));
            }
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let config = ControllerConfig::from_json(r#"{"port": "/dev/ttyUSB0", "devices": [{"id": 1}]}"#)
            .unwrap();
        assert_eq!(config.baudrate, DEFAULT_BAUDRATE);
        assert_eq!(config.host_id, DEFAULT_HOST_ID);
        assert_eq!(config.response_timeout(), RESPONSE_TIMEOUT);
        assert_eq!(config.settle(), PARAM_SETTLE);
        assert!(config.verify_on_connect);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].offset, 0.0);
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let err = ControllerConfig::from_json(
            r#"{"port": "COM6", "devices": [{"id": 4}, {"id": 4}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDevice(4)));
    }
}
