//! Link configuration
//!
//! Every field has a default matching the deployed watch/phone pair, so a
//! JSON file only needs the values it wants to change.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ble::gatt::{
    ATT_OVERHEAD, DEFAULT_MTU, SESSION_CHAR_UUID, SLEEP_SERVICE_UUID, TARGET_MTU,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// How long a scan may run without a matching advertisement.
    pub scan_timeout_ms: u64,
    /// How long link establishment plus service discovery may take.
    pub connect_timeout_ms: u64,
    /// Delay before an automatic reconnect scan.
    pub reconnect_delay_ms: u64,
    /// Delay before re-writing a chunk that failed or could not be issued.
    pub write_retry_delay_ms: u64,
    /// How long a queued payload waits for an MTU exchange outcome.
    pub mtu_settle_timeout_ms: u64,
    pub default_mtu: u16,
    pub target_mtu: u16,
    /// Retries of a single chunk before the transfer fails. `None` retries forever.
    pub max_write_retries: Option<u32>,
    /// Automatic reconnects before giving up. `None` reconnects forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Largest message the receiver will buffer for one peer.
    pub max_message_bytes: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: SLEEP_SERVICE_UUID,
            characteristic_uuid: SESSION_CHAR_UUID,
            scan_timeout_ms: 15_000,
            connect_timeout_ms: 15_000,
            reconnect_delay_ms: 5_000,
            write_retry_delay_ms: 100,
            mtu_settle_timeout_ms: 2_000,
            default_mtu: DEFAULT_MTU,
            target_mtu: TARGET_MTU,
            max_write_retries: Some(30),
            max_reconnect_attempts: Some(10),
            max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

impl LinkConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        let config: LinkConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_mtu <= ATT_OVERHEAD {
            return Err(ConfigError::Invalid(format!(
                "default_mtu {} leaves no room for payload ({} bytes ATT overhead)",
                self.default_mtu, ATT_OVERHEAD
            )));
        }
        if self.target_mtu < self.default_mtu {
            return Err(ConfigError::Invalid(format!(
                "target_mtu {} is below default_mtu {}",
                self.target_mtu, self.default_mtu
            )));
        }
        if self.scan_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "scan and connect timeouts must be non-zero".to_string(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_message_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }

    pub fn mtu_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.mtu_settle_timeout_ms)
    }
}
