//! BLE radio boundary for the sleep-session link
//!
//! Provides the GATT constants shared by both ends, the central/peripheral
//! traits the link actors drive, an in-process simulated radio for tests and
//! demos, and (behind `ble-central`) a btleplug-backed central.

#[cfg(feature = "ble-central")]
pub mod btleplug_central;
pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth radio unavailable: {0}")]
    Unavailable(String),

    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Link busy, write not issued")]
    Busy,

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
