//! BLE transport trait definitions and core types
//!
//! Radio stacks are callback driven: commands are issued here and their
//! outcomes come back later as [`LinkEvent`](crate::link::event::LinkEvent)s
//! through the [`EventSink`] a backend was registered with. A command only
//! returns an error when it could not be issued at all.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::gatt::{GattServiceDef, GattStatus};
use super::BleError;
use crate::link::event::EventSink;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            BleAddress::Simulated(id) => write!(f, "sim-{}", id),
        }
    }
}

/// Whether the local radio can be used right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioReadiness {
    pub enabled: bool,
    pub permissions_granted: bool,
}

impl RadioReadiness {
    pub const READY: RadioReadiness = RadioReadiness {
        enabled: true,
        permissions_granted: true,
    };
}

/// BLE central role: scanning, connecting and writing to one peripheral.
#[async_trait]
pub trait GattCentral: Send + Sync + 'static {
    /// Route this backend's callbacks into `sink`. Called once by the owner.
    fn register(&self, sink: EventSink);

    /// Radio power and access-right state.
    async fn readiness(&self) -> RadioReadiness;

    /// Whether the platform can request a larger transfer unit.
    fn supports_mtu_request(&self) -> bool;

    /// Start scanning for peripherals advertising `service`.
    async fn start_scan(&self, service: Uuid) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Request a link; completion arrives as a connection state change.
    async fn connect(&self, peer: &BleAddress) -> Result<(), BleError>;

    async fn discover_services(&self, peer: &BleAddress) -> Result<(), BleError>;

    async fn request_mtu(&self, peer: &BleAddress, mtu: u16) -> Result<(), BleError>;

    /// Issue one write-with-response. The acknowledgment arrives as a
    /// characteristic-write event.
    async fn write(
        &self,
        peer: &BleAddress,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;

    /// Tear the link down and release platform resources.
    async fn disconnect(&self, peer: &BleAddress) -> Result<(), BleError>;
}

/// BLE peripheral role: advertising a GATT service and answering writes.
#[async_trait]
pub trait GattPeripheral: Send + Sync + 'static {
    fn register(&self, sink: EventSink);

    async fn readiness(&self) -> RadioReadiness;

    /// Publish `service` and start advertising its UUID.
    async fn start_advertising(&self, service: &GattServiceDef) -> Result<(), BleError>;

    async fn stop_advertising(&self) -> Result<(), BleError>;

    /// Answer a write request that asked for a response.
    async fn send_response(
        &self,
        peer: &BleAddress,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) -> Result<(), BleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_address_equality() {
        let addr1 = BleAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr2 = BleAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr3 = BleAddress::Real([0xFF, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(addr1, addr2);
        assert_ne!(addr1, addr3);

        let sim1 = BleAddress::Simulated(Uuid::nil());
        let sim2 = BleAddress::Simulated(Uuid::nil());
        assert_eq!(sim1, sim2);

        // Real and Simulated are never equal
        assert_ne!(addr1, sim1);
    }

    #[test]
    fn test_ble_address_display() {
        let addr = BleAddress::Real([0xAA, 0x0B, 0x0C, 0x0D, 0x0E, 0x01]);
        assert_eq!(addr.to_string(), "AA:0B:0C:0D:0E:01");
        let sim = BleAddress::Simulated(Uuid::nil());
        assert!(sim.to_string().starts_with("sim-"));
    }
}
