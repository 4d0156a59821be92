//! GATT service definition for the sleep-session link
//!
//! Both the wearable (central) and the phone (peripheral) agree on one
//! service carrying one write/read characteristic. Everything a session
//! transfer needs to know about transfer units lives here too.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environmental Sensing service, used as the link's primary service.
pub const SLEEP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000181a_0000_1000_8000_00805f9b34fb);

/// Characteristic that carries session chunks (write with response + read).
pub const SESSION_CHAR_UUID: Uuid = Uuid::from_u128(0x00002a6e_0000_1000_8000_00805f9b34fb);

/// Bytes of every ATT write consumed by the opcode and attribute handle.
pub const ATT_OVERHEAD: u16 = 3;

/// Transfer unit assumed until an MTU exchange succeeds.
pub const DEFAULT_MTU: u16 = 20;

/// Transfer unit requested once a connection is ready.
pub const TARGET_MTU: u16 = 247;

/// Payload bytes that fit into one write for the given transfer unit.
///
/// Never returns zero so that a degenerate unit still makes progress.
pub fn chunk_payload_size(mtu: u16) -> usize {
    usize::from(mtu.saturating_sub(ATT_OVERHEAD)).max(1)
}

/// Outcome code attached to GATT callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    /// Platform-specific failure code.
    Failure(u16),
}

impl GattStatus {
    /// Generic failure (GATT_FAILURE on most stacks).
    pub const FAILURE: GattStatus = GattStatus::Failure(0x0101);

    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// Capabilities advertised by a characteristic. Permissions mirror these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDef {
    pub uuid: Uuid,
    pub properties: CharProperties,
}

/// A primary service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattServiceDef {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDef>,
}

impl GattServiceDef {
    /// The session service with its single write/read characteristic.
    pub fn session_service(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            uuid: service,
            characteristics: vec![CharacteristicDef {
                uuid: characteristic,
                properties: CharProperties {
                    read: true,
                    write: true,
                },
            }],
        }
    }

    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.iter().any(|c| &c.uuid == uuid)
    }
}

/// Resolved location of the transfer characteristic on a connected peer.
///
/// Held only by the connection state machine; cleared whenever the link
/// drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// Find the expected characteristic in a discovered service set.
pub fn find_characteristic(
    services: &[GattServiceDef],
    service: &Uuid,
    characteristic: &Uuid,
) -> Option<CharacteristicHandle> {
    services
        .iter()
        .find(|s| &s.uuid == service)
        .filter(|s| s.has_characteristic(characteristic))
        .map(|s| CharacteristicHandle {
            service: s.uuid,
            characteristic: *characteristic,
        })
}
