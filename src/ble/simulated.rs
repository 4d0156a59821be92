//! In-process BLE simulator
//!
//! A shared simulated "air" where peripherals advertise a GATT service and
//! centrals scan, connect, discover, negotiate an MTU and write to it. All
//! outcomes are delivered as callbacks through each device's registered
//! [`EventSink`], exactly like a real radio stack. Used for integration
//! testing and demos without BLE hardware.
//!
//! Faults can be injected per central: radio off, missing permissions,
//! refused connections, MTU behaviour, failed and unissuable writes, and
//! link drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::gatt::{chunk_payload_size, GattServiceDef, GattStatus, DEFAULT_MTU};
use super::transport::{BleAddress, GattCentral, GattPeripheral, RadioReadiness};
use super::BleError;
use crate::link::event::{EventSink, LinkEvent};

/// Status reported when the simulated link is lost (supervision timeout).
pub const LINK_LOSS_STATUS: GattStatus = GattStatus::Failure(0x08);

/// Status reported when a connection attempt fails.
pub const CONNECT_FAILED_STATUS: GattStatus = GattStatus::Failure(0x85);

/// How a simulated peripheral answers MTU requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMtu {
    /// Accept up to this unit.
    Accept(u16),
    /// Answer with a failure status.
    Reject,
    /// Never answer.
    Silent,
}

#[derive(Debug, Clone)]
struct CentralFaults {
    readiness: RadioReadiness,
    mtu_supported: bool,
    mtu: SimMtu,
    refuse_connects: u32,
    fail_writes: u32,
    busy_writes: u32,
}

impl Default for CentralFaults {
    fn default() -> Self {
        Self {
            readiness: RadioReadiness::READY,
            mtu_supported: true,
            mtu: SimMtu::Accept(517),
            refuse_connects: 0,
            fail_writes: 0,
            busy_writes: 0,
        }
    }
}

#[derive(Default)]
struct CentralSlot {
    sink: Option<EventSink>,
    scanning: Option<Uuid>,
    faults: CentralFaults,
    outstanding_writes: usize,
    max_outstanding_writes: usize,
    writes_issued: usize,
}

struct PeripheralSlot {
    sink: Option<EventSink>,
    readiness: RadioReadiness,
    advertising: Option<GattServiceDef>,
}

impl Default for PeripheralSlot {
    fn default() -> Self {
        Self {
            sink: None,
            readiness: RadioReadiness::READY,
            advertising: None,
        }
    }
}

/// An established simulated link, keyed by central address.
struct SimLink {
    peripheral: BleAddress,
    mtu: u16,
}

struct PendingWrite {
    central: BleAddress,
    characteristic: Uuid,
}

#[derive(Default)]
struct SimAir {
    centrals: HashMap<BleAddress, CentralSlot>,
    peripherals: HashMap<BleAddress, PeripheralSlot>,
    links: HashMap<BleAddress, SimLink>,
    pending_writes: HashMap<(BleAddress, u32), PendingWrite>,
    next_request_id: u32,
}

/// Callbacks collected under the lock and delivered after it is released.
type Deliveries = Vec<(EventSink, LinkEvent)>;

fn deliver(deliveries: Deliveries) {
    for (sink, event) in deliveries {
        if !sink.emit(event) {
            log::trace!("Simulated callback dropped: receiver has stopped");
        }
    }
}

impl SimAir {
    fn central_sink(&self, central: &BleAddress) -> Option<EventSink> {
        self.centrals.get(central).and_then(|c| c.sink.clone())
    }

    fn peripheral_sink(&self, peripheral: &BleAddress) -> Option<EventSink> {
        self.peripherals.get(peripheral).and_then(|p| p.sink.clone())
    }

    /// Tear down the link of `central`, notifying both ends.
    fn break_link(&mut self, central: &BleAddress, status: GattStatus, notify_central: bool) -> Deliveries {
        let mut out = Deliveries::new();
        let Some(link) = self.links.remove(central) else {
            return out;
        };
        self.pending_writes.retain(|_, w| &w.central != central);
        if let Some(slot) = self.centrals.get_mut(central) {
            slot.outstanding_writes = 0;
        }
        if notify_central {
            if let Some(sink) = self.central_sink(central) {
                out.push((
                    sink,
                    LinkEvent::ConnectionStateChanged {
                        peer: link.peripheral.clone(),
                        connected: false,
                        status,
                    },
                ));
            }
        }
        if let Some(sink) = self.peripheral_sink(&link.peripheral) {
            out.push((
                sink,
                LinkEvent::ConnectionStateChanged {
                    peer: central.clone(),
                    connected: false,
                    status,
                },
            ));
        }
        out
    }
}

/// The simulated "air": a shared medium through which all simulated
/// devices communicate.
pub struct SimBleNetwork {
    air: Mutex<SimAir>,
}

impl SimBleNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            air: Mutex::new(SimAir::default()),
        })
    }

    fn air(&self) -> MutexGuard<'_, SimAir> {
        self.air.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a central (the wearable side) on this network.
    pub fn create_central(self: &Arc<Self>) -> SimCentral {
        let address = BleAddress::Simulated(Uuid::new_v4());
        self.air()
            .centrals
            .insert(address.clone(), CentralSlot::default());
        SimCentral {
            address,
            network: Arc::clone(self),
        }
    }

    /// Create a peripheral (the phone side) on this network.
    pub fn create_peripheral(self: &Arc<Self>) -> SimPeripheral {
        let address = BleAddress::Simulated(Uuid::new_v4());
        self.air()
            .peripherals
            .insert(address.clone(), PeripheralSlot::default());
        SimPeripheral {
            address,
            network: Arc::clone(self),
        }
    }

    /// Drop the link of `central` as if the radio lost it.
    pub fn drop_link(&self, central: &BleAddress) -> bool {
        let deliveries = {
            let mut air = self.air();
            if !air.links.contains_key(central) {
                return false;
            }
            log::debug!("Simulating link loss for {}", central);
            air.break_link(central, LINK_LOSS_STATUS, true)
        };
        deliver(deliveries);
        true
    }

    /// Number of live links.
    pub fn link_count(&self) -> usize {
        self.air().links.len()
    }
}

/// Simulated central. Cheap handle onto the shared network.
pub struct SimCentral {
    address: BleAddress,
    network: Arc<SimBleNetwork>,
}

impl SimCentral {
    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut CentralSlot) -> R) -> R {
        let mut air = self.network.air();
        let slot = air.centrals.entry(self.address.clone()).or_default();
        f(slot)
    }

    pub fn set_readiness(&self, readiness: RadioReadiness) {
        self.with_slot(|s| s.faults.readiness = readiness);
    }

    /// Whether the platform exposes an MTU request at all.
    pub fn set_mtu_supported(&self, supported: bool) {
        self.with_slot(|s| s.faults.mtu_supported = supported);
    }

    pub fn set_mtu_behaviour(&self, mtu: SimMtu) {
        self.with_slot(|s| s.faults.mtu = mtu);
    }

    /// The next `n` connection attempts fail.
    pub fn refuse_next_connects(&self, n: u32) {
        self.with_slot(|s| s.faults.refuse_connects = n);
    }

    /// The next `n` writes are issued but acknowledged with a failure.
    pub fn fail_next_writes(&self, n: u32) {
        self.with_slot(|s| s.faults.fail_writes = n);
    }

    /// The next `n` writes cannot be issued at all.
    pub fn busy_next_writes(&self, n: u32) {
        self.with_slot(|s| s.faults.busy_writes = n);
    }

    /// Highest number of writes ever awaiting acknowledgment at once.
    pub fn max_outstanding_writes(&self) -> usize {
        self.with_slot(|s| s.max_outstanding_writes)
    }

    /// Writes successfully issued, including ones later failed.
    pub fn writes_issued(&self) -> usize {
        self.with_slot(|s| s.writes_issued)
    }

    pub fn is_scanning(&self) -> bool {
        self.with_slot(|s| s.scanning.is_some())
    }

    pub fn is_linked(&self) -> bool {
        self.network.air().links.contains_key(&self.address)
    }

    fn check_radio(&self) -> Result<(), BleError> {
        let readiness = self.with_slot(|s| s.faults.readiness);
        if !readiness.permissions_granted {
            return Err(BleError::PermissionDenied("scan/connect not granted".into()));
        }
        if !readiness.enabled {
            return Err(BleError::Unavailable("adapter disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl GattCentral for SimCentral {
    fn register(&self, sink: EventSink) {
        self.with_slot(|s| s.sink = Some(sink));
    }

    async fn readiness(&self) -> RadioReadiness {
        self.with_slot(|s| s.faults.readiness)
    }

    fn supports_mtu_request(&self) -> bool {
        self.with_slot(|s| s.faults.mtu_supported)
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), BleError> {
        self.check_radio()?;
        let deliveries = {
            let mut air = self.network.air();
            let slot = air.centrals.entry(self.address.clone()).or_default();
            slot.scanning = Some(service);
            let Some(sink) = slot.sink.clone() else {
                return Ok(());
            };
            air.peripherals
                .iter()
                .filter_map(|(addr, p)| {
                    let adv = p.advertising.as_ref()?;
                    (adv.uuid == service).then(|| {
                        (
                            sink.clone(),
                            LinkEvent::ScanResult {
                                peer: addr.clone(),
                                services: vec![adv.uuid],
                                rssi: Some(-55),
                            },
                        )
                    })
                })
                .collect::<Deliveries>()
        };
        deliver(deliveries);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.with_slot(|s| s.scanning = None);
        Ok(())
    }

    async fn connect(&self, peer: &BleAddress) -> Result<(), BleError> {
        self.check_radio()?;
        let deliveries = {
            let mut air = self.network.air();
            let Some(central_sink) = air.central_sink(&self.address) else {
                return Err(BleError::ConnectionError("no callback registered".into()));
            };
            let slot = air.centrals.entry(self.address.clone()).or_default();
            let refused = if slot.faults.refuse_connects > 0 {
                slot.faults.refuse_connects -= 1;
                true
            } else {
                false
            };
            let reachable = air
                .peripherals
                .get(peer)
                .map_or(false, |p| p.advertising.is_some());

            if refused || !reachable {
                log::debug!("Simulated connect to {} refused", peer);
                vec![(
                    central_sink,
                    LinkEvent::ConnectionStateChanged {
                        peer: peer.clone(),
                        connected: false,
                        status: CONNECT_FAILED_STATUS,
                    },
                )]
            } else {
                air.links.insert(
                    self.address.clone(),
                    SimLink {
                        peripheral: peer.clone(),
                        mtu: DEFAULT_MTU,
                    },
                );
                let mut out = vec![(
                    central_sink,
                    LinkEvent::ConnectionStateChanged {
                        peer: peer.clone(),
                        connected: true,
                        status: GattStatus::Success,
                    },
                )];
                if let Some(sink) = air.peripheral_sink(peer) {
                    out.push((
                        sink,
                        LinkEvent::ConnectionStateChanged {
                            peer: self.address.clone(),
                            connected: true,
                            status: GattStatus::Success,
                        },
                    ));
                }
                out
            }
        };
        deliver(deliveries);
        Ok(())
    }

    async fn discover_services(&self, peer: &BleAddress) -> Result<(), BleError> {
        let deliveries = {
            let air = self.network.air();
            match air.links.get(&self.address) {
                Some(link) if &link.peripheral == peer => {}
                _ => return Err(BleError::Disconnected),
            }
            let services: Vec<GattServiceDef> = air
                .peripherals
                .get(peer)
                .and_then(|p| p.advertising.clone())
                .into_iter()
                .collect();
            air.central_sink(&self.address)
                .map(|sink| {
                    (
                        sink,
                        LinkEvent::ServicesDiscovered {
                            peer: peer.clone(),
                            status: GattStatus::Success,
                            services,
                        },
                    )
                })
                .into_iter()
                .collect::<Deliveries>()
        };
        deliver(deliveries);
        Ok(())
    }

    async fn request_mtu(&self, peer: &BleAddress, mtu: u16) -> Result<(), BleError> {
        let deliveries = {
            let mut air = self.network.air();
            let faults = air
                .centrals
                .get(&self.address)
                .map(|c| c.faults.clone())
                .unwrap_or_default();
            if !faults.mtu_supported {
                return Err(BleError::Unsupported("MTU request".into()));
            }
            let sink = air.central_sink(&self.address);
            let Some(link) = air.links.get_mut(&self.address) else {
                return Err(BleError::Disconnected);
            };
            let event = match faults.mtu {
                SimMtu::Accept(max) => {
                    link.mtu = mtu.min(max);
                    Some(LinkEvent::MtuChanged {
                        peer: peer.clone(),
                        mtu: link.mtu,
                        status: GattStatus::Success,
                    })
                }
                SimMtu::Reject => Some(LinkEvent::MtuChanged {
                    peer: peer.clone(),
                    mtu: link.mtu,
                    status: GattStatus::FAILURE,
                }),
                SimMtu::Silent => None,
            };
            sink.zip(event).into_iter().collect::<Deliveries>()
        };
        deliver(deliveries);
        Ok(())
    }

    async fn write(
        &self,
        peer: &BleAddress,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let deliveries = {
            let mut air = self.network.air();
            let link_mtu = match air.links.get(&self.address) {
                Some(link) if &link.peripheral == peer => link.mtu,
                _ => return Err(BleError::Disconnected),
            };
            if value.len() > chunk_payload_size(link_mtu) {
                return Err(BleError::MtuExceeded {
                    size: value.len(),
                    mtu: chunk_payload_size(link_mtu),
                });
            }

            let central_sink = air.central_sink(&self.address);
            let slot = air.centrals.entry(self.address.clone()).or_default();
            if slot.faults.busy_writes > 0 {
                slot.faults.busy_writes -= 1;
                return Err(BleError::Busy);
            }
            slot.writes_issued += 1;
            slot.outstanding_writes += 1;
            slot.max_outstanding_writes = slot.max_outstanding_writes.max(slot.outstanding_writes);

            if slot.faults.fail_writes > 0 {
                slot.faults.fail_writes -= 1;
                slot.outstanding_writes -= 1;
                central_sink
                    .map(|sink| {
                        (
                            sink,
                            LinkEvent::CharacteristicWrite {
                                peer: peer.clone(),
                                characteristic,
                                status: GattStatus::FAILURE,
                            },
                        )
                    })
                    .into_iter()
                    .collect::<Deliveries>()
            } else {
                air.next_request_id = air.next_request_id.wrapping_add(1);
                let request_id = air.next_request_id;
                air.pending_writes.insert(
                    (peer.clone(), request_id),
                    PendingWrite {
                        central: self.address.clone(),
                        characteristic,
                    },
                );
                air.peripheral_sink(peer)
                    .map(|sink| {
                        (
                            sink,
                            LinkEvent::WriteRequest {
                                peer: self.address.clone(),
                                request_id,
                                characteristic,
                                offset: 0,
                                value: value.to_vec(),
                                response_needed: true,
                            },
                        )
                    })
                    .into_iter()
                    .collect::<Deliveries>()
            }
        };
        deliver(deliveries);
        Ok(())
    }

    async fn disconnect(&self, _peer: &BleAddress) -> Result<(), BleError> {
        let deliveries = {
            let mut air = self.network.air();
            air.break_link(&self.address, GattStatus::Success, false)
        };
        deliver(deliveries);
        Ok(())
    }
}

/// Simulated peripheral. Cheap handle onto the shared network.
pub struct SimPeripheral {
    address: BleAddress,
    network: Arc<SimBleNetwork>,
}

impl SimPeripheral {
    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    pub fn set_readiness(&self, readiness: RadioReadiness) {
        let mut air = self.network.air();
        air.peripherals
            .entry(self.address.clone())
            .or_default()
            .readiness = readiness;
    }

    pub fn is_advertising(&self) -> bool {
        self.network
            .air()
            .peripherals
            .get(&self.address)
            .map_or(false, |p| p.advertising.is_some())
    }
}

#[async_trait]
impl GattPeripheral for SimPeripheral {
    fn register(&self, sink: EventSink) {
        let mut air = self.network.air();
        air.peripherals.entry(self.address.clone()).or_default().sink = Some(sink);
    }

    async fn readiness(&self) -> RadioReadiness {
        self.network
            .air()
            .peripherals
            .get(&self.address)
            .map_or(RadioReadiness::READY, |p| p.readiness)
    }

    async fn start_advertising(&self, service: &GattServiceDef) -> Result<(), BleError> {
        let deliveries = {
            let mut air = self.network.air();
            let slot = air.peripherals.entry(self.address.clone()).or_default();
            if !slot.readiness.enabled {
                return Err(BleError::AdvertisingError("adapter disabled".into()));
            }
            slot.advertising = Some(service.clone());

            // Active scanners filtering on this service see it right away.
            air.centrals
                .values()
                .filter(|c| c.scanning == Some(service.uuid))
                .filter_map(|c| c.sink.clone())
                .map(|sink| {
                    (
                        sink,
                        LinkEvent::ScanResult {
                            peer: self.address.clone(),
                            services: vec![service.uuid],
                            rssi: Some(-55),
                        },
                    )
                })
                .collect::<Deliveries>()
        };
        deliver(deliveries);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        let mut air = self.network.air();
        if let Some(slot) = air.peripherals.get_mut(&self.address) {
            slot.advertising = None;
        }
        Ok(())
    }

    async fn send_response(
        &self,
        peer: &BleAddress,
        request_id: u32,
        status: GattStatus,
        _offset: usize,
        _value: &[u8],
    ) -> Result<(), BleError> {
        let deliveries = {
            let mut air = self.network.air();
            let Some(pending) = air.pending_writes.remove(&(self.address.clone(), request_id)) else {
                return Err(BleError::GattError(format!(
                    "no outstanding request {} from {}",
                    request_id, peer
                )));
            };
            if let Some(slot) = air.centrals.get_mut(&pending.central) {
                slot.outstanding_writes = slot.outstanding_writes.saturating_sub(1);
            }
            air.central_sink(&pending.central)
                .map(|sink| {
                    (
                        sink,
                        LinkEvent::CharacteristicWrite {
                            peer: self.address.clone(),
                            characteristic: pending.characteristic,
                            status,
                        },
                    )
                })
                .into_iter()
                .collect::<Deliveries>()
        };
        deliver(deliveries);
        Ok(())
    }
}
