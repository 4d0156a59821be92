//! btleplug-backed BLE central (macOS, Linux, Windows)
//!
//! btleplug's calls complete in place rather than through callbacks, so each
//! command runs on a spawned task and reports its outcome as a
//! [`LinkEvent`] through the registered sink. btleplug offers no MTU
//! request; the link keeps the default transfer unit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::gatt::{CharProperties, CharacteristicDef, GattServiceDef, GattStatus};
use super::simulated::LINK_LOSS_STATUS;
use super::transport::{BleAddress, GattCentral, RadioReadiness};
use super::BleError;
use crate::link::event::{EventSink, LinkEvent};

fn map_err(e: btleplug::Error) -> BleError {
    match e {
        btleplug::Error::PermissionDenied => BleError::PermissionDenied(e.to_string()),
        btleplug::Error::DeviceNotFound => BleError::ConnectionError(e.to_string()),
        btleplug::Error::NotConnected => BleError::Disconnected,
        btleplug::Error::TimedOut(_) => BleError::Timeout,
        other => BleError::GattError(other.to_string()),
    }
}

#[derive(Clone, Default)]
struct SinkSlot(Arc<StdMutex<Option<EventSink>>>);

impl SinkSlot {
    fn set(&self, sink: EventSink) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn emit(&self, event: LinkEvent) {
        let sink = self.0.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            Some(sink) => {
                sink.emit(event);
            }
            None => log::debug!("Dropping {:?}: no sink registered", event),
        }
    }
}

pub struct BtleplugCentral {
    adapter: Adapter,
    sink: SinkSlot,
    /// Service filter of the running scan.
    scanning: Arc<StdMutex<Option<Uuid>>>,
    peripherals: Arc<Mutex<HashMap<BleAddress, Peripheral>>>,
    events_task: StdMutex<Option<JoinHandle<()>>>,
}

impl BtleplugCentral {
    /// Use the first Bluetooth adapter found.
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(map_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_err)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::Unavailable("no Bluetooth adapter found".into()))?;
        Ok(Self {
            adapter,
            sink: SinkSlot::default(),
            scanning: Arc::new(StdMutex::new(None)),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            events_task: StdMutex::new(None),
        })
    }

    async fn peripheral(&self, peer: &BleAddress) -> Result<Peripheral, BleError> {
        self.peripherals
            .lock()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| BleError::ConnectionError(format!("unknown peer {}", peer)))
    }

    /// Translate adapter events for as long as the adapter lives.
    fn spawn_event_pump(&self) -> JoinHandle<()> {
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let scanning = Arc::clone(&self.scanning);
        let peripherals = Arc::clone(&self.peripherals);

        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    log::warn!("Cannot subscribe to adapter events: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let filter = *scanning.lock().unwrap_or_else(PoisonError::into_inner);
                        let Some(service) = filter else {
                            continue;
                        };
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let Ok(Some(props)) = peripheral.properties().await else {
                            continue;
                        };
                        if !props.services.contains(&service) {
                            continue;
                        }
                        let peer = BleAddress::Real(peripheral.address().into_inner());
                        peripherals.lock().await.insert(peer.clone(), peripheral);
                        sink.emit(LinkEvent::ScanResult {
                            peer,
                            services: props.services,
                            rssi: props.rssi,
                        });
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let known = peripherals
                            .lock()
                            .await
                            .iter()
                            .find(|(_, p)| p.id() == id)
                            .map(|(addr, _)| addr.clone());
                        if let Some(peer) = known {
                            sink.emit(LinkEvent::ConnectionStateChanged {
                                peer,
                                connected: false,
                                status: LINK_LOSS_STATUS,
                            });
                        }
                    }
                    other => log::trace!("Unhandled BLE event: {:?}", other),
                }
            }
        })
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        if let Some(task) = self
            .events_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl GattCentral for BtleplugCentral {
    fn register(&self, sink: EventSink) {
        self.sink.set(sink);
        let mut task = self.events_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(self.spawn_event_pump());
        }
    }

    async fn readiness(&self) -> RadioReadiness {
        // btleplug reports no power or permission state up front; failures
        // surface from the commands themselves.
        RadioReadiness::READY
    }

    fn supports_mtu_request(&self) -> bool {
        false
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), BleError> {
        *self.scanning.lock().unwrap_or_else(PoisonError::into_inner) = Some(service);
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(map_err)
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        *self.scanning.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.adapter.stop_scan().await.map_err(map_err)
    }

    async fn connect(&self, peer: &BleAddress) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer).await?;
        let sink = self.sink.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let (connected, status) = match peripheral.connect().await {
                Ok(()) => (true, GattStatus::Success),
                Err(e) => {
                    log::warn!("Connect to {} failed: {}", peer, e);
                    (false, GattStatus::FAILURE)
                }
            };
            sink.emit(LinkEvent::ConnectionStateChanged {
                peer,
                connected,
                status,
            });
        });
        Ok(())
    }

    async fn discover_services(&self, peer: &BleAddress) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer).await?;
        let sink = self.sink.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => LinkEvent::ServicesDiscovered {
                    peer,
                    status: GattStatus::Success,
                    services: peripheral
                        .services()
                        .into_iter()
                        .map(|s| GattServiceDef {
                            uuid: s.uuid,
                            characteristics: s
                                .characteristics
                                .into_iter()
                                .map(|c| CharacteristicDef {
                                    uuid: c.uuid,
                                    properties: CharProperties {
                                        read: c.properties.contains(CharPropFlags::READ),
                                        write: c.properties.contains(CharPropFlags::WRITE),
                                    },
                                })
                                .collect(),
                        })
                        .collect(),
                },
                Err(e) => {
                    log::warn!("Service discovery on {} failed: {}", peer, e);
                    LinkEvent::ServicesDiscovered {
                        peer,
                        status: GattStatus::FAILURE,
                        services: Vec::new(),
                    }
                }
            };
            sink.emit(event);
        });
        Ok(())
    }

    async fn request_mtu(&self, _peer: &BleAddress, _mtu: u16) -> Result<(), BleError> {
        Err(BleError::Unsupported("btleplug has no MTU request".into()))
    }

    async fn write(
        &self,
        peer: &BleAddress,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer).await?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| BleError::GattError(format!("characteristic {} not found", characteristic)))?;

        let sink = self.sink.clone();
        let peer = peer.clone();
        let value = value.to_vec();
        tokio::spawn(async move {
            let status = match peripheral
                .write(&target, &value, WriteType::WithResponse)
                .await
            {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    log::debug!("Write to {} failed: {}", peer, e);
                    GattStatus::FAILURE
                }
            };
            sink.emit(LinkEvent::CharacteristicWrite {
                peer,
                characteristic,
                status,
            });
        });
        Ok(())
    }

    async fn disconnect(&self, peer: &BleAddress) -> Result<(), BleError> {
        let peripheral = self.peripheral(peer).await?;
        peripheral.disconnect().await.map_err(map_err)
    }
}
