//! Server-side link actor
//!
//! Advertises the session service, acknowledges every write that asks for a
//! response, and feeds the bytes into a per-peer [`ReassemblyBuffer`]. Each
//! complete message becomes a [`ReceivedSession`] and is saved from its own
//! task so storage latency never delays acknowledgments.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::event::{Input, InputSender, LinkEvent, LinkEventBus};
use super::reassembly::{CompleteMessage, Reassembly, ReassemblyBuffer};
use super::LinkError;
use crate::ble::gatt::{GattServiceDef, GattStatus};
use crate::ble::transport::{BleAddress, GattPeripheral};
use crate::config::LinkConfig;
use crate::session::store::{ReceivedSession, SessionStore};

/// What the server reports to the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ServerEvent {
    PeerConnected { peer: BleAddress },
    PeerDisconnected { peer: BleAddress },
    /// A complete message was reassembled and handed to the store.
    MessageReceived {
        peer: BleAddress,
        session_id: Uuid,
        bytes: usize,
    },
    /// An accumulator outgrew the message cap.
    MessageDiscarded { peer: BleAddress, bytes: usize },
    SessionStored { session_id: Uuid },
    StoreFailed { session_id: Uuid, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSnapshot {
    pub peers: Vec<(BleAddress, usize)>,
    pub messages_received: usize,
}

#[derive(Debug)]
pub enum ServerCommand {
    Snapshot {
        reply: oneshot::Sender<ServerSnapshot>,
    },
    Stop,
}

/// Handle to a running server actor.
pub struct LinkServer {
    commands: InputSender<ServerCommand>,
    events_tx: broadcast::Sender<ServerEvent>,
    task: Option<JoinHandle<()>>,
}

impl LinkServer {
    /// Publish the session service on `peripheral` and start serving.
    pub async fn start<P: GattPeripheral, S: SessionStore>(
        peripheral: Arc<P>,
        store: Arc<S>,
        config: LinkConfig,
    ) -> Result<Self, LinkError> {
        let readiness = peripheral.readiness().await;
        if !readiness.permissions_granted {
            return Err(LinkError::PermissionDenied);
        }
        if !readiness.enabled {
            return Err(LinkError::LinkUnavailable);
        }

        let bus = LinkEventBus::new();
        peripheral.register(bus.sink());
        let service =
            GattServiceDef::session_service(config.service_uuid, config.characteristic_uuid);
        peripheral.start_advertising(&service).await?;
        log::info!("Advertising session service {}", service.uuid);

        let commands = bus.sender();
        let (events_tx, _) = broadcast::channel(64);
        let actor = ServerActor {
            peripheral,
            store,
            buffer: ReassemblyBuffer::new(config.max_message_bytes),
            config,
            bus,
            events_tx: events_tx.clone(),
            messages_received: 0,
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            commands,
            events_tx,
            task: Some(task),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    pub async fn snapshot(&self) -> Result<ServerSnapshot, LinkError> {
        let (reply, rx) = oneshot::channel();
        if !self.commands.command(ServerCommand::Snapshot { reply }) {
            return Err(LinkError::ActorStopped);
        }
        rx.await.map_err(|_| LinkError::ActorStopped)
    }

    /// Stop advertising and end the actor.
    pub async fn stop(mut self) {
        self.commands.command(ServerCommand::Stop);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Link server actor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for LinkServer {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.commands.command(ServerCommand::Stop);
        }
    }
}

struct ServerActor<P, S> {
    peripheral: Arc<P>,
    store: Arc<S>,
    config: LinkConfig,
    buffer: ReassemblyBuffer,
    bus: LinkEventBus<ServerCommand>,
    events_tx: broadcast::Sender<ServerEvent>,
    messages_received: usize,
}

impl<P: GattPeripheral, S: SessionStore> ServerActor<P, S> {
    async fn run(mut self) {
        while let Some(input) = self.bus.next().await {
            match input {
                Input::Link(event) => self.on_event(event).await,
                Input::Command(ServerCommand::Snapshot { reply }) => {
                    let _ = reply.send(self.snapshot());
                }
                Input::Command(ServerCommand::Stop) => break,
                // The server arms no timers.
                Input::Timer(_) => {}
            }
        }
        if let Err(e) = self.peripheral.stop_advertising().await {
            log::warn!("Failed to stop advertising: {}", e);
        }
        log::debug!("Link server actor stopped");
    }

    fn snapshot(&self) -> ServerSnapshot {
        let mut peers: Vec<(BleAddress, usize)> = self.buffer.peers().collect();
        peers.sort_by_key(|(peer, _)| peer.to_string());
        ServerSnapshot {
            peers,
            messages_received: self.messages_received,
        }
    }

    async fn on_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::ConnectionStateChanged {
                peer,
                connected,
                status,
            } => {
                if connected && !status.is_success() {
                    log::warn!("Connection from {} failed with {:?}", peer, status);
                } else if connected {
                    log::info!("Peer {} connected", peer);
                    self.buffer.on_connected(&peer);
                    self.emit(ServerEvent::PeerConnected { peer });
                } else {
                    log::info!("Peer {} disconnected", peer);
                    self.buffer.on_disconnected(&peer);
                    self.emit(ServerEvent::PeerDisconnected { peer });
                }
            }
            LinkEvent::WriteRequest {
                peer,
                request_id,
                characteristic,
                offset,
                value,
                response_needed,
            } => {
                if characteristic != self.config.characteristic_uuid {
                    log::warn!("Write from {} to unknown characteristic {}", peer, characteristic);
                    if response_needed {
                        self.respond(&peer, request_id, GattStatus::FAILURE, offset, &value)
                            .await;
                    }
                    return;
                }
                // Acknowledge before looking at the content; there is no NACK.
                if response_needed {
                    self.respond(&peer, request_id, GattStatus::Success, offset, &value)
                        .await;
                }
                match self.buffer.on_write(&peer, &value) {
                    Reassembly::Incomplete { buffered } => {
                        log::trace!("{} bytes buffered from {}", buffered, peer);
                    }
                    Reassembly::Complete(message) => self.on_message(peer, message),
                    Reassembly::Overflow { dropped } => {
                        self.emit(ServerEvent::MessageDiscarded {
                            peer,
                            bytes: dropped,
                        });
                    }
                }
            }
            other => log::trace!("Ignoring {:?} on server", other),
        }
    }

    async fn respond(
        &self,
        peer: &BleAddress,
        request_id: u32,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) {
        if let Err(e) = self
            .peripheral
            .send_response(peer, request_id, status, offset, value)
            .await
        {
            log::warn!("Failed to answer write {} from {}: {}", request_id, peer, e);
        }
    }

    fn on_message(&mut self, peer: BleAddress, message: CompleteMessage) {
        let session_id = Uuid::new_v4();
        let bytes = message.raw.len();
        self.messages_received += 1;
        log::info!(
            "Complete message of {} bytes from {}, session {}",
            bytes,
            peer,
            session_id
        );

        let session =
            ReceivedSession::from_message(session_id, peer.to_string(), Utc::now(), message.body);
        self.emit(ServerEvent::MessageReceived {
            peer,
            session_id,
            bytes,
        });

        let store = Arc::clone(&self.store);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match store.save(session_id, session).await {
                Ok(()) => ServerEvent::SessionStored { session_id },
                Err(e) => {
                    log::warn!("Failed to store session {}: {}", session_id, e);
                    ServerEvent::StoreFailed {
                        session_id,
                        error: e.to_string(),
                    }
                }
            };
            let _ = events_tx.send(event);
        });
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::ble::transport::RadioReadiness;
    use crate::ble::BleError;
    use crate::link::event::EventSink;
    use crate::session::store::MemorySessionStore;

    /// Peripheral that hands its registered sink to the test.
    #[derive(Default)]
    struct ScriptedPeripheral {
        sink: Mutex<Option<EventSink>>,
    }

    impl ScriptedPeripheral {
        fn emit(&self, event: LinkEvent) {
            let sink = self.sink.lock().unwrap().clone().expect("server registered");
            assert!(sink.emit(event));
        }
    }

    #[async_trait]
    impl GattPeripheral for ScriptedPeripheral {
        fn register(&self, sink: EventSink) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        async fn readiness(&self) -> RadioReadiness {
            RadioReadiness::READY
        }

        async fn start_advertising(&self, _service: &GattServiceDef) -> Result<(), BleError> {
            Ok(())
        }

        async fn stop_advertising(&self) -> Result<(), BleError> {
            Ok(())
        }

        async fn send_response(
            &self,
            _peer: &BleAddress,
            _request_id: u32,
            _status: GattStatus,
            _offset: usize,
            _value: &[u8],
        ) -> Result<(), BleError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_connection_is_not_a_peer() {
        let peripheral = Arc::new(ScriptedPeripheral::default());
        let store = Arc::new(MemorySessionStore::new());
        let server = LinkServer::start(Arc::clone(&peripheral), store, LinkConfig::default())
            .await
            .unwrap();
        let mut events = server.subscribe();
        let peer = BleAddress::Simulated(Uuid::from_u128(7));

        peripheral.emit(LinkEvent::ConnectionStateChanged {
            peer: peer.clone(),
            connected: true,
            status: GattStatus::FAILURE,
        });
        // Snapshot is answered after the event above has been handled.
        assert!(server.snapshot().await.unwrap().peers.is_empty());
        assert!(events.try_recv().is_err());

        peripheral.emit(LinkEvent::ConnectionStateChanged {
            peer: peer.clone(),
            connected: true,
            status: GattStatus::Success,
        });
        assert_eq!(server.snapshot().await.unwrap().peers, vec![(peer.clone(), 0)]);
        assert!(matches!(
            events.try_recv(),
            Ok(ServerEvent::PeerConnected { peer: p }) if p == peer
        ));

        server.stop().await;
    }
}
