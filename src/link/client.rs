//! Client-side link actor
//!
//! Owns the [`ConnectionStateMachine`] and drains one ordered queue of radio
//! callbacks, timer expiries and application commands. Nothing else touches
//! the machine, so state transitions never race.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use super::event::{Input, InputSender, LinkEvent, LinkEventBus};
use super::state::{Action, ConnectionStateMachine};
use super::timer::TimerWheel;
use super::{ConnectionState, LinkError, LinkStatus};
use crate::ble::gatt::GattStatus;
use crate::ble::transport::{BleAddress, GattCentral};
use crate::config::LinkConfig;

/// Requests from the application handle to the actor.
#[derive(Debug)]
pub enum ClientCommand {
    Connect {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Snapshot {
        reply: oneshot::Sender<ClientSnapshot>,
    },
    Shutdown,
}

/// Point-in-time view of the actor, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSnapshot {
    pub state: ConnectionState,
    pub peer: Option<BleAddress>,
    pub mtu: Option<u16>,
    /// Timers the state machine considers armed.
    pub armed_timers: usize,
    /// Timer tasks still sleeping in the runtime.
    pub timer_tasks: usize,
    pub transfer_active: bool,
    pub payload_queued: bool,
    pub reconnect_attempts: u32,
    /// Most recent failure cause, as text.
    pub last_failure: Option<String>,
}

/// Handle to a running client actor.
pub struct LinkClient {
    commands: InputSender<ClientCommand>,
    status_tx: broadcast::Sender<LinkStatus>,
    state_rx: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl LinkClient {
    /// Register with `central` and start the actor on the current runtime.
    pub fn spawn<C: GattCentral>(central: Arc<C>, config: LinkConfig) -> Self {
        let bus = LinkEventBus::new();
        central.register(bus.sink());

        let commands = bus.sender();
        let (status_tx, _) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let machine = ConnectionStateMachine::new(config, central.supports_mtu_request());

        let actor = ClientActor {
            timers: TimerWheel::new(bus.sender()),
            central,
            machine,
            bus,
            status_tx: status_tx.clone(),
            state_tx,
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands,
            status_tx,
            state_rx,
            task: Some(task),
        }
    }

    /// Start scanning for the peer. Resets the automatic reconnect budget.
    pub async fn request_connect(&self) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Connect { reply }, rx).await?
    }

    /// Tear the link down from whatever state it is in.
    pub async fn request_disconnect(&self) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Disconnect { reply }, rx).await
    }

    /// Queue one payload for delivery. Completion is reported as
    /// [`LinkStatus::TransferComplete`] or [`LinkStatus::TransferFailed`].
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Send { payload, reply }, rx)
            .await?
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Snapshot { reply }, rx).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    /// Sender for statuses produced outside the link, such as live sensor
    /// samples.
    pub fn status_sender(&self) -> broadcast::Sender<LinkStatus> {
        self.status_tx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), LinkError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::ActorStopped)
    }

    /// Stop the actor, releasing every timer.
    pub async fn shutdown(mut self) {
        self.commands.command(ClientCommand::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Link client actor ended abnormally: {}", e);
            }
        }
    }

    async fn request<T>(
        &self,
        command: ClientCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, LinkError> {
        if !self.commands.command(command) {
            return Err(LinkError::ActorStopped);
        }
        rx.await.map_err(|_| LinkError::ActorStopped)
    }
}

impl Drop for LinkClient {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.commands.command(ClientCommand::Shutdown);
        }
    }
}

struct ClientActor<C> {
    central: Arc<C>,
    machine: ConnectionStateMachine,
    bus: LinkEventBus<ClientCommand>,
    timers: TimerWheel<ClientCommand>,
    status_tx: broadcast::Sender<LinkStatus>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<C: GattCentral> ClientActor<C> {
    async fn run(mut self) {
        log::debug!("Link client actor started");
        while let Some(input) = self.bus.next().await {
            match input {
                Input::Link(event) => {
                    let actions = self.machine.handle_event(event);
                    self.execute(actions).await;
                }
                Input::Timer(fired) => {
                    self.timers.fired(fired);
                    let readiness = self.central.readiness().await;
                    let actions = self.machine.handle_timer(fired, readiness);
                    self.execute(actions).await;
                }
                Input::Command(ClientCommand::Shutdown) => break,
                Input::Command(command) => self.on_command(command).await,
            }
            self.state_tx.send_replace(self.machine.state());
        }

        let actions = self.machine.disconnect();
        self.execute(actions).await;
        self.timers.cancel_all();
        self.state_tx.send_replace(self.machine.state());
        log::debug!("Link client actor stopped");
    }

    async fn on_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect { reply } => {
                let readiness = self.central.readiness().await;
                let result = match self.machine.request_connect(readiness) {
                    Ok(actions) => {
                        self.execute(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ClientCommand::Disconnect { reply } => {
                let actions = self.machine.disconnect();
                self.execute(actions).await;
                let _ = reply.send(());
            }
            ClientCommand::Send { payload, reply } => {
                let readiness = self.central.readiness().await;
                let result = match self.machine.send(payload, readiness) {
                    Ok(actions) => {
                        self.execute(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ClientCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ClientCommand::Shutdown => {}
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        let connection = self.machine.connection();
        ClientSnapshot {
            state: self.machine.state(),
            peer: connection.map(|c| c.peer.clone()),
            mtu: connection.map(|c| c.mtu),
            armed_timers: self.machine.armed_timers(),
            timer_tasks: self.timers.pending(),
            transfer_active: self.machine.transfer_active(),
            payload_queued: self.machine.has_pending_payload(),
            reconnect_attempts: self.machine.reconnect_attempts(),
            last_failure: self.machine.last_failure().map(ToString::to_string),
        }
    }

    /// Carry out actions in order. Commands that cannot be issued are fed
    /// back into the machine, and whatever that produces runs next.
    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            let follow_up = self.perform(action).await;
            queue.extend(follow_up);
        }
    }

    async fn perform(&mut self, action: Action) -> Vec<Action> {
        match action {
            Action::StartScan { service } => {
                if let Err(e) = self.central.start_scan(service).await {
                    log::warn!("Could not start scan: {}", e);
                    return self.machine.handle_event(LinkEvent::ScanFailed { code: -1 });
                }
                log::info!("Scanning for service {}", service);
            }
            Action::StopScan => {
                if let Err(e) = self.central.stop_scan().await {
                    log::debug!("Stop scan failed: {}", e);
                }
            }
            Action::Connect { peer } => {
                if let Err(e) = self.central.connect(&peer).await {
                    log::warn!("Could not connect to {}: {}", peer, e);
                    return self.machine.handle_event(LinkEvent::ConnectionStateChanged {
                        peer,
                        connected: false,
                        status: GattStatus::FAILURE,
                    });
                }
            }
            Action::DiscoverServices { peer } => {
                if let Err(e) = self.central.discover_services(&peer).await {
                    log::warn!("Service discovery on {} failed: {}", peer, e);
                    return self.machine.handle_event(LinkEvent::ServicesDiscovered {
                        peer,
                        status: GattStatus::FAILURE,
                        services: Vec::new(),
                    });
                }
            }
            Action::RequestMtu { peer, mtu } => {
                if let Err(e) = self.central.request_mtu(&peer, mtu).await {
                    log::warn!("MTU request to {} failed: {}", peer, e);
                    return self.machine.mtu_request_failed();
                }
            }
            Action::Write {
                peer,
                service,
                characteristic,
                value,
            } => {
                if let Err(e) = self
                    .central
                    .write(&peer, service, characteristic, &value)
                    .await
                {
                    log::warn!("Write of {} bytes not issued: {}", value.len(), e);
                    return self.machine.write_not_issued();
                }
            }
            Action::Disconnect { peer } => {
                if let Err(e) = self.central.disconnect(&peer).await {
                    log::debug!("Disconnect from {} failed: {}", peer, e);
                }
            }
            Action::ArmTimer {
                timer,
                generation,
                after,
            } => self.timers.arm(timer, generation, after),
            Action::CancelTimer { timer } => self.timers.cancel(timer),
            Action::Notify(status) => {
                // No subscribers is fine.
                let _ = self.status_tx.send(status);
            }
        }
        Vec::new()
    }
}
