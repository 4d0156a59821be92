//! Client connection state machine
//!
//! Owns everything about the wearable's one logical connection: scan,
//! connect, service discovery, MTU negotiation, the outbound transfer, and
//! the timers bounding each waiting state. It performs no I/O. Every input
//! returns the [`Action`]s the owning actor must carry out, in order.
//!
//! ```text
//! Idle ──start_scan──▶ Scanning ──match──▶ Connecting ──link up──▶ DiscoveringServices ──ok──▶ Ready
//!  ▲                      │                    │                         │                      │
//!  └──── watchdog ────────┘                    └────── failure / drop ───┴──────────────────────┴──▶ Disconnected
//! ```

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::mtu::{MtuNegotiator, MtuOutcome};
use super::sender::{ChunkSender, SendStep};
use super::timer::{Timer, TimerFired, TimerSlots};
use super::{ConnectionState, LinkError, LinkStatus};
use crate::ble::gatt::{find_characteristic, CharacteristicHandle, GattStatus};
use crate::ble::transport::{BleAddress, RadioReadiness};
use crate::config::LinkConfig;
use crate::link::event::LinkEvent;

/// A command for the radio, or bookkeeping for the actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartScan { service: Uuid },
    StopScan,
    Connect { peer: BleAddress },
    DiscoverServices { peer: BleAddress },
    RequestMtu { peer: BleAddress, mtu: u16 },
    Write {
        peer: BleAddress,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Disconnect { peer: BleAddress },
    ArmTimer {
        timer: Timer,
        generation: u64,
        after: Duration,
    },
    CancelTimer { timer: Timer },
    Notify(LinkStatus),
}

/// The link to the one peer we talk to.
#[derive(Debug, Clone)]
pub struct Connection {
    pub peer: BleAddress,
    /// Transfer unit for transfers started from now on.
    pub mtu: u16,
    pub last_activity: Instant,
}

pub struct ConnectionStateMachine {
    config: LinkConfig,
    state: ConnectionState,
    connection: Option<Connection>,
    handle: Option<CharacteristicHandle>,
    timers: TimerSlots,
    reconnect_attempts: u32,
    mtu: MtuNegotiator,
    sender: ChunkSender,
    /// Payload waiting for a Ready, settled connection.
    pending: Option<Vec<u8>>,
    last_failure: Option<LinkError>,
}

impl ConnectionStateMachine {
    pub fn new(config: LinkConfig, mtu_supported: bool) -> Self {
        let mtu = MtuNegotiator::new(config.target_mtu, mtu_supported);
        let sender = ChunkSender::new(config.write_retry_delay(), config.max_write_retries);
        Self {
            config,
            state: ConnectionState::Idle,
            connection: None,
            handle: None,
            timers: TimerSlots::new(),
            reconnect_attempts: 0,
            mtu,
            sender,
            pending: None,
            last_failure: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn handle(&self) -> Option<&CharacteristicHandle> {
        self.handle.as_ref()
    }

    /// Timers the machine considers armed.
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        self.timers.is_armed(timer)
    }

    pub fn transfer_active(&self) -> bool {
        self.sender.is_active()
    }

    pub fn write_in_flight(&self) -> bool {
        self.sender.in_flight()
    }

    pub fn has_pending_payload(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Cause of the most recent failure since the application last asked to
    /// connect.
    pub fn last_failure(&self) -> Option<&LinkError> {
        self.last_failure.as_ref()
    }

    /// Application asked to connect. Resets the automatic-reconnect budget.
    pub fn request_connect(&mut self, readiness: RadioReadiness) -> Result<Vec<Action>, LinkError> {
        let actions = self.start_scan(readiness)?;
        self.reconnect_attempts = 0;
        self.last_failure = None;
        Ok(actions)
    }

    /// Begin a scan cycle. Only valid from Idle or Disconnected.
    pub fn start_scan(&mut self, readiness: RadioReadiness) -> Result<Vec<Action>, LinkError> {
        if !self.state.can_scan() {
            return Err(LinkError::InvalidState {
                operation: "start scan",
                state: self.state,
            });
        }
        if !readiness.permissions_granted {
            log::warn!("Bluetooth permissions not granted");
            return Err(LinkError::PermissionDenied);
        }
        if !readiness.enabled {
            log::warn!("Bluetooth is not enabled");
            return Err(LinkError::LinkUnavailable);
        }

        let mut actions = Vec::new();
        self.cancel_timer(Timer::Reconnect, &mut actions);
        self.transition(ConnectionState::Scanning);
        actions.push(Action::StartScan {
            service: self.config.service_uuid,
        });
        self.arm_timer(Timer::ScanWatchdog, self.config.scan_timeout(), &mut actions);
        Ok(actions)
    }

    /// Tear everything down. Valid from any state and idempotent.
    ///
    /// Cancels delivery as well: a queued or interrupted payload is dropped,
    /// and the application sends it again after the next connect.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Scanning => actions.push(Action::StopScan),
            ConnectionState::Connecting
            | ConnectionState::DiscoveringServices
            | ConnectionState::Ready => {
                if let Some(conn) = &self.connection {
                    actions.push(Action::Disconnect {
                        peer: conn.peer.clone(),
                    });
                }
            }
            ConnectionState::Idle | ConnectionState::Disconnected => {}
        }
        self.enter_disconnected(None, &mut actions);
        if let Some(dropped) = self.pending.take() {
            log::info!("Dropping queued {} byte payload on disconnect", dropped.len());
        }
        actions
    }

    /// Queue `payload` for delivery. Starts at once on a settled Ready link;
    /// otherwise waits, kicking off a scan if nothing is in progress.
    ///
    /// A payload left queued by a dropped link is replaced while no link is
    /// being set up. A payload queued on a live or connecting link is not.
    pub fn send(
        &mut self,
        payload: Vec<u8>,
        readiness: RadioReadiness,
    ) -> Result<Vec<Action>, LinkError> {
        if self.sender.is_active() || (self.pending.is_some() && !self.state.can_scan()) {
            return Err(LinkError::TransferInProgress);
        }
        let mut actions = Vec::new();
        let stale = self.pending.replace(payload);
        if let Some(stale) = &stale {
            log::info!("Replacing queued {} byte payload from an earlier link", stale.len());
        }

        if self.state == ConnectionState::Ready {
            if self.mtu.is_settled() {
                self.start_pending_transfer(&mut actions);
            }
        } else if self.state.can_scan() && !self.timers.is_armed(Timer::Reconnect) {
            log::info!("Not connected, starting scan to deliver payload");
            match self.start_scan(readiness) {
                Ok(scan) => actions.extend(scan),
                Err(e) => {
                    self.pending = stale;
                    return Err(e);
                }
            }
        }
        Ok(actions)
    }

    /// Feed a transport callback.
    pub fn handle_event(&mut self, event: LinkEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            LinkEvent::ScanResult { peer, services, .. } => {
                self.on_scan_result(peer, &services, &mut actions)
            }
            LinkEvent::ScanFailed { code } => {
                if self.state == ConnectionState::Scanning {
                    self.record_failure(LinkError::Transport(format!("scan failed with code {}", code)));
                    self.cancel_timer(Timer::ScanWatchdog, &mut actions);
                    self.transition(ConnectionState::Idle);
                    actions.push(Action::Notify(LinkStatus::ConnectionFailed));
                }
            }
            LinkEvent::ConnectionStateChanged {
                peer,
                connected,
                status,
            } => {
                if self.is_current_peer(&peer) {
                    self.on_connection_changed(connected, status, &mut actions);
                }
            }
            LinkEvent::ServicesDiscovered {
                peer,
                status,
                services,
            } => {
                if self.is_current_peer(&peer) && self.state == ConnectionState::DiscoveringServices {
                    let handle = if status.is_success() {
                        find_characteristic(
                            &services,
                            &self.config.service_uuid,
                            &self.config.characteristic_uuid,
                        )
                    } else {
                        None
                    };
                    match handle {
                        Some(handle) => self.enter_ready(handle, &mut actions),
                        None => self.fail_link(LinkError::ProtocolMismatch, &mut actions),
                    }
                }
            }
            LinkEvent::MtuChanged { peer, mtu, status } => {
                if self.is_current_peer(&peer) && self.state == ConnectionState::Ready {
                    if let MtuOutcome::Negotiated(unit) = self.mtu.on_changed(mtu, status) {
                        if let Some(conn) = self.connection.as_mut() {
                            conn.mtu = unit;
                        }
                    }
                    self.touch();
                    self.mtu_settled(&mut actions);
                }
            }
            LinkEvent::CharacteristicWrite { peer, status, .. } => {
                if self.is_current_peer(&peer) && self.state == ConnectionState::Ready {
                    if status.is_success() {
                        self.touch();
                    } else {
                        log::debug!("Write acknowledged with {:?}", status);
                        self.record_failure(LinkError::WriteFailed);
                    }
                    if let Some(step) = self.sender.on_ack(status.is_success()) {
                        self.apply_step(step, &mut actions);
                    }
                }
            }
            LinkEvent::WriteRequest { .. } => {}
        }
        actions
    }

    /// Feed a timer expiry. Stale generations are ignored.
    pub fn handle_timer(&mut self, fired: TimerFired, readiness: RadioReadiness) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.timers.fire(fired) {
            log::trace!("Ignoring stale {:?} expiry", fired.timer);
            return actions;
        }
        match fired.timer {
            Timer::ScanWatchdog => {
                if self.state == ConnectionState::Scanning {
                    self.record_failure(LinkError::ScanTimeout);
                    actions.push(Action::StopScan);
                    self.transition(ConnectionState::Idle);
                    actions.push(Action::Notify(LinkStatus::ScanTimeout));
                }
            }
            Timer::ConnectTimeout => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::DiscoveringServices
                ) {
                    self.fail_link(LinkError::Transport("connect timed out".into()), &mut actions);
                }
            }
            Timer::Reconnect => {
                if self.state.can_scan() {
                    log::info!(
                        "Reconnect attempt {}{}",
                        self.reconnect_attempts,
                        self.config
                            .max_reconnect_attempts
                            .map(|m| format!("/{}", m))
                            .unwrap_or_default()
                    );
                    match self.start_scan(readiness) {
                        Ok(scan) => actions.extend(scan),
                        Err(e) => {
                            log::warn!("Reconnect abandoned: {}", e);
                            actions.push(Action::Notify(LinkStatus::ConnectionFailed));
                        }
                    }
                }
            }
            Timer::MtuSettle => {
                if self.state == ConnectionState::Ready {
                    self.mtu.give_up();
                    self.mtu_settled(&mut actions);
                }
            }
            Timer::WriteRetry => {
                if self.state == ConnectionState::Ready {
                    if let Some(step) = self.sender.retry_due() {
                        self.apply_step(step, &mut actions);
                    }
                }
            }
        }
        actions
    }

    /// The actor could not issue the outstanding write.
    pub fn write_not_issued(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == ConnectionState::Ready {
            if let Some(step) = self.sender.on_write_not_issued() {
                self.apply_step(step, &mut actions);
            }
        }
        actions
    }

    /// The actor could not issue the MTU request.
    pub fn mtu_request_failed(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == ConnectionState::Ready {
            self.mtu.give_up();
            self.mtu_settled(&mut actions);
        }
        actions
    }

    fn on_scan_result(&mut self, peer: BleAddress, services: &[Uuid], actions: &mut Vec<Action>) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        if !services.contains(&self.config.service_uuid) {
            log::trace!("Ignoring advertisement from {} without session service", peer);
            return;
        }
        log::info!("Found peer {}, connecting", peer);
        actions.push(Action::StopScan);
        self.cancel_timer(Timer::ScanWatchdog, actions);
        self.connection = Some(Connection {
            peer: peer.clone(),
            mtu: self.config.default_mtu,
            last_activity: Instant::now(),
        });
        self.transition(ConnectionState::Connecting);
        actions.push(Action::Connect { peer });
        self.arm_timer(Timer::ConnectTimeout, self.config.connect_timeout(), actions);
    }

    fn on_connection_changed(&mut self, connected: bool, status: GattStatus, actions: &mut Vec<Action>) {
        match (connected, self.state) {
            (true, ConnectionState::Connecting) if status.is_success() => {
                let Some(peer) = self.current_peer() else {
                    return;
                };
                self.touch();
                self.transition(ConnectionState::DiscoveringServices);
                actions.push(Action::DiscoverServices { peer });
            }
            (true, ConnectionState::Connecting) => {
                self.fail_link(LinkError::Transport(format!("connect status {:?}", status)), actions);
            }
            (false, state) if state.has_link() => {
                log::debug!("Link lost with status {:?} while {}", status, state);
                self.enter_disconnected(Some(LinkError::UnsolicitedDisconnect), actions);
            }
            _ => {}
        }
    }

    fn enter_ready(&mut self, handle: CharacteristicHandle, actions: &mut Vec<Action>) {
        let Some(peer) = self.current_peer() else {
            return;
        };
        self.cancel_timer(Timer::ConnectTimeout, actions);
        self.handle = Some(handle);
        self.reconnect_attempts = 0;
        self.touch();
        self.transition(ConnectionState::Ready);
        actions.push(Action::Notify(LinkStatus::Connected { peer: peer.clone() }));

        match self.mtu.on_ready() {
            Some(mtu) => {
                actions.push(Action::RequestMtu { peer, mtu });
                self.arm_timer(Timer::MtuSettle, self.config.mtu_settle_timeout(), actions);
            }
            None => self.start_pending_transfer(actions),
        }
    }

    fn mtu_settled(&mut self, actions: &mut Vec<Action>) {
        self.cancel_timer(Timer::MtuSettle, actions);
        if !self.sender.is_active() {
            self.start_pending_transfer(actions);
        }
    }

    fn start_pending_transfer(&mut self, actions: &mut Vec<Action>) {
        let Some(mtu) = self.connection.as_ref().map(|c| c.mtu) else {
            return;
        };
        let Some(payload) = self.pending.take() else {
            return;
        };
        match self.sender.begin(payload, mtu) {
            Ok(step) => self.apply_step(step, actions),
            Err(e) => log::warn!("Could not start transfer: {}", e),
        }
    }

    fn apply_step(&mut self, step: SendStep, actions: &mut Vec<Action>) {
        match step {
            SendStep::Write(value) => {
                let (Some(peer), Some(handle)) = (self.current_peer(), self.handle) else {
                    return;
                };
                actions.push(Action::Write {
                    peer,
                    service: handle.service,
                    characteristic: handle.characteristic,
                    value,
                });
            }
            SendStep::RetryAfter(delay) => self.arm_timer(Timer::WriteRetry, delay, actions),
            SendStep::Complete { bytes, chunks } => {
                log::info!("Transfer complete: {} bytes in {} chunks", bytes, chunks);
                actions.push(Action::Notify(LinkStatus::TransferComplete { bytes, chunks }));
            }
            SendStep::Failed { attempts } => {
                self.record_failure(LinkError::TransferFailed { attempts });
                actions.push(Action::Notify(LinkStatus::TransferFailed { attempts }));
            }
        }
    }

    /// Drop a link that never became usable, then apply the reconnect policy.
    fn fail_link(&mut self, cause: LinkError, actions: &mut Vec<Action>) {
        if let Some(peer) = self.current_peer() {
            actions.push(Action::Disconnect { peer });
        }
        self.enter_disconnected(Some(cause), actions);
    }

    /// Move to Disconnected. `cause` is `None` for an application request.
    fn enter_disconnected(&mut self, cause: Option<LinkError>, actions: &mut Vec<Action>) {
        let previous = self.state;
        let was_ready = previous == ConnectionState::Ready;
        if let Some(cause) = &cause {
            self.record_failure(cause.clone());
        }

        for timer in self.timers.armed().collect::<Vec<_>>() {
            self.cancel_timer(timer, actions);
        }
        self.handle = None;
        self.connection = None;
        self.mtu.reset();
        if let Some(payload) = self.sender.abandon() {
            // Delivered again from the first byte on the next Ready, unless
            // `disconnect` drops it or a newer `send` replaces it.
            self.pending = Some(payload);
        }
        self.transition(ConnectionState::Disconnected);

        if previous != ConnectionState::Idle && previous != ConnectionState::Disconnected {
            actions.push(Action::Notify(LinkStatus::Disconnected));
        }

        if cause.is_some() && !was_ready {
            self.schedule_reconnect(actions);
        }
    }

    fn schedule_reconnect(&mut self, actions: &mut Vec<Action>) {
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                log::warn!("Giving up after {} reconnect attempts", self.reconnect_attempts);
                actions.push(Action::Notify(LinkStatus::ConnectionFailed));
                return;
            }
        }
        self.reconnect_attempts += 1;
        log::info!("Reconnecting in {:?}", self.config.reconnect_delay());
        self.arm_timer(Timer::Reconnect, self.config.reconnect_delay(), actions);
    }

    fn record_failure(&mut self, cause: LinkError) {
        log::warn!("{}", cause);
        self.last_failure = Some(cause);
    }

    fn arm_timer(&mut self, timer: Timer, after: Duration, actions: &mut Vec<Action>) {
        let generation = self.timers.arm(timer);
        actions.push(Action::ArmTimer {
            timer,
            generation,
            after,
        });
    }

    fn cancel_timer(&mut self, timer: Timer, actions: &mut Vec<Action>) {
        if self.timers.cancel(timer) {
            actions.push(Action::CancelTimer { timer });
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("Connection state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn touch(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            conn.last_activity = Instant::now();
        }
    }

    fn current_peer(&self) -> Option<BleAddress> {
        self.connection.as_ref().map(|c| c.peer.clone())
    }

    fn is_current_peer(&self, peer: &BleAddress) -> bool {
        self.connection.as_ref().map_or(false, |c| &c.peer == peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{GattServiceDef, SESSION_CHAR_UUID, SLEEP_SERVICE_UUID};

    fn peer() -> BleAddress {
        BleAddress::Real([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01])
    }

    fn machine() -> ConnectionStateMachine {
        ConnectionStateMachine::new(LinkConfig::default(), true)
    }

    fn generation_of(actions: &[Action], wanted: Timer) -> u64 {
        actions
            .iter()
            .find_map(|a| match a {
                Action::ArmTimer {
                    timer, generation, ..
                } if *timer == wanted => Some(*generation),
                _ => None,
            })
            .unwrap_or_else(|| panic!("{:?} not armed in {:?}", wanted, actions))
    }

    fn writes(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Write { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    fn session_services() -> Vec<GattServiceDef> {
        vec![GattServiceDef::session_service(SLEEP_SERVICE_UUID, SESSION_CHAR_UUID)]
    }

    fn drive_to_discovery(m: &mut ConnectionStateMachine) {
        m.request_connect(RadioReadiness::READY).unwrap();
        m.handle_event(LinkEvent::ScanResult {
            peer: peer(),
            services: vec![SLEEP_SERVICE_UUID],
            rssi: Some(-60),
        });
        m.handle_event(LinkEvent::ConnectionStateChanged {
            peer: peer(),
            connected: true,
            status: GattStatus::Success,
        });
        assert_eq!(m.state(), ConnectionState::DiscoveringServices);
    }

    /// Drive to Ready; returns the MtuSettle generation.
    fn drive_to_ready(m: &mut ConnectionStateMachine) -> Vec<Action> {
        drive_to_discovery(m);
        let actions = m.handle_event(LinkEvent::ServicesDiscovered {
            peer: peer(),
            status: GattStatus::Success,
            services: session_services(),
        });
        assert_eq!(m.state(), ConnectionState::Ready);
        actions
    }

    #[test]
    fn test_scan_preconditions() {
        let mut m = machine();
        let denied = RadioReadiness {
            enabled: true,
            permissions_granted: false,
        };
        assert_eq!(m.start_scan(denied), Err(LinkError::PermissionDenied));
        let off = RadioReadiness {
            enabled: false,
            permissions_granted: true,
        };
        assert_eq!(m.start_scan(off), Err(LinkError::LinkUnavailable));
        assert_eq!(m.state(), ConnectionState::Idle);
        assert_eq!(m.armed_timers(), 0);
    }

    #[test]
    fn test_scan_only_from_idle_or_disconnected() {
        let mut m = machine();
        m.start_scan(RadioReadiness::READY).unwrap();
        assert!(matches!(
            m.start_scan(RadioReadiness::READY),
            Err(LinkError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_scan_timeout_reported_once() {
        let mut m = machine();
        let actions = m.start_scan(RadioReadiness::READY).unwrap();
        assert!(actions.contains(&Action::StartScan {
            service: SLEEP_SERVICE_UUID
        }));
        let generation = generation_of(&actions, Timer::ScanWatchdog);
        let fired = TimerFired {
            timer: Timer::ScanWatchdog,
            generation,
        };

        let actions = m.handle_timer(fired, RadioReadiness::READY);
        assert_eq!(
            actions,
            vec![
                Action::StopScan,
                Action::Notify(LinkStatus::ScanTimeout)
            ]
        );
        assert_eq!(m.state(), ConnectionState::Idle);
        assert_eq!(m.armed_timers(), 0);
        assert_eq!(m.last_failure(), Some(&LinkError::ScanTimeout));

        // A duplicate expiry does nothing.
        assert!(m.handle_timer(fired, RadioReadiness::READY).is_empty());
    }

    #[test]
    fn test_first_matching_advertisement_wins() {
        let mut m = machine();
        m.start_scan(RadioReadiness::READY).unwrap();

        // Non-matching advertisement is ignored.
        let actions = m.handle_event(LinkEvent::ScanResult {
            peer: BleAddress::Real([1; 6]),
            services: vec![Uuid::nil()],
            rssi: None,
        });
        assert!(actions.is_empty());
        assert_eq!(m.state(), ConnectionState::Scanning);

        let actions = m.handle_event(LinkEvent::ScanResult {
            peer: peer(),
            services: vec![SLEEP_SERVICE_UUID],
            rssi: None,
        });
        assert_eq!(actions[0], Action::StopScan);
        assert!(actions.contains(&Action::CancelTimer {
            timer: Timer::ScanWatchdog
        }));
        assert!(actions.contains(&Action::Connect { peer: peer() }));
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(!m.is_armed(Timer::ScanWatchdog));
        assert!(m.is_armed(Timer::ConnectTimeout));

        // A second match in the same cycle is ignored.
        let again = m.handle_event(LinkEvent::ScanResult {
            peer: BleAddress::Real([2; 6]),
            services: vec![SLEEP_SERVICE_UUID],
            rssi: None,
        });
        assert!(again.is_empty());
    }

    #[test]
    fn test_ready_requires_service_and_characteristic() {
        let mut m = machine();
        drive_to_discovery(&mut m);
        let actions = m.handle_event(LinkEvent::ServicesDiscovered {
            peer: peer(),
            status: GattStatus::Success,
            services: vec![GattServiceDef {
                uuid: SLEEP_SERVICE_UUID,
                characteristics: vec![],
            }],
        });
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(actions.contains(&Action::Disconnect { peer: peer() }));
        assert!(actions.contains(&Action::Notify(LinkStatus::Disconnected)));
        // Mismatch counts as a failure before Ready: reconnect scheduled.
        assert!(m.is_armed(Timer::Reconnect));
        assert_eq!(m.last_failure(), Some(&LinkError::ProtocolMismatch));
        assert!(m.handle().is_none());
    }

    #[test]
    fn test_ready_requests_mtu_and_holds_handle() {
        let mut m = machine();
        let actions = drive_to_ready(&mut m);
        assert!(actions.contains(&Action::Notify(LinkStatus::Connected { peer: peer() })));
        assert!(actions.contains(&Action::RequestMtu {
            peer: peer(),
            mtu: 247
        }));
        assert!(m.is_armed(Timer::MtuSettle));
        assert!(!m.is_armed(Timer::ConnectTimeout));
        assert_eq!(
            m.handle(),
            Some(&CharacteristicHandle {
                service: SLEEP_SERVICE_UUID,
                characteristic: SESSION_CHAR_UUID,
            })
        );
    }

    #[test]
    fn test_pending_payload_waits_for_mtu_then_uses_it() {
        let mut m = machine();
        let payload = vec![b'x'; 300];
        // Send before connecting: queues and starts a scan.
        let actions = m.send(payload.clone(), RadioReadiness::READY).unwrap();
        assert!(actions.contains(&Action::StartScan {
            service: SLEEP_SERVICE_UUID
        }));

        drive_to_discovery_from_scanning(&mut m);
        let actions = m.handle_event(LinkEvent::ServicesDiscovered {
            peer: peer(),
            status: GattStatus::Success,
            services: session_services(),
        });
        assert!(writes(&actions).is_empty(), "must wait for MTU outcome");

        let actions = m.handle_event(LinkEvent::MtuChanged {
            peer: peer(),
            mtu: 247,
            status: GattStatus::Success,
        });
        let first = writes(&actions);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].len(), 244);
        assert!(!m.is_armed(Timer::MtuSettle));
    }

    fn drive_to_discovery_from_scanning(m: &mut ConnectionStateMachine) {
        m.handle_event(LinkEvent::ScanResult {
            peer: peer(),
            services: vec![SLEEP_SERVICE_UUID],
            rssi: None,
        });
        m.handle_event(LinkEvent::ConnectionStateChanged {
            peer: peer(),
            connected: true,
            status: GattStatus::Success,
        });
    }

    #[test]
    fn test_mtu_settle_timeout_falls_back_to_default() {
        let mut m = machine();
        let actions = drive_to_ready(&mut m);
        let generation = generation_of(&actions, Timer::MtuSettle);
        let actions = m.send(vec![b'y'; 40], RadioReadiness::READY).unwrap();
        assert!(writes(&actions).is_empty());

        let actions = m.handle_timer(
            TimerFired {
                timer: Timer::MtuSettle,
                generation,
            },
            RadioReadiness::READY,
        );
        let first = writes(&actions);
        assert_eq!(first, vec![vec![b'y'; 17]]);
    }

    #[test]
    fn test_acknowledgment_gates_next_chunk() {
        let mut m = ConnectionStateMachine::new(LinkConfig::default(), false);
        drive_to_ready(&mut m);
        let actions = m.send(vec![1u8; 40], RadioReadiness::READY).unwrap();
        assert_eq!(writes(&actions).len(), 1);
        assert!(m.write_in_flight());

        // Ack for another peer is ignored.
        let stray = m.handle_event(LinkEvent::CharacteristicWrite {
            peer: BleAddress::Real([9; 6]),
            characteristic: SESSION_CHAR_UUID,
            status: GattStatus::Success,
        });
        assert!(stray.is_empty());

        let ack = LinkEvent::CharacteristicWrite {
            peer: peer(),
            characteristic: SESSION_CHAR_UUID,
            status: GattStatus::Success,
        };
        assert_eq!(writes(&m.handle_event(ack.clone())).len(), 1);
        assert_eq!(writes(&m.handle_event(ack.clone())), vec![vec![1u8; 6]]);
        let done = m.handle_event(ack);
        assert!(done.contains(&Action::Notify(LinkStatus::TransferComplete {
            bytes: 40,
            chunks: 3
        })));
        assert!(!m.transfer_active());
    }

    #[test]
    fn test_failed_write_retries_after_delay() {
        let mut m = ConnectionStateMachine::new(LinkConfig::default(), false);
        drive_to_ready(&mut m);
        let first = writes(&m.send(vec![5u8; 10], RadioReadiness::READY).unwrap());

        let actions = m.handle_event(LinkEvent::CharacteristicWrite {
            peer: peer(),
            characteristic: SESSION_CHAR_UUID,
            status: GattStatus::FAILURE,
        });
        assert!(writes(&actions).is_empty());
        assert_eq!(m.last_failure(), Some(&LinkError::WriteFailed));
        let generation = generation_of(&actions, Timer::WriteRetry);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ArmTimer { after, .. } if *after == Duration::from_millis(100)
        )));

        let actions = m.handle_timer(
            TimerFired {
                timer: Timer::WriteRetry,
                generation,
            },
            RadioReadiness::READY,
        );
        assert_eq!(writes(&actions), first);
    }

    #[test]
    fn test_drop_after_ready_requeues_whole_payload_without_reconnect() {
        let mut m = ConnectionStateMachine::new(LinkConfig::default(), false);
        drive_to_ready(&mut m);
        m.send(vec![3u8; 40], RadioReadiness::READY).unwrap();
        m.handle_event(LinkEvent::CharacteristicWrite {
            peer: peer(),
            characteristic: SESSION_CHAR_UUID,
            status: GattStatus::Success,
        });

        let actions = m.handle_event(LinkEvent::ConnectionStateChanged {
            peer: peer(),
            connected: false,
            status: GattStatus::Failure(8),
        });
        assert!(actions.contains(&Action::Notify(LinkStatus::Disconnected)));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.transfer_active());
        assert!(m.has_pending_payload());
        assert!(!m.is_armed(Timer::Reconnect));
        assert!(m.handle().is_none());
        assert_eq!(m.last_failure(), Some(&LinkError::UnsolicitedDisconnect));

        // Next Ready restarts from byte 0.
        m.request_connect(RadioReadiness::READY).unwrap();
        assert_eq!(m.last_failure(), None);
        drive_to_discovery_from_scanning(&mut m);
        let actions = m.handle_event(LinkEvent::ServicesDiscovered {
            peer: peer(),
            status: GattStatus::Success,
            services: session_services(),
        });
        assert_eq!(writes(&actions), vec![vec![3u8; 17]]);
    }

    #[test]
    fn test_drop_before_ready_schedules_reconnect() {
        let mut m = machine();
        m.request_connect(RadioReadiness::READY).unwrap();
        m.handle_event(LinkEvent::ScanResult {
            peer: peer(),
            services: vec![SLEEP_SERVICE_UUID],
            rssi: None,
        });
        let actions = m.handle_event(LinkEvent::ConnectionStateChanged {
            peer: peer(),
            connected: false,
            status: GattStatus::Failure(133),
        });
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ArmTimer { timer: Timer::Reconnect, after, .. } if *after == Duration::from_secs(5)
        )));
        let generation = generation_of(&actions, Timer::Reconnect);

        let actions = m.handle_timer(
            TimerFired {
                timer: Timer::Reconnect,
                generation,
            },
            RadioReadiness::READY,
        );
        assert!(actions.contains(&Action::StartScan {
            service: SLEEP_SERVICE_UUID
        }));
        assert_eq!(m.state(), ConnectionState::Scanning);
    }

    #[test]
    fn test_reconnect_budget_is_bounded() {
        let config = LinkConfig {
            max_reconnect_attempts: Some(2),
            ..LinkConfig::default()
        };
        let mut m = ConnectionStateMachine::new(config, true);
        m.request_connect(RadioReadiness::READY).unwrap();

        let mut last = Vec::new();
        for _ in 0..3 {
            m.handle_event(LinkEvent::ScanResult {
                peer: peer(),
                services: vec![SLEEP_SERVICE_UUID],
                rssi: None,
            });
            last = m.handle_event(LinkEvent::ConnectionStateChanged {
                peer: peer(),
                connected: true,
                status: GattStatus::Failure(133),
            });
            if m.is_armed(Timer::Reconnect) {
                let generation = generation_of(&last, Timer::Reconnect);
                m.handle_timer(
                    TimerFired {
                        timer: Timer::Reconnect,
                        generation,
                    },
                    RadioReadiness::READY,
                );
            }
        }
        assert!(last.contains(&Action::Notify(LinkStatus::ConnectionFailed)));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.armed_timers(), 0);
    }

    #[test]
    fn test_disconnect_from_every_state_clears_timers() {
        let states: Vec<fn(&mut ConnectionStateMachine)> = vec![
            |_m| {},
            |m| {
                m.start_scan(RadioReadiness::READY).unwrap();
            },
            |m| {
                m.start_scan(RadioReadiness::READY).unwrap();
                m.handle_event(LinkEvent::ScanResult {
                    peer: peer(),
                    services: vec![SLEEP_SERVICE_UUID],
                    rssi: None,
                });
            },
            |m| drive_to_discovery(m),
            |m| {
                drive_to_ready(m);
                m.send(vec![0u8; 100], RadioReadiness::READY).unwrap();
            },
            |m| {
                // Disconnected with a reconnect pending.
                drive_to_discovery(m);
                m.handle_event(LinkEvent::ConnectionStateChanged {
                    peer: peer(),
                    connected: false,
                    status: GattStatus::Failure(8),
                });
            },
        ];

        for setup in states {
            let mut m = machine();
            setup(&mut m);
            let had_link = m.state().has_link();
            let actions = m.disconnect();
            assert_eq!(m.state(), ConnectionState::Disconnected);
            assert_eq!(m.armed_timers(), 0);
            assert!(m.handle().is_none());
            assert_eq!(
                actions.contains(&Action::Disconnect { peer: peer() }),
                had_link
            );
            // Idempotent.
            assert!(m.disconnect().is_empty());
        }
    }

    #[test]
    fn test_second_send_rejected_while_queued() {
        let mut m = machine();
        m.send(vec![1], RadioReadiness::READY).unwrap();
        assert_eq!(
            m.send(vec![2], RadioReadiness::READY),
            Err(LinkError::TransferInProgress)
        );
    }

    #[test]
    fn test_send_after_drop_replaces_stale_payload_and_scans() {
        let mut m = ConnectionStateMachine::new(LinkConfig::default(), false);
        drive_to_ready(&mut m);
        m.send(vec![3u8; 40], RadioReadiness::READY).unwrap();
        m.handle_event(LinkEvent::ConnectionStateChanged {
            peer: peer(),
            connected: false,
            status: GattStatus::Failure(8),
        });
        assert!(m.has_pending_payload());

        let actions = m.send(vec![9u8; 10], RadioReadiness::READY).unwrap();
        assert!(actions.contains(&Action::StartScan {
            service: SLEEP_SERVICE_UUID
        }));
        assert_eq!(m.state(), ConnectionState::Scanning);

        drive_to_discovery_from_scanning(&mut m);
        let actions = m.handle_event(LinkEvent::ServicesDiscovered {
            peer: peer(),
            status: GattStatus::Success,
            services: session_services(),
        });
        assert_eq!(writes(&actions), vec![vec![9u8; 10]]);
    }

    #[test]
    fn test_send_with_radio_off_keeps_stale_payload() {
        let mut m = ConnectionStateMachine::new(LinkConfig::default(), false);
        drive_to_ready(&mut m);
        m.send(vec![3u8; 40], RadioReadiness::READY).unwrap();
        m.handle_event(LinkEvent::ConnectionStateChanged {
            peer: peer(),
            connected: false,
            status: GattStatus::Failure(8),
        });
        let off = RadioReadiness {
            enabled: false,
            permissions_granted: true,
        };
        assert_eq!(m.send(vec![9u8; 10], off), Err(LinkError::LinkUnavailable));
        assert!(m.has_pending_payload());
    }

    #[test]
    fn test_disconnect_drops_queued_payload() {
        let mut m = machine();
        m.send(vec![1, 2, 3], RadioReadiness::READY).unwrap();
        assert!(m.has_pending_payload());
        m.disconnect();
        assert!(!m.has_pending_payload());

        let mut m = ConnectionStateMachine::new(LinkConfig::default(), false);
        drive_to_ready(&mut m);
        m.send(vec![0u8; 100], RadioReadiness::READY).unwrap();
        assert!(m.transfer_active());
        m.disconnect();
        assert!(!m.transfer_active());
        assert!(!m.has_pending_payload());
        assert!(m.send(vec![5], RadioReadiness::READY).is_ok());
    }

    #[test]
    fn test_send_without_radio_does_not_queue() {
        let mut m = machine();
        let off = RadioReadiness {
            enabled: false,
            permissions_granted: true,
        };
        assert_eq!(m.send(vec![1], off), Err(LinkError::LinkUnavailable));
        assert!(!m.has_pending_payload());
    }
}
