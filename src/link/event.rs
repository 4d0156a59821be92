//! Link event bus
//!
//! Radio callbacks may fire on any thread. Each actor owns one
//! [`LinkEventBus`]: backends push normalized [`LinkEvent`]s through an
//! [`EventSink`], the actor's own timers and the application's commands use
//! an [`InputSender`], and everything lands in one ordered queue that the
//! actor drains serially.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::timer::TimerFired;
use crate::ble::gatt::{GattServiceDef, GattStatus};
use crate::ble::transport::BleAddress;

/// A transport callback, normalized across radio stacks.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// An advertisement seen while scanning.
    ScanResult {
        peer: BleAddress,
        services: Vec<Uuid>,
        rssi: Option<i16>,
    },
    /// The platform aborted the scan.
    ScanFailed { code: i32 },
    /// Link established (`connected`) or lost. A non-success status on a
    /// disconnect means the link dropped rather than being closed.
    ConnectionStateChanged {
        peer: BleAddress,
        connected: bool,
        status: GattStatus,
    },
    ServicesDiscovered {
        peer: BleAddress,
        status: GattStatus,
        services: Vec<GattServiceDef>,
    },
    MtuChanged {
        peer: BleAddress,
        mtu: u16,
        status: GattStatus,
    },
    /// Acknowledgment for the outstanding write on the central side.
    CharacteristicWrite {
        peer: BleAddress,
        characteristic: Uuid,
        status: GattStatus,
    },
    /// Incoming write on the peripheral side.
    WriteRequest {
        peer: BleAddress,
        request_id: u32,
        characteristic: Uuid,
        offset: usize,
        value: Vec<u8>,
        response_needed: bool,
    },
}

impl LinkEvent {
    /// The peer this event concerns, if it is connection-scoped.
    pub fn peer(&self) -> Option<&BleAddress> {
        match self {
            LinkEvent::ScanFailed { .. } => None,
            LinkEvent::ScanResult { peer, .. }
            | LinkEvent::ConnectionStateChanged { peer, .. }
            | LinkEvent::ServicesDiscovered { peer, .. }
            | LinkEvent::MtuChanged { peer, .. }
            | LinkEvent::CharacteristicWrite { peer, .. }
            | LinkEvent::WriteRequest { peer, .. } => Some(peer),
        }
    }
}

/// Everything an actor reacts to.
#[derive(Debug)]
pub enum Input<C> {
    Link(LinkEvent),
    Timer(TimerFired),
    Command(C),
}

/// Cloneable, thread-safe handle radio backends deliver callbacks through.
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(LinkEvent) -> bool + Send + Sync>,
}

impl EventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(LinkEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// A sink backed by a plain channel, for driving backends directly.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(move |event| tx.send(event).is_ok()), rx)
    }

    /// Deliver a callback. Returns false once the owning actor has stopped.
    pub fn emit(&self, event: LinkEvent) -> bool {
        (self.deliver)(event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Sender half used by the owning actor's timers and its public handle.
pub struct InputSender<C> {
    tx: mpsc::UnboundedSender<Input<C>>,
}

impl<C> Clone for InputSender<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> InputSender<C> {
    pub fn command(&self, command: C) -> bool {
        self.tx.send(Input::Command(command)).is_ok()
    }

    pub fn timer(&self, fired: TimerFired) -> bool {
        self.tx.send(Input::Timer(fired)).is_ok()
    }
}

/// Single serialized queue feeding one actor.
pub struct LinkEventBus<C> {
    tx: mpsc::UnboundedSender<Input<C>>,
    rx: mpsc::UnboundedReceiver<Input<C>>,
}

impl<C: Send + 'static> LinkEventBus<C> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Sink to hand to a radio backend.
    pub fn sink(&self) -> EventSink {
        let tx = self.tx.clone();
        EventSink::new(move |event| tx.send(Input::Link(event)).is_ok())
    }

    pub fn sender(&self) -> InputSender<C> {
        InputSender {
            tx: self.tx.clone(),
        }
    }

    /// Next input in arrival order. Never returns `None` while the bus
    /// itself is alive, since it keeps a sender.
    pub async fn next(&mut self) -> Option<Input<C>> {
        self.rx.recv().await
    }
}

impl<C: Send + 'static> Default for LinkEventBus<C> {
    fn default() -> Self {
        Self::new()
    }
}
