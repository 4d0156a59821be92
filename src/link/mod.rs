//! Chunked session transfer over a GATT link
//!
//! The client side ([`client::LinkClient`]) scans for the phone, connects,
//! negotiates a transfer unit and writes a payload chunk by chunk, one
//! acknowledged write at a time. The server side ([`server::LinkServer`])
//! accumulates incoming writes per peer and hands every structurally complete
//! JSON message to a [`SessionStore`](crate::session::store::SessionStore).
//!
//! Protocol decisions live in pure components ([`state`], [`mtu`],
//! [`sender`], [`reassembly`]) so they can be exercised without a radio.

pub mod client;
pub mod event;
pub mod mtu;
pub mod reassembly;
pub mod sender;
pub mod server;
pub mod state;
pub mod timer;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::ble::transport::BleAddress;
use crate::ble::BleError;

pub use client::LinkClient;
pub use server::LinkServer;
pub use state::ConnectionStateMachine;

/// Lifecycle of the client's single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnected,
}

impl ConnectionState {
    /// States from which a new scan may start.
    pub fn can_scan(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Disconnected)
    }

    /// States in which a link to the peer exists or is being set up.
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::DiscoveringServices | ConnectionState::Ready
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse status surfaced to the application layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LinkStatus {
    Connected { peer: BleAddress },
    Disconnected,
    ScanTimeout,
    TransferComplete { bytes: usize, chunks: usize },
    TransferFailed { attempts: u32 },
    /// Connection attempts have stopped; only a manual retry will resume.
    ConnectionFailed,
    HeartRateSample { bpm: i32, timestamp_ms: i64 },
}

/// Why a link operation failed.
///
/// Precondition errors are returned from `request_connect` and `send`.
/// Failures during the link's lifetime reach the application as coarse
/// [`LinkStatus`] events; their cause is kept as
/// [`ConnectionStateMachine::last_failure`] and shown in client snapshots.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Bluetooth permissions not granted")]
    PermissionDenied,

    #[error("Bluetooth radio unavailable")]
    LinkUnavailable,

    #[error("No matching peripheral found before scan timeout")]
    ScanTimeout,

    #[error("Peer does not expose the session service/characteristic")]
    ProtocolMismatch,

    #[error("Characteristic write failed")]
    WriteFailed,

    #[error("Link dropped unexpectedly")]
    UnsolicitedDisconnect,

    #[error("Transfer failed after {attempts} attempts of one chunk")]
    TransferFailed { attempts: u32 },

    #[error("A transfer is already queued or in flight")]
    TransferInProgress,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Link actor has stopped")]
    ActorStopped,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<BleError> for LinkError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::PermissionDenied(_) => LinkError::PermissionDenied,
            BleError::Unavailable(_) => LinkError::LinkUnavailable,
            BleError::Disconnected => LinkError::UnsolicitedDisconnect,
            other => LinkError::Transport(other.to_string()),
        }
    }
}
