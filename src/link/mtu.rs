//! MTU negotiation
//!
//! One request per connection, issued on entry to Ready. A rejected or
//! unsupported request is not retried; the link keeps whatever unit is in
//! effect. The negotiated unit only applies to transfers started afterwards.

use crate::ble::gatt::GattStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuPhase {
    /// No connection has reached Ready yet.
    Idle,
    /// Request issued, outcome pending.
    Requested,
    /// Outcome known (or given up on); transfers may start.
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuOutcome {
    /// Use this unit for subsequent transfers.
    Negotiated(u16),
    /// Keep the current unit.
    Rejected,
}

#[derive(Debug)]
pub struct MtuNegotiator {
    target: u16,
    supported: bool,
    phase: MtuPhase,
}

impl MtuNegotiator {
    pub fn new(target: u16, supported: bool) -> Self {
        Self {
            target,
            supported,
            phase: MtuPhase::Idle,
        }
    }

    pub fn phase(&self) -> MtuPhase {
        self.phase
    }

    pub fn is_settled(&self) -> bool {
        self.phase == MtuPhase::Settled
    }

    /// Connection reached Ready. Returns the unit to request, if any.
    pub fn on_ready(&mut self) -> Option<u16> {
        if self.supported {
            self.phase = MtuPhase::Requested;
            log::debug!("Requesting MTU {}", self.target);
            Some(self.target)
        } else {
            self.phase = MtuPhase::Settled;
            log::debug!("MTU request unsupported, keeping current unit");
            None
        }
    }

    /// An MTU-changed callback arrived. Peer-initiated exchanges are
    /// honoured too.
    pub fn on_changed(&mut self, mtu: u16, status: GattStatus) -> MtuOutcome {
        self.phase = MtuPhase::Settled;
        if status.is_success() && mtu > 0 {
            log::info!("MTU changed to {}", mtu);
            MtuOutcome::Negotiated(mtu)
        } else {
            log::warn!("MTU exchange failed ({:?}), keeping current unit", status);
            MtuOutcome::Rejected
        }
    }

    /// The request could not be issued, or its outcome never came.
    pub fn give_up(&mut self) {
        if self.phase == MtuPhase::Requested {
            log::warn!("No MTU outcome, keeping current unit");
        }
        self.phase = MtuPhase::Settled;
    }

    /// Connection lost; the next connection negotiates afresh.
    pub fn reset(&mut self) {
        self.phase = MtuPhase::Idle;
    }
}
