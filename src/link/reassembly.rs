//! Receiver-side reassembly
//!
//! Writes carry no length, sequence number or terminator. Each peer's bytes
//! are appended to one accumulator and the whole buffer is re-parsed after
//! every write; the first time it forms a complete JSON object, that object
//! is the message and the accumulator starts over.
//!
//! A sender whose payload has a structurally complete prefix would be cut
//! short by this rule. Session payloads are single top-level objects, so
//! only the final chunk can close them.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::ble::transport::BleAddress;

/// A structurally complete message taken out of an accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteMessage {
    pub raw: Vec<u8>,
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reassembly {
    /// Still waiting for more fragments.
    Incomplete { buffered: usize },
    Complete(CompleteMessage),
    /// The accumulator exceeded its cap and was discarded.
    Overflow { dropped: usize },
}

/// Raw bytes received from one peer since the last complete message.
#[derive(Debug, Default)]
pub struct InboundAccumulator {
    buf: Vec<u8>,
}

impl InboundAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append a fragment and test the whole buffer for completeness.
    pub fn push(&mut self, fragment: &[u8], max_bytes: usize) -> Reassembly {
        self.buf.extend_from_slice(fragment);
        if self.buf.len() > max_bytes {
            let dropped = self.buf.len();
            self.buf = Vec::new();
            return Reassembly::Overflow { dropped };
        }
        match try_parse(&self.buf) {
            Some(body) => {
                let raw = std::mem::take(&mut self.buf);
                Reassembly::Complete(CompleteMessage { raw, body })
            }
            None => Reassembly::Incomplete {
                buffered: self.buf.len(),
            },
        }
    }
}

/// Parse `buf` as one JSON object, or `None` if it is not (yet) one.
fn try_parse(buf: &[u8]) -> Option<Map<String, Value>> {
    // An object can only be complete once its closing brace has arrived.
    let last = buf.iter().rev().find(|b| !b.is_ascii_whitespace())?;
    if *last != b'}' {
        return None;
    }
    serde_json::from_slice::<Map<String, Value>>(buf).ok()
}

/// Accumulators for every connected peer.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    peers: HashMap<BleAddress, InboundAccumulator>,
    max_bytes: usize,
}

impl ReassemblyBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_bytes,
        }
    }

    /// Peer connected: start from an empty accumulator.
    pub fn on_connected(&mut self, peer: &BleAddress) {
        self.peers.entry(peer.clone()).or_default().reset();
    }

    pub fn on_disconnected(&mut self, peer: &BleAddress) {
        if let Some(acc) = self.peers.remove(peer) {
            if !acc.is_empty() {
                log::warn!(
                    "Peer {} disconnected with {} bytes of an incomplete message",
                    peer,
                    acc.len()
                );
            }
        }
    }

    pub fn on_write(&mut self, peer: &BleAddress, fragment: &[u8]) -> Reassembly {
        let max_bytes = self.max_bytes;
        let acc = self.peers.entry(peer.clone()).or_default();
        let outcome = acc.push(fragment, max_bytes);
        if let Reassembly::Overflow { dropped } = &outcome {
            log::warn!(
                "Discarding {} buffered bytes from {}: exceeds {} byte limit",
                dropped,
                peer,
                max_bytes
            );
        }
        outcome
    }

    pub fn buffered(&self, peer: &BleAddress) -> Option<usize> {
        self.peers.get(peer).map(InboundAccumulator::len)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Every tracked peer with its buffered byte count.
    pub fn peers(&self) -> impl Iterator<Item = (BleAddress, usize)> + '_ {
        self.peers.iter().map(|(peer, acc)| (peer.clone(), acc.len()))
    }
}
