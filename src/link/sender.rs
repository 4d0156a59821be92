//! Stop-and-wait chunk sender
//!
//! Splits one payload by the transfer unit captured at start and releases a
//! single chunk at a time. The next chunk is only produced by the
//! acknowledgment of the previous one; failures retry the same chunk at the
//! same cursor after a fixed delay, up to an optional cap.

use std::time::Duration;

use super::LinkError;
use crate::ble::gatt::chunk_payload_size;

/// Split `payload` into writes of at most `chunk_size` bytes.
pub fn split_chunks(payload: &[u8], chunk_size: usize) -> impl Iterator<Item = &[u8]> {
    payload.chunks(chunk_size.max(1))
}

/// What the sender needs done next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStep {
    /// Issue this write and wait for its acknowledgment.
    Write(Vec<u8>),
    /// Re-issue the same chunk after the delay.
    RetryAfter(Duration),
    Complete { bytes: usize, chunks: usize },
    Failed { attempts: u32 },
}

/// One payload on its way to the peer.
#[derive(Debug)]
pub struct OutboundTransfer {
    payload: Vec<u8>,
    cursor: usize,
    chunk_size: usize,
    in_flight: bool,
    retries: u32,
    chunks_acked: usize,
}

impl OutboundTransfer {
    pub fn new(payload: Vec<u8>, mtu: u16) -> Self {
        Self {
            payload,
            cursor: 0,
            chunk_size: chunk_payload_size(mtu),
            in_flight: false,
            retries: 0,
            chunks_acked: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes acknowledged so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.payload.len()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    fn current_chunk(&self) -> &[u8] {
        let end = (self.cursor + self.chunk_size).min(self.payload.len());
        &self.payload[self.cursor..end]
    }
}

#[derive(Debug)]
pub struct ChunkSender {
    transfer: Option<OutboundTransfer>,
    retry_delay: Duration,
    max_retries: Option<u32>,
}

impl ChunkSender {
    pub fn new(retry_delay: Duration, max_retries: Option<u32>) -> Self {
        Self {
            transfer: None,
            retry_delay,
            max_retries,
        }
    }

    pub fn is_active(&self) -> bool {
        self.transfer.is_some()
    }

    /// Whether a write is currently awaiting its acknowledgment.
    pub fn in_flight(&self) -> bool {
        self.transfer.as_ref().map_or(false, |t| t.in_flight)
    }

    pub fn transfer(&self) -> Option<&OutboundTransfer> {
        self.transfer.as_ref()
    }

    /// Start a transfer with the chunk size derived from `mtu`.
    pub fn begin(&mut self, payload: Vec<u8>, mtu: u16) -> Result<SendStep, LinkError> {
        if self.transfer.is_some() {
            return Err(LinkError::TransferInProgress);
        }
        let transfer = OutboundTransfer::new(payload, mtu);
        log::debug!(
            "Starting transfer of {} bytes in chunks of {}",
            transfer.len(),
            transfer.chunk_size()
        );
        self.transfer = Some(transfer);
        Ok(self.next_write())
    }

    /// Acknowledgment for the outstanding write. `None` if nothing was
    /// outstanding (stray or duplicate callback).
    pub fn on_ack(&mut self, success: bool) -> Option<SendStep> {
        let transfer = self.transfer.as_mut().filter(|t| t.in_flight)?;
        transfer.in_flight = false;
        if !success {
            return Some(self.retry_or_fail());
        }
        let sent = transfer.current_chunk().len();
        transfer.cursor += sent;
        transfer.chunks_acked += 1;
        transfer.retries = 0;
        log::trace!("Chunk acknowledged, {}/{} bytes", transfer.cursor, transfer.len());
        Some(self.next_write())
    }

    /// The write for the current chunk could not be issued.
    pub fn on_write_not_issued(&mut self) -> Option<SendStep> {
        let transfer = self.transfer.as_mut().filter(|t| t.in_flight)?;
        transfer.in_flight = false;
        Some(self.retry_or_fail())
    }

    /// The retry delay elapsed; re-issue the same chunk.
    pub fn retry_due(&mut self) -> Option<SendStep> {
        let waiting = self.transfer.as_ref().map_or(false, |t| !t.in_flight);
        if waiting {
            Some(self.next_write())
        } else {
            None
        }
    }

    /// Drop the transfer, returning the whole payload for a fresh start.
    pub fn abandon(&mut self) -> Option<Vec<u8>> {
        self.transfer.take().map(|t| {
            if t.cursor > 0 {
                log::debug!(
                    "Abandoning transfer at {}/{} bytes",
                    t.cursor,
                    t.payload.len()
                );
            }
            t.payload
        })
    }

    fn next_write(&mut self) -> SendStep {
        let Some(transfer) = self.transfer.as_mut() else {
            return SendStep::Failed { attempts: 0 };
        };
        if transfer.is_complete() {
            let done = SendStep::Complete {
                bytes: transfer.len(),
                chunks: transfer.chunks_acked,
            };
            self.transfer = None;
            return done;
        }
        transfer.in_flight = true;
        SendStep::Write(transfer.current_chunk().to_vec())
    }

    fn retry_or_fail(&mut self) -> SendStep {
        let Some(transfer) = self.transfer.as_mut() else {
            return SendStep::Failed { attempts: 0 };
        };
        transfer.retries += 1;
        match self.max_retries {
            Some(max) if transfer.retries > max => {
                let attempts = transfer.retries;
                log::warn!(
                    "Giving up on chunk at byte {} after {} attempts",
                    transfer.cursor,
                    attempts
                );
                self.transfer = None;
                SendStep::Failed { attempts }
            }
            _ => {
                log::debug!(
                    "Chunk at byte {} failed (retry {}), retrying in {:?}",
                    transfer.cursor,
                    transfer.retries,
                    self.retry_delay
                );
                SendStep::RetryAfter(self.retry_delay)
            }
        }
    }
}
