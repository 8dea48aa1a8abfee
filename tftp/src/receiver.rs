//! Inbound block state for the sink side of a transfer.
//!
//! [`DataReceiver`] writes in-order blocks to the file and decides how to
//! answer everything else:
//! - the expected block is written once and acknowledged;
//! - a repeat of an earlier block is acknowledged again but never rewritten;
//! - a block carrying the last accepted number with a *different* payload is
//!   not a retransmission, it is a corrupted block number;
//! - a block from the future is a protocol violation.
//!
//! Like [`crate::sender::DataSender`] it never touches the socket.

use crate::packet::{encode_ack, BLOCK_SIZE};
use crate::state::is_behind;
use crate::storage::{BlockWriter, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutcome {
    /// Block written; send `ack`.  `last` marks the end of the file.
    Accepted { ack: Vec<u8>, last: bool },
    /// Repeat of an earlier block; resend the previous ACK if there is one.
    Duplicate(Option<Vec<u8>>),
    /// Block number does not fit the content received so far.
    Corrupt,
    /// Block number beyond the expected one.
    Ahead,
}

pub struct DataReceiver {
    writer: Option<Box<dyn BlockWriter>>,
    expected: u16,
    last_ack: Option<u16>,
    last_payload: Vec<u8>,
}

impl DataReceiver {
    /// `acked` is the block already acknowledged before any DATA arrives:
    /// `Some(0)` on a server that answered a WRQ, `None` on a reading client.
    pub fn new(writer: Box<dyn BlockWriter>, acked: Option<u16>) -> Self {
        Self {
            writer: Some(writer),
            expected: acked.map_or(1, |b| b.wrapping_add(1)),
            last_ack: acked,
            last_payload: Vec::new(),
        }
    }

    pub fn on_data(&mut self, block: u16, payload: &[u8]) -> Result<DataOutcome, StorageError> {
        if block == self.expected {
            let last = payload.len() < BLOCK_SIZE;
            if let Some(writer) = self.writer.as_mut() {
                writer.write_block(payload)?;
            }
            if last {
                if let Some(writer) = self.writer.take() {
                    writer.finish()?;
                }
            }
            self.last_ack = Some(block);
            self.last_payload = payload.to_vec();
            self.expected = block.wrapping_add(1);
            return Ok(DataOutcome::Accepted {
                ack: encode_ack(block),
                last,
            });
        }

        match self.last_ack {
            Some(acked) if block == acked && payload != self.last_payload.as_slice() => {
                Ok(DataOutcome::Corrupt)
            }
            Some(acked) if is_behind(block, self.expected) => {
                Ok(DataOutcome::Duplicate(Some(encode_ack(acked))))
            }
            // Nothing accepted yet, so an earlier block cannot be a repeat.
            None if is_behind(block, self.expected) => Ok(DataOutcome::Corrupt),
            _ => Ok(DataOutcome::Ahead),
        }
    }

    /// The block most recently acknowledged.
    pub fn last_ack(&self) -> Option<u16> {
        self.last_ack
    }

    /// Drop whatever was written; used when the transfer fails.
    pub fn abort(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}
