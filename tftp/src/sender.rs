//! Outbound block state for the source side of a transfer.
//!
//! [`DataSender`] reads the file block by block and keeps the single
//! in-flight DATA datagram.  It does **not** touch the socket;
//! [`crate::session::TransferSession`] calls these methods and owns delivery.
//!
//! # Stop-and-wait contract
//! - At most **one** DATA is in flight at any moment.
//! - The next block is read only after the in-flight one is acknowledged.
//! - An ACK for an earlier block means the peer missed our DATA: resend it,
//!   once per duplicate ACK.
//! - A short block (fewer than 512 bytes, possibly zero) is the last one.

use crate::packet::{encode_data, HEADER_LEN};
use crate::state::is_behind;
use crate::storage::{BlockReader, StorageError};

/// What the session should do with an inbound ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The in-flight block was acknowledged; send this next DATA.
    Next(Vec<u8>),
    /// The final block was acknowledged.
    Complete,
    /// Duplicate ACK for an earlier block; retransmit the in-flight DATA
    /// (`None` when nothing has been sent yet).
    Duplicate(Option<Vec<u8>>),
    /// ACK for a block that was never sent.
    Ahead,
}

pub struct DataSender {
    reader: Box<dyn BlockReader>,
    /// Number of the in-flight block; 0 before the first DATA.
    block: u16,
    in_flight: Option<Vec<u8>>,
    finished: bool,
}

impl DataSender {
    pub fn new(reader: Box<dyn BlockReader>) -> Self {
        Self {
            reader,
            block: 0,
            in_flight: None,
            finished: false,
        }
    }

    /// Read the next block and encode it as the new in-flight DATA.
    pub fn next_block(&mut self) -> Result<Vec<u8>, StorageError> {
        let (payload, last) = self.reader.read_block()?;
        self.block = self.block.wrapping_add(1);
        self.finished = last;
        let datagram = encode_data(self.block, &payload);
        self.in_flight = Some(datagram.clone());
        Ok(datagram)
    }

    /// Process an inbound ACK number.
    pub fn on_ack(&mut self, block: u16) -> Result<AckOutcome, StorageError> {
        if block == self.block {
            if self.in_flight.is_some() && self.finished {
                return Ok(AckOutcome::Complete);
            }
            return self.next_block().map(AckOutcome::Next);
        }
        if is_behind(block, self.block) {
            return Ok(AckOutcome::Duplicate(self.in_flight.clone()));
        }
        Ok(AckOutcome::Ahead)
    }

    /// Number of the in-flight block.
    pub fn block(&self) -> u16 {
        self.block
    }

    /// Payload length of the in-flight DATA.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight
            .as_ref()
            .map_or(0, |d| d.len().saturating_sub(HEADER_LEN))
    }

    /// `true` once the in-flight block is the last one.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{block_number_of, BLOCK_SIZE};
    use crate::storage::{FileStore, MemoryStore};

    fn sender_for(len: usize) -> DataSender {
        let store = MemoryStore::new();
        store.insert("f", vec![0xabu8; len]);
        DataSender::new(store.open_read("f").unwrap())
    }

    #[test]
    fn walks_blocks_until_final_ack() {
        let mut tx = sender_for(BLOCK_SIZE + 3);
        let first = tx.next_block().unwrap();
        assert_eq!(block_number_of(&first), Some(1));
        assert_eq!(tx.in_flight_len(), BLOCK_SIZE);

        match tx.on_ack(1).unwrap() {
            AckOutcome::Next(d) => assert_eq!(block_number_of(&d), Some(2)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(tx.is_finished());
        assert_eq!(tx.on_ack(2).unwrap(), AckOutcome::Complete);
    }

    #[test]
    fn duplicate_ack_resends_in_flight_block() {
        let mut tx = sender_for(3 * BLOCK_SIZE);
        tx.next_block().unwrap();
        let second = match tx.on_ack(1).unwrap() {
            AckOutcome::Next(d) => d,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(tx.on_ack(1).unwrap(), AckOutcome::Duplicate(Some(second)));
        assert_eq!(tx.block(), 2);
    }

    #[test]
    fn future_ack_is_rejected() {
        let mut tx = sender_for(10);
        tx.next_block().unwrap();
        assert_eq!(tx.on_ack(7).unwrap(), AckOutcome::Ahead);
    }

    #[test]
    fn ack_zero_starts_a_write() {
        // Client side of a WRQ: the server's ACK(0) releases block 1.
        let mut tx = sender_for(0);
        match tx.on_ack(0).unwrap() {
            AckOutcome::Next(d) => {
                assert_eq!(block_number_of(&d), Some(1));
                assert_eq!(d.len(), HEADER_LEN);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tx.on_ack(1).unwrap(), AckOutcome::Complete);
    }
}
