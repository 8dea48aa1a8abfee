//! Error type shared by sessions, the server and the client.
//!
//! A protocol failure shows up twice: the peer receives an ERROR datagram
//! and the local caller receives the matching [`TftpError::Local`]
//! ([`TftpError::Remote`] when the peer aborted first).

use std::io;

use thiserror::Error;

use crate::packet::ErrorCode;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum TftpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// This side aborted the transfer and told the peer so.
    #[error("transfer aborted: {code}: {message}")]
    Local { code: ErrorCode, message: String },

    /// The peer aborted the transfer with an ERROR datagram.
    #[error("peer aborted transfer: {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("no response from peer after {0} retransmissions")]
    Timeout(u32),
}

impl TftpError {
    /// Wire error code associated with this failure, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TftpError::Local { code, .. } | TftpError::Remote { code, .. } => Some(*code),
            TftpError::Storage(e) => Some(e.error_code()),
            _ => None,
        }
    }
}
