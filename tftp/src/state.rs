//! Transfer session state and sequencing helpers.
//!
//! ```text
//!  AWAITING_REQUEST ──valid RRQ/WRQ──▶ TRANSFERRING ──final ACK / final DATA──▶ COMPLETE
//!          │                                │
//!          └──── rejected request ──────────┴──── ERROR sent or received ─────▶ FAILED
//! ```
//!
//! Client sessions are born in `Transferring`: they already know what they
//! asked for.  `Complete` and `Failed` are terminal.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Server side only: the session has a peer but no accepted request yet.
    #[default]
    AwaitingRequest,
    Transferring,
    Complete,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingRequest => "AWAITING_REQUEST",
            SessionState::Transferring => "TRANSFERRING",
            SessionState::Complete => "COMPLETE",
            SessionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Which way file content flows through this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reads the file and sends DATA.
    Source,
    /// Receives DATA and writes the file.
    Sink,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Source => "source",
            Role::Sink => "sink",
        })
    }
}

/// `true` when `block` precedes `reference` in wrapping 16-bit order.
///
/// Half the sequence space counts as "behind", the other half as "ahead".
pub fn is_behind(block: u16, reference: u16) -> bool {
    let distance = reference.wrapping_sub(block);
    distance != 0 && distance <= 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn behind_wraps_around() {
        assert!(is_behind(1, 2));
        assert!(is_behind(65535, 0));
        assert!(!is_behind(2, 2));
        assert!(!is_behind(3, 2));
        assert!(!is_behind(0, 65535));
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionState::AwaitingRequest.is_terminal());
        assert!(!SessionState::Transferring.is_terminal());
        assert!(SessionState::Complete.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert_eq!(SessionState::default(), SessionState::AwaitingRequest);
    }
}
