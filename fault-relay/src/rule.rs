//! Modification rules: which datagram to tamper with, and how.
//!
//! Text form, as accepted on the command line and on stdin:
//!
//! ```text
//! DATA 2 invalid-block-number
//! ACK 3 delayed
//! RRQ lost
//! ```
//!
//! Requests carry no block number, so RRQ/WRQ rules omit it.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

use tftp::packet::{block_number_of, classify, opcode, Kind, MAX_DATAGRAM};

/// Whether a mutation rewrites bytes or interferes with delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Packet,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    /// Overwrite the opcode with an unused value.
    InvalidOpcode,
    /// Pad the datagram past the largest legal size.
    InvalidPacketSize,
    /// Decrement the block number.
    InvalidBlockNumber,
    /// Deliver from a throwaway socket so the peer sees a foreign TID.
    UnknownTransferId,
    /// Forward after the configured delay.
    Delayed,
    /// Forward twice.
    Duplicated,
    /// Do not forward.
    Lost,
}

impl Mutation {
    pub const ALL: [Mutation; 7] = [
        Mutation::InvalidOpcode,
        Mutation::InvalidPacketSize,
        Mutation::InvalidBlockNumber,
        Mutation::UnknownTransferId,
        Mutation::Delayed,
        Mutation::Duplicated,
        Mutation::Lost,
    ];

    pub fn scope(self) -> Scope {
        match self {
            Mutation::InvalidOpcode
            | Mutation::InvalidPacketSize
            | Mutation::InvalidBlockNumber
            | Mutation::UnknownTransferId => Scope::Packet,
            Mutation::Delayed | Mutation::Duplicated | Mutation::Lost => Scope::Network,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mutation::InvalidOpcode => "invalid-opcode",
            Mutation::InvalidPacketSize => "invalid-packet-size",
            Mutation::InvalidBlockNumber => "invalid-block-number",
            Mutation::UnknownTransferId => "unknown-transfer-id",
            Mutation::Delayed => "delayed",
            Mutation::Duplicated => "duplicated",
            Mutation::Lost => "lost",
        }
    }

    /// Rewritten bytes for the mutations that change content, `None` for the
    /// ones that only affect delivery.
    pub fn corrupt(self, datagram: &[u8]) -> Option<Vec<u8>> {
        let mut out = datagram.to_vec();
        match self {
            Mutation::InvalidOpcode => {
                if out.len() < 2 {
                    out.resize(2, 0);
                }
                out[1] = rand::rng().random_range(opcode::ERROR + 1..=u8::MAX);
            }
            Mutation::InvalidPacketSize => {
                let len = out.len().max(MAX_DATAGRAM) + 1;
                out.resize(len, 0xff);
            }
            Mutation::InvalidBlockNumber => {
                if out.len() >= 4 {
                    let block = u16::from_be_bytes([out[2], out[3]]).wrapping_sub(1);
                    out[2..4].copy_from_slice(&block.to_be_bytes());
                }
            }
            _ => return None,
        }
        Some(out)
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mutation {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Mutation::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| RuleParseError::Mutation(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("empty rule")]
    Empty,
    #[error("rules target RRQ, WRQ, DATA or ACK, not {0:?}")]
    Kind(String),
    #[error("{0} rules need a block number")]
    MissingBlock(Kind),
    #[error("bad block number {0:?}")]
    Block(String),
    #[error("unknown mutation {0:?}")]
    Mutation(String),
    #[error("unexpected trailing input {0:?}")]
    Trailing(String),
}

/// One queued fault: kind AND block select the datagram, `mutation` says
/// what happens to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationRule {
    pub kind: Kind,
    /// Ignored for RRQ/WRQ.
    pub block: u16,
    pub mutation: Mutation,
}

impl ModificationRule {
    pub fn new(kind: Kind, block: u16, mutation: Mutation) -> Self {
        Self {
            kind,
            block: if kind.is_request() { 0 } else { block },
            mutation,
        }
    }

    pub fn scope(&self) -> Scope {
        self.mutation.scope()
    }

    pub fn matches(&self, datagram: &[u8]) -> bool {
        let kind = classify(datagram);
        if kind != self.kind {
            return false;
        }
        kind.is_request() || block_number_of(datagram) == Some(self.block)
    }
}

impl fmt::Display for ModificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_request() {
            write!(f, "{} {}", self.kind, self.mutation)
        } else {
            write!(f, "{} {} {}", self.kind, self.block, self.mutation)
        }
    }
}

impl FromStr for ModificationRule {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let kind_word = words.next().ok_or(RuleParseError::Empty)?;
        let kind = match kind_word.parse::<Kind>() {
            Ok(k) if k.is_request() || k.has_block() => k,
            _ => return Err(RuleParseError::Kind(kind_word.to_string())),
        };

        let block = if kind.has_block() {
            let word = words.next().ok_or(RuleParseError::MissingBlock(kind))?;
            word.parse::<u16>()
                .map_err(|_| RuleParseError::Block(word.to_string()))?
        } else {
            0
        };

        let mutation = words
            .next()
            .ok_or_else(|| RuleParseError::Mutation(String::new()))?
            .parse()?;

        let rest: Vec<&str> = words.collect();
        if !rest.is_empty() {
            return Err(RuleParseError::Trailing(rest.join(" ")));
        }
        Ok(Self::new(kind, block, mutation))
    }
}
