//! `fault-relay` — a TFTP relay that injects faults between client and server.
//!
//! - [`rule`]     — modification rules and their text form
//! - [`registry`] — head-only FIFO of pending rules, shared by every session
//! - [`relay`]    — one relayed transfer, applying rules on both legs
//! - [`listener`] — accept loop spawning a relay session per client

pub mod listener;
pub mod registry;
pub mod relay;
pub mod rule;

pub use listener::FaultInjector;
pub use registry::ModificationRegistry;
pub use relay::{RelayConfig, RelayError, RelayOutcome, RelaySession};
pub use rule::{ModificationRule, Mutation, RuleParseError, Scope};
