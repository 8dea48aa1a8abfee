//! `tftp` — a TFTP (RFC 1350) server and client over async UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  DATA   ┌──────────────┐
//!  │  DataSender  │────────▶│ DataReceiver │
//!  └──────┬───────┘         └──────┬───────┘
//!         │         ACK            │
//!         │◀───────────────────────┘
//!         │
//!  ┌──────▼────────────────────────────────┐
//!  │          TransferSession              │
//!  │ (state machine, TID binding, locks)   │
//!  └──────┬────────────────────────────────┘
//!         │ raw UDP datagrams
//!  ┌──────▼────┐
//!  │  Socket   │  (thin async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]   — wire format and the classification grammar
//! - [`session`]  — one transfer, from request to final ACK
//! - [`sender`]   — source-side block state
//! - [`receiver`] — sink-side block state
//! - [`state`]    — session states and sequence arithmetic
//! - [`timer`]    — optional retransmission with back-off
//! - [`storage`]  — file-system collaborator
//! - [`lock`]     — per-file shared/exclusive locks
//! - [`server`]   — accept loop spawning one worker per request
//! - [`client`]   — `get` / `put`
//! - [`socket`]   — async UDP socket abstraction
//! - [`config`]   — runtime settings
//! - [`error`]    — error type

pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod socket;
pub mod state;
pub mod storage;
pub mod timer;

pub use client::Client;
pub use config::{ClientConfig, RunMode, ServerConfig, SessionConfig};
pub use error::TftpError;
pub use packet::{ErrorCode, Kind, Packet};
pub use server::Server;
pub use session::{Outgoing, TransferSession, TransferStats};
pub use storage::{FileStore, LocalStore, MemoryStore};
pub use timer::RetransmitPolicy;
