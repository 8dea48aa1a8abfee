//! One file transfer between two transfer identifiers.
//!
//! # Architecture
//!
//! ```text
//!   Socket ──datagram──▶ TransferSession::handle_datagram ──Vec<Outgoing>──▶ Socket
//!                              │
//!                              ├── DataSender   (Source: DATA out, ACK in)
//!                              ├── DataReceiver (Sink:   DATA in,  ACK out)
//!                              └── LockGuard    (held until the session drops)
//! ```
//!
//! The state machine itself is pure: [`TransferSession::handle_datagram`]
//! takes one inbound datagram and returns the datagrams to send.  Only
//! [`TransferSession::run`] touches a socket, which keeps the protocol rules
//! testable without the network.
//!
//! A session binds to its peer's transfer identifier (the UDP source port)
//! as soon as it is known: the request source on the server, the first reply
//! on the client.  Datagrams from any other endpoint are answered with
//! `ERROR(UNKNOWN_TRANSFER_ID)` and otherwise ignored.

use std::net::SocketAddr;
use std::time::Duration;

use log::Level;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::SessionConfig;
use crate::error::TftpError;
use crate::lock::{FileLocks, LockGuard, LockMode};
use crate::packet::{
    block_number_of, classify, encode_ack, encode_error, encode_rrq, encode_wrq, is_octet,
    ErrorCode, Kind, Packet, OCTET_MODE,
};
use crate::receiver::{DataOutcome, DataReceiver};
use crate::sender::{AckOutcome, DataSender};
use crate::socket::Socket;
use crate::state::{Role, SessionState};
use crate::storage::FileStore;
use crate::timer::RetransmitTimer;

/// A datagram the session wants on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub datagram: Vec<u8>,
    pub dest: SocketAddr,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Distinct DATA blocks sent or accepted.
    pub blocks: u32,
    /// File bytes carried by those blocks.
    pub bytes: u64,
    /// Datagrams sent again, on a duplicate or a timeout.
    pub retransmissions: u32,
    /// Duplicate ACK or DATA datagrams received.
    pub duplicates: u32,
    /// Datagrams rejected for carrying a foreign transfer identifier.
    pub foreign: u32,
}

enum Engine {
    Idle,
    Source(DataSender),
    Sink(DataReceiver),
}

pub struct TransferSession {
    state: SessionState,
    engine: Engine,
    /// Current peer address; its port is the peer TID once bound.
    peer: SocketAddr,
    peer_tid: Option<u16>,
    filename: String,
    config: SessionConfig,
    /// Last datagram sent to the peer, for timer-driven retransmission.
    last_sent: Option<Vec<u8>>,
    failure: Option<TftpError>,
    stats: TransferStats,
    _lock: Option<LockGuard>,
}

impl TransferSession {
    fn new(peer: SocketAddr, config: SessionConfig) -> Self {
        Self {
            state: SessionState::AwaitingRequest,
            engine: Engine::Idle,
            peer,
            peer_tid: None,
            filename: String::new(),
            config,
            last_sent: None,
            failure: None,
            stats: TransferStats::default(),
            _lock: None,
        }
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Server side: a session for the request `datagram` that arrived from
    /// `peer`, plus the first reply (DATA(1), ACK(0) or ERROR).
    pub fn serve(
        datagram: &[u8],
        peer: SocketAddr,
        store: &dyn FileStore,
        locks: &FileLocks,
        config: SessionConfig,
    ) -> (Self, Vec<Outgoing>) {
        let mut session = Self::new(peer, config);
        let replies = session.accept_request(datagram, store, locks);
        (session, replies)
    }

    /// Client side: fetch `remote` from `server` into the local file `local`.
    pub fn read_request(
        server: SocketAddr,
        remote: &str,
        local: &str,
        store: &dyn FileStore,
        config: SessionConfig,
    ) -> Result<(Self, Vec<Outgoing>), TftpError> {
        let writer = store.open_write(local)?;
        let mut session = Self::new(server, config);
        session.engine = Engine::Sink(DataReceiver::new(writer, None));
        Ok(session.start(remote, encode_rrq(remote, OCTET_MODE)))
    }

    /// Client side: send the local file `local` to `server` as `remote`.
    pub fn write_request(
        server: SocketAddr,
        local: &str,
        remote: &str,
        store: &dyn FileStore,
        config: SessionConfig,
    ) -> Result<(Self, Vec<Outgoing>), TftpError> {
        let reader = store.open_read(local)?;
        let mut session = Self::new(server, config);
        session.engine = Engine::Source(DataSender::new(reader));
        Ok(session.start(remote, encode_wrq(remote, OCTET_MODE)))
    }

    fn start(mut self, remote: &str, request: Vec<u8>) -> (Self, Vec<Outgoing>) {
        self.state = SessionState::Transferring;
        self.filename = remote.to_string();
        let initial = self.send(request);
        (self, initial)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `None` until a server session has accepted its request.
    pub fn role(&self) -> Option<Role> {
        match self.engine {
            Engine::Idle => None,
            Engine::Source(_) => Some(Role::Source),
            Engine::Sink(_) => Some(Role::Sink),
        }
    }

    pub fn peer_tid(&self) -> Option<u16> {
        self.peer_tid
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Why the session failed, once it has.
    pub fn failure(&self) -> Option<&TftpError> {
        self.failure.as_ref()
    }

    // -----------------------------------------------------------------------
    // Protocol
    // -----------------------------------------------------------------------

    /// Validate an RRQ/WRQ and open the file.  Mode, access and space are
    /// checked before anything is read or written.
    pub fn accept_request(
        &mut self,
        datagram: &[u8],
        store: &dyn FileStore,
        locks: &FileLocks,
    ) -> Vec<Outgoing> {
        if self.state != SessionState::AwaitingRequest {
            log::debug!("[session] request ignored in state {}", self.state);
            return Vec::new();
        }
        self.peer_tid = Some(self.peer.port());

        let (filename, mode, role) = match Packet::decode(datagram) {
            Ok(Packet::Rrq { filename, mode }) => (filename, mode, Role::Source),
            Ok(Packet::Wrq { filename, mode }) => (filename, mode, Role::Sink),
            Ok(other) => {
                return self.fail(
                    ErrorCode::IllegalOperation,
                    format!("expected RRQ or WRQ, got {}", other.kind()),
                )
            }
            Err(e) => return self.fail(ErrorCode::IllegalOperation, e.to_string()),
        };
        self.filename = filename.clone();
        log::info!(
            "[session] {} {filename:?} from {} ({role})",
            if role == Role::Source { "RRQ" } else { "WRQ" },
            self.peer
        );

        if !is_octet(&mode) {
            return self.fail(
                ErrorCode::IllegalOperation,
                format!("unsupported transfer mode {mode:?}"),
            );
        }

        let lock_mode = match role {
            Role::Source => LockMode::Shared,
            Role::Sink => LockMode::Exclusive,
        };
        match locks.try_lock(&filename, lock_mode) {
            Some(guard) => self._lock = Some(guard),
            None => {
                return self.fail(
                    ErrorCode::AccessViolation,
                    format!("{filename:?} is in use by another transfer"),
                )
            }
        }

        match role {
            Role::Source => {
                let mut sender = match store.open_read(&filename) {
                    Ok(reader) => DataSender::new(reader),
                    Err(e) => return self.fail(e.error_code(), e.to_string()),
                };
                match sender.next_block() {
                    Ok(first) => {
                        self.record_block(sender.in_flight_len());
                        self.engine = Engine::Source(sender);
                        self.state = SessionState::Transferring;
                        self.send(first)
                    }
                    Err(e) => self.fail(e.error_code(), e.to_string()),
                }
            }
            Role::Sink => {
                if store.free_space() == Some(0) {
                    return self.fail(
                        ErrorCode::DiskFull,
                        format!("no space left for {filename:?}"),
                    );
                }
                match store.open_write(&filename) {
                    Ok(writer) => {
                        self.engine = Engine::Sink(DataReceiver::new(writer, Some(0)));
                        self.state = SessionState::Transferring;
                        self.send(encode_ack(0))
                    }
                    Err(e) => self.fail(e.error_code(), e.to_string()),
                }
            }
        }
    }

    /// Feed one inbound datagram; returns what to send in response.
    pub fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> Vec<Outgoing> {
        match self.state {
            SessionState::Transferring => {}
            SessionState::AwaitingRequest => {
                log::debug!("[session] datagram from {from} before any request");
                return Vec::new();
            }
            SessionState::Complete | SessionState::Failed => return Vec::new(),
        }

        match self.peer_tid {
            Some(tid) if from.port() != tid || from.ip() != self.peer.ip() => {
                return self.reject_foreign(datagram, from)
            }
            Some(_) => {}
            None => {
                log::debug!("[session] bound to peer TID {}", from.port());
                self.peer = from;
                self.peer_tid = Some(from.port());
            }
        }

        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => return self.fail(ErrorCode::IllegalOperation, e.to_string()),
        };

        match packet {
            Packet::Error { code, message } => {
                log::warn!("[session] {:?}: peer sent {code}: {message}", self.filename);
                self.state = SessionState::Failed;
                self.last_sent = None;
                self.abort_sink();
                self.failure = Some(TftpError::Remote { code, message });
                Vec::new()
            }
            Packet::Ack { block } if self.role() == Some(Role::Source) => self.on_ack(block),
            Packet::Data { block, payload } if self.role() == Some(Role::Sink) => {
                self.on_data(block, &payload)
            }
            other => self.fail(
                ErrorCode::IllegalOperation,
                format!("unexpected {} during transfer", other.kind()),
            ),
        }
    }

    fn on_ack(&mut self, block: u16) -> Vec<Outgoing> {
        let Engine::Source(sender) = &mut self.engine else {
            return Vec::new();
        };
        let outcome = sender.on_ack(block);
        let in_flight = sender.block();
        let payload_len = sender.in_flight_len();

        match outcome {
            Ok(AckOutcome::Next(datagram)) => {
                self.record_block(payload_len);
                self.send(datagram)
            }
            Ok(AckOutcome::Complete) => {
                self.state = SessionState::Complete;
                self.last_sent = None;
                log::info!(
                    "[session] {:?} sent: {} blocks, {} bytes",
                    self.filename,
                    self.stats.blocks,
                    self.stats.bytes
                );
                Vec::new()
            }
            Ok(AckOutcome::Duplicate(resend)) => {
                self.stats.duplicates += 1;
                match resend {
                    Some(datagram) => {
                        log::debug!("[session] duplicate ACK {block}; resending DATA {in_flight}");
                        self.stats.retransmissions += 1;
                        self.send(datagram)
                    }
                    None => Vec::new(),
                }
            }
            Ok(AckOutcome::Ahead) => self.fail(
                ErrorCode::IllegalOperation,
                format!("ACK {block} is ahead of block {in_flight}"),
            ),
            Err(e) => self.fail(e.error_code(), e.to_string()),
        }
    }

    fn on_data(&mut self, block: u16, payload: &[u8]) -> Vec<Outgoing> {
        let Engine::Sink(receiver) = &mut self.engine else {
            return Vec::new();
        };

        match receiver.on_data(block, payload) {
            Ok(DataOutcome::Accepted { ack, last }) => {
                self.record_block(payload.len());
                if last {
                    self.state = SessionState::Complete;
                    log::info!(
                        "[session] {:?} received: {} blocks, {} bytes",
                        self.filename,
                        self.stats.blocks,
                        self.stats.bytes
                    );
                }
                self.send(ack)
            }
            Ok(DataOutcome::Duplicate(resend)) => {
                self.stats.duplicates += 1;
                match resend {
                    Some(ack) => {
                        log::debug!("[session] duplicate DATA {block}; re-acknowledging");
                        self.stats.retransmissions += 1;
                        self.send(ack)
                    }
                    None => Vec::new(),
                }
            }
            Ok(DataOutcome::Corrupt) => self.fail(
                ErrorCode::IllegalOperation,
                format!("DATA {block} does not match the block acknowledged under that number"),
            ),
            Ok(DataOutcome::Ahead) => self.fail(
                ErrorCode::IllegalOperation,
                format!("DATA {block} is ahead of the expected block"),
            ),
            Err(e) => self.fail(e.error_code(), e.to_string()),
        }
    }

    /// Answer a datagram from the wrong endpoint without touching the transfer.
    fn reject_foreign(&mut self, datagram: &[u8], from: SocketAddr) -> Vec<Outgoing> {
        self.stats.foreign += 1;
        log::warn!(
            "[session] {:?}: datagram from unknown TID {from} (bound to {})",
            self.filename,
            self.peer
        );
        // Never answer an ERROR with an ERROR.
        if classify(datagram) == Kind::Error {
            return Vec::new();
        }
        vec![Outgoing {
            datagram: encode_error(ErrorCode::UnknownTransferId, ""),
            dest: from,
        }]
    }

    /// Fail the session and produce the ERROR for the peer.
    fn fail(&mut self, code: ErrorCode, message: String) -> Vec<Outgoing> {
        log::warn!("[session] {:?}: {code}: {message}", self.filename);
        self.state = SessionState::Failed;
        self.last_sent = None;
        self.abort_sink();
        let datagram = encode_error(code, &message);
        self.failure = Some(TftpError::Local { code, message });
        vec![Outgoing {
            datagram,
            dest: self.peer,
        }]
    }

    fn send(&mut self, datagram: Vec<u8>) -> Vec<Outgoing> {
        self.last_sent = Some(datagram.clone());
        vec![Outgoing {
            datagram,
            dest: self.peer,
        }]
    }

    fn record_block(&mut self, payload_len: usize) {
        self.stats.blocks += 1;
        self.stats.bytes += payload_len as u64;
    }

    fn abort_sink(&mut self) {
        if let Engine::Sink(receiver) = &mut self.engine {
            receiver.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Driving the session over a socket
    // -----------------------------------------------------------------------

    /// Send `initial`, then exchange datagrams on `socket` until the session
    /// completes or fails.
    pub async fn run(
        mut self,
        socket: Socket,
        initial: Vec<Outgoing>,
    ) -> Result<TransferStats, TftpError> {
        if let Err(e) = self.drive(&socket, initial).await {
            self.state = SessionState::Failed;
            self.abort_sink();
            return Err(e);
        }

        if self.state == SessionState::Complete && self.role() == Some(Role::Sink) {
            if let Some(policy) = self.config.retransmit {
                self.linger(&socket, policy.linger()).await;
            }
        }
        self.into_result()
    }

    async fn drive(&mut self, socket: &Socket, initial: Vec<Outgoing>) -> Result<(), TftpError> {
        for out in &initial {
            self.transmit(socket, out).await?;
        }

        let mut timer = self.config.retransmit.map(RetransmitTimer::new);
        while !self.state.is_terminal() {
            let received = match timer.as_ref() {
                Some(t) => timeout(t.current_timeout(), socket.recv_from()).await.ok(),
                None => Some(socket.recv_from().await),
            };
            let Some(received) = received else {
                self.on_timeout(socket, timer.as_mut()).await?;
                continue;
            };

            let (datagram, from) = received?;
            self.trace("←", &datagram, from);
            let from_peer = self.peer_tid.map_or(true, |tid| tid == from.port());
            for out in self.handle_datagram(&datagram, from) {
                self.transmit(socket, &out).await?;
            }
            if from_peer {
                if let Some(t) = timer.as_mut() {
                    t.reset();
                }
            }
        }
        Ok(())
    }

    async fn on_timeout(
        &mut self,
        socket: &Socket,
        timer: Option<&mut RetransmitTimer>,
    ) -> Result<(), TftpError> {
        let Some(timer) = timer else {
            return Ok(());
        };
        if !timer.back_off() {
            log::warn!(
                "[session] {:?}: peer silent after {} retransmissions",
                self.filename,
                timer.retries()
            );
            return Err(TftpError::Timeout(timer.retries()));
        }
        if let Some(datagram) = self.last_sent.clone() {
            log::debug!(
                "[session] timeout; retransmitting (next wait {:?})",
                timer.current_timeout()
            );
            self.stats.retransmissions += 1;
            let out = Outgoing {
                datagram,
                dest: self.peer,
            };
            self.transmit(socket, &out).await?;
        }
        Ok(())
    }

    /// Keep re-acknowledging a repeated final DATA for a while after
    /// completing, in case our last ACK was lost.
    async fn linger(&mut self, socket: &Socket, wait: Duration) {
        let Some(final_ack) = self.last_sent.clone() else {
            return;
        };
        let final_block = block_number_of(&final_ack);
        let deadline = Instant::now() + wait;
        while let Ok(Ok((datagram, from))) = timeout_at(deadline, socket.recv_from()).await {
            if Some(from.port()) != self.peer_tid {
                continue;
            }
            if classify(&datagram) == Kind::Data && block_number_of(&datagram) == final_block {
                log::debug!("[session] final DATA repeated; re-sending last ACK");
                self.stats.retransmissions += 1;
                if socket.send_to(&final_ack, from).await.is_err() {
                    break;
                }
            }
        }
    }

    async fn transmit(&mut self, socket: &Socket, out: &Outgoing) -> Result<(), TftpError> {
        self.trace("→", &out.datagram, out.dest);
        socket.send_to(&out.datagram, out.dest).await?;
        Ok(())
    }

    fn trace(&self, arrow: &str, datagram: &[u8], addr: SocketAddr) {
        let level = if self.config.verbose {
            Level::Info
        } else {
            Level::Debug
        };
        let summary = Packet::decode(datagram)
            .map(|p| p.to_string())
            .unwrap_or_else(|_| format!("{} ({} bytes)", classify(datagram), datagram.len()));
        log::log!(level, "[session] {arrow} {summary} {addr}");
    }

    fn into_result(mut self) -> Result<TransferStats, TftpError> {
        match self.state {
            SessionState::Complete => Ok(self.stats),
            state => Err(self.failure.take().unwrap_or_else(|| TftpError::Local {
                code: ErrorCode::NotDefined,
                message: format!("session ended in state {state}"),
            })),
        }
    }
}
