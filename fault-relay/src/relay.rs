//! One relayed transfer with faults injected on both legs.
//!
//! # Architecture
//!
//! ```text
//!  client ◀──▶ client_side ┐                  ┌ server_side ◀──▶ server
//!                          └─ RelaySession ───┘
//!                               │
//!                               └── ModificationRegistry (shared, head-only)
//! ```
//!
//! Each session gets two fresh ephemeral sockets.  The client talks to
//! `client_side`; the server sees `server_side`'s port as the client's TID.
//! The first server reply fixes the server's TID for the rest of the
//! session, and every datagram on either leg is offered to the registry
//! before it is forwarded.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::Level;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use tftp::packet::{block_number_of, classify, is_terminal_data, Kind, Packet};
use tftp::socket::Socket;

use crate::registry::ModificationRegistry;
use crate::rule::Mutation;

// ---------------------------------------------------------------------------
// Config, outcome, errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hold time for `delayed` rules.
    pub delay: Duration,
    /// End the session after this long without traffic on either leg.
    pub idle_timeout: Duration,
    /// How long to wait for the peer's answer to an unknown-TID delivery.
    pub probe_timeout: Duration,
    /// Whether a `lost` rule ends the session.
    pub end_on_loss: bool,
    /// Log every forwarded datagram at `info` instead of `debug`.
    pub verbose: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            end_on_loss: true,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The ACK of the final DATA block was forwarded.
    Completed,
    /// An ERROR was forwarded.
    PeerError,
    /// A datagram was dropped and the session was told to stop there.
    Lost,
    /// A datagram went out from a throwaway socket; `reply` is what the peer
    /// sent back to it, if anything.
    TidProbe { reply: Option<Vec<u8>> },
    /// No traffic on either leg for the idle timeout.
    IdleTimeout,
}

impl fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayOutcome::Completed => f.write_str("transfer completed"),
            RelayOutcome::PeerError => f.write_str("ERROR forwarded"),
            RelayOutcome::Lost => f.write_str("datagram lost"),
            RelayOutcome::TidProbe { reply: Some(reply) } => {
                write!(f, "unknown-TID probe answered with {}", describe(reply))
            }
            RelayOutcome::TidProbe { reply: None } => f.write_str("unknown-TID probe unanswered"),
            RelayOutcome::IdleTimeout => f.write_str("idle timeout"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    ToServer,
    ToClient,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Leg::ToServer => "client → server",
            Leg::ToClient => "server → client",
        })
    }
}

enum Event {
    Client((Vec<u8>, SocketAddr)),
    Server((Vec<u8>, SocketAddr)),
    Idle,
}

// ---------------------------------------------------------------------------
// RelaySession
// ---------------------------------------------------------------------------

pub struct RelaySession {
    client: SocketAddr,
    server: SocketAddr,
    server_tid: Option<u16>,
    client_side: Arc<Socket>,
    server_side: Arc<Socket>,
    registry: ModificationRegistry,
    config: RelayConfig,
    request: Option<Vec<u8>>,
    /// Block number of the short DATA that ends the file, once seen.
    terminal_block: Option<u16>,
}

impl RelaySession {
    /// Bind both legs for the client that sent `request`.  Nothing is
    /// forwarded until [`RelaySession::run`].
    pub async fn start(
        request: Vec<u8>,
        client: SocketAddr,
        server: SocketAddr,
        registry: ModificationRegistry,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let client_side = Socket::bind(wildcard(client)).await?;
        let server_side = Socket::bind(wildcard(server)).await?;
        log::info!(
            "[relay] {client} ⇄ :{} | :{} ⇄ {server}",
            client_side.tid(),
            server_side.tid()
        );
        Ok(Self {
            client,
            server,
            server_tid: None,
            client_side: Arc::new(client_side),
            server_side: Arc::new(server_side),
            registry,
            config,
            request: Some(request),
            terminal_block: None,
        })
    }

    /// The address the client exchanges datagrams with.
    pub fn client_side_addr(&self) -> SocketAddr {
        self.client_side.local_addr
    }

    /// The address the server sees as the client's TID.
    pub fn server_side_addr(&self) -> SocketAddr {
        self.server_side.local_addr
    }

    /// Forward the initial request, then shuttle datagrams until a teardown
    /// condition is reached.
    pub async fn run(mut self) -> Result<RelayOutcome, RelayError> {
        if let Some(request) = self.request.take() {
            if let Some(outcome) = self.relay(Leg::ToServer, request).await? {
                return Ok(self.finish(outcome));
            }
        }

        let client_side = Arc::clone(&self.client_side);
        let server_side = Arc::clone(&self.server_side);
        loop {
            let event = tokio::select! {
                received = client_side.recv_from() => Event::Client(received?),
                received = server_side.recv_from() => Event::Server(received?),
                _ = sleep(self.config.idle_timeout) => Event::Idle,
            };

            let outcome = match event {
                Event::Client((datagram, from)) => {
                    if from != self.client {
                        log::warn!("[relay] dropping datagram from stranger {from} (client leg)");
                        continue;
                    }
                    self.relay(Leg::ToServer, datagram).await?
                }
                Event::Server((datagram, from)) => {
                    if !self.accept_server(from) {
                        continue;
                    }
                    self.relay(Leg::ToClient, datagram).await?
                }
                Event::Idle => Some(RelayOutcome::IdleTimeout),
            };
            if let Some(outcome) = outcome {
                return Ok(self.finish(outcome));
            }
        }
    }

    fn finish(&self, outcome: RelayOutcome) -> RelayOutcome {
        log::info!("[relay] {} session over: {outcome}", self.client);
        outcome
    }

    /// Learn the server TID from the first reply; refuse anyone else after.
    fn accept_server(&mut self, from: SocketAddr) -> bool {
        if from.ip() != self.server.ip() {
            log::warn!("[relay] dropping datagram from {from}: not the server");
            return false;
        }
        match self.server_tid {
            Some(tid) if tid == from.port() => true,
            Some(tid) => {
                log::warn!("[relay] dropping reply from {from}: server TID is {tid}");
                false
            }
            None => {
                log::debug!("[relay] server TID is {}", from.port());
                self.server_tid = Some(from.port());
                true
            }
        }
    }

    fn dest(&self, leg: Leg) -> SocketAddr {
        match (leg, self.server_tid) {
            (Leg::ToClient, _) => self.client,
            (Leg::ToServer, Some(tid)) => SocketAddr::new(self.server.ip(), tid),
            (Leg::ToServer, None) => self.server,
        }
    }

    fn socket(&self, leg: Leg) -> &Arc<Socket> {
        match leg {
            Leg::ToServer => &self.server_side,
            Leg::ToClient => &self.client_side,
        }
    }

    /// Offer `datagram` to the registry, then deliver it (or not).
    async fn relay(
        &mut self,
        leg: Leg,
        datagram: Vec<u8>,
    ) -> Result<Option<RelayOutcome>, RelayError> {
        let dest = self.dest(leg);
        let Some(rule) = self.registry.dequeue_if_matched(&datagram) else {
            self.forward(leg, &datagram, dest).await?;
            return Ok(self.after_forward(&datagram));
        };
        log::info!("[relay] {leg}: {rule} hits {}", describe(&datagram));

        match rule.mutation {
            Mutation::UnknownTransferId => {
                let reply = self.probe(&datagram, dest).await?;
                Ok(Some(RelayOutcome::TidProbe { reply }))
            }
            Mutation::Delayed => {
                let socket = Arc::clone(self.socket(leg));
                let delay = self.config.delay;
                let held = datagram.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    if let Err(e) = socket.send_to(&held, dest).await {
                        log::warn!("[relay] delayed delivery to {dest} failed: {e}");
                    }
                });
                Ok(self.after_forward(&datagram))
            }
            Mutation::Duplicated => {
                self.forward(leg, &datagram, dest).await?;
                self.forward(leg, &datagram, dest).await?;
                Ok(self.after_forward(&datagram))
            }
            Mutation::Lost => Ok(self.config.end_on_loss.then_some(RelayOutcome::Lost)),
            content => {
                let bytes = content.corrupt(&datagram).unwrap_or(datagram);
                self.forward(leg, &bytes, dest).await?;
                Ok(self.after_forward(&bytes))
            }
        }
    }

    async fn forward(&self, leg: Leg, datagram: &[u8], dest: SocketAddr) -> Result<(), RelayError> {
        let level = if self.config.verbose {
            Level::Info
        } else {
            Level::Debug
        };
        log::log!(level, "[relay] {leg}: {} → {dest}", describe(datagram));
        self.socket(leg).send_to(datagram, dest).await?;
        Ok(())
    }

    /// Teardown bookkeeping for a datagram that was sent on.
    fn after_forward(&mut self, datagram: &[u8]) -> Option<RelayOutcome> {
        match classify(datagram) {
            Kind::Error => Some(RelayOutcome::PeerError),
            Kind::Data if is_terminal_data(datagram) => {
                self.terminal_block = block_number_of(datagram);
                None
            }
            Kind::Ack
                if self.terminal_block.is_some()
                    && block_number_of(datagram) == self.terminal_block =>
            {
                Some(RelayOutcome::Completed)
            }
            _ => None,
        }
    }

    /// Deliver `datagram` from a throwaway socket and collect the answer.
    async fn probe(
        &self,
        datagram: &[u8],
        dest: SocketAddr,
    ) -> Result<Option<Vec<u8>>, RelayError> {
        let stranger = Socket::bind(wildcard(dest)).await?;
        log::info!("[relay] delivering to {dest} from throwaway TID {}", stranger.tid());
        stranger.send_to(datagram, dest).await?;

        match timeout(self.config.probe_timeout, stranger.recv_from()).await {
            Ok(received) => {
                let (reply, from) = received?;
                log::info!("[relay] {from} answered the stranger with {}", describe(&reply));
                Ok(Some(reply))
            }
            Err(_) => {
                log::warn!(
                    "[relay] no answer to the stranger within {:?}",
                    self.config.probe_timeout
                );
                Ok(None)
            }
        }
    }
}

/// Ephemeral-port bind address in the same family as `peer`.
fn wildcard(peer: SocketAddr) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

fn describe(datagram: &[u8]) -> String {
    Packet::decode(datagram)
        .map(|p| p.to_string())
        .unwrap_or_else(|_| format!("{} ({} bytes)", classify(datagram), datagram.len()))
}
