//! Runtime configuration for sessions, the server and the client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::timer::RetransmitPolicy;

/// Well-known TFTP port the server listens on.
pub const DEFAULT_SERVER_PORT: u16 = 69;

/// Port the fault-injecting relay listens on by default.
pub const DEFAULT_RELAY_PORT: u16 = 23;

/// Settings every transfer session carries.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Log every datagram sent and received at `info` instead of `debug`.
    pub verbose: bool,
    /// Retransmit on silence.  `None` waits for the peer indefinitely.
    pub retransmit: Option<RetransmitPolicy>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_SERVER_PORT),
            session: SessionConfig::default(),
        }
    }
}

/// Where the client sends its initial request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Straight to the server.
    Normal,
    /// Through a fault-injecting relay listening at the given address.
    Relay(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub mode: RunMode,
    /// Local address; port `0` picks a fresh transfer identifier.
    pub bind: SocketAddr,
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        let ip = match server {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self {
            server,
            mode: RunMode::Normal,
            bind: SocketAddr::new(ip, 0),
            session: SessionConfig::default(),
        }
    }

    pub fn via_relay(mut self, relay: SocketAddr) -> Self {
        self.mode = RunMode::Relay(relay);
        self
    }

    /// Destination of the RRQ/WRQ.
    pub fn request_target(&self) -> SocketAddr {
        match self.mode {
            RunMode::Normal => self.server,
            RunMode::Relay(relay) => relay,
        }
    }
}
