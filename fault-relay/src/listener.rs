//! Relay accept loop: one [`RelaySession`] per inbound request.

use std::net::SocketAddr;

use tokio::task::JoinSet;

use tftp::socket::Socket;

use crate::registry::ModificationRegistry;
use crate::relay::{RelayConfig, RelayError, RelaySession};

pub struct FaultInjector {
    socket: Socket,
    server: SocketAddr,
    registry: ModificationRegistry,
    config: RelayConfig,
}

impl FaultInjector {
    pub async fn bind(
        listen: SocketAddr,
        server: SocketAddr,
        registry: ModificationRegistry,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let socket = Socket::bind(listen).await?;
        log::info!("[relay] listening on {}, relaying to {server}", socket.local_addr);
        Ok(Self {
            socket,
            server,
            registry,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn registry(&self) -> &ModificationRegistry {
        &self.registry
    }

    /// Accept requests until the task is dropped or aborted, which also
    /// tears down every running relay session.
    pub async fn run(self) -> Result<(), RelayError> {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                received = self.socket.recv_from() => match received {
                    Ok((request, client)) => {
                        sessions.spawn(relay_client(
                            request,
                            client,
                            self.server,
                            self.registry.clone(),
                            self.config.clone(),
                        ));
                    }
                    Err(e) => log::error!("[relay] receive failed: {e}"),
                },
                Some(joined) = sessions.join_next() => {
                    if let Err(e) = joined {
                        log::error!("[relay] session crashed: {e}");
                    }
                }
            }
        }
    }
}

async fn relay_client(
    request: Vec<u8>,
    client: SocketAddr,
    server: SocketAddr,
    registry: ModificationRegistry,
    config: RelayConfig,
) {
    let session = match RelaySession::start(request, client, server, registry, config).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("[relay] cannot open relay for {client}: {e}");
            return;
        }
    };
    if let Err(e) = session.run().await {
        log::warn!("[relay] session for {client} failed: {e}");
    }
}
