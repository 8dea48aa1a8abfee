//! Accept loop.
//!
//! The well-known socket only ever reads requests.  Each datagram is handed to
//! a worker task that binds a fresh ephemeral socket (its TID), runs one
//! [`TransferSession`] to completion and exits.  Nothing a worker does can
//! stop the loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config::{ServerConfig, SessionConfig};
use crate::error::TftpError;
use crate::lock::FileLocks;
use crate::session::TransferSession;
use crate::socket::Socket;
use crate::storage::FileStore;

pub struct Server {
    socket: Socket,
    store: Arc<dyn FileStore>,
    locks: FileLocks,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig, store: Arc<dyn FileStore>) -> Result<Self, TftpError> {
        let socket = Socket::bind(config.bind).await?;
        log::info!("[server] listening on {}", socket.local_addr);
        Ok(Self {
            socket,
            store,
            locks: FileLocks::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Serve requests until the task is dropped or aborted.  Aborting it also
    /// aborts every running worker.
    pub async fn run(self) -> Result<(), TftpError> {
        let mut workers = JoinSet::new();
        let worker_ip = self.socket.local_addr.ip();

        loop {
            tokio::select! {
                received = self.socket.recv_from() => match received {
                    Ok((datagram, peer)) => {
                        log::debug!(
                            "[server] {} bytes from {peer}; spawning worker",
                            datagram.len()
                        );
                        workers.spawn(serve_request(
                            datagram,
                            peer,
                            SocketAddr::new(worker_ip, 0),
                            Arc::clone(&self.store),
                            self.locks.clone(),
                            self.config.session.clone(),
                        ));
                    }
                    Err(e) => log::error!("[server] receive failed: {e}"),
                },
                Some(joined) = workers.join_next() => {
                    if let Err(e) = joined {
                        log::error!("[server] worker crashed: {e}");
                    }
                }
            }
        }
    }
}

async fn serve_request(
    datagram: Vec<u8>,
    peer: SocketAddr,
    bind: SocketAddr,
    store: Arc<dyn FileStore>,
    locks: FileLocks,
    config: SessionConfig,
) {
    let socket = match Socket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("[server] cannot bind transfer socket for {peer}: {e}");
            return;
        }
    };
    let tid = socket.tid();
    let (session, replies) =
        TransferSession::serve(&datagram, peer, store.as_ref(), &locks, config);
    let filename = session.filename().to_string();

    match session.run(socket, replies).await {
        Ok(stats) => log::info!(
            "[server] TID {tid}: {filename:?} for {peer} done \
             ({} blocks, {} bytes, {} retransmissions)",
            stats.blocks,
            stats.bytes,
            stats.retransmissions
        ),
        Err(e) => log::warn!("[server] TID {tid}: {filename:?} for {peer} failed: {e}"),
    }
}
