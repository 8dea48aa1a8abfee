//! Client-side transfers: one [`TransferSession`] per `get` or `put`.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::TftpError;
use crate::session::{TransferSession, TransferStats};
use crate::socket::Socket;
use crate::storage::FileStore;

pub struct Client {
    config: ClientConfig,
    store: Arc<dyn FileStore>,
}

impl Client {
    /// `store` holds the local side of every transfer.
    pub fn new(config: ClientConfig, store: Arc<dyn FileStore>) -> Self {
        Self { config, store }
    }

    /// Read `remote` from the server into `local`.
    pub async fn get(&self, remote: &str, local: &str) -> Result<TransferStats, TftpError> {
        let socket = Socket::bind(self.config.bind).await?;
        let target = self.config.request_target();
        log::info!("[client] RRQ {remote:?} → {target} (TID {})", socket.tid());
        let (session, initial) = TransferSession::read_request(
            target,
            remote,
            local,
            self.store.as_ref(),
            self.config.session.clone(),
        )?;
        self.finish(session.run(socket, initial).await, remote)
    }

    /// Write `local` to the server as `remote`.
    pub async fn put(&self, local: &str, remote: &str) -> Result<TransferStats, TftpError> {
        let socket = Socket::bind(self.config.bind).await?;
        let target = self.config.request_target();
        log::info!("[client] WRQ {remote:?} → {target} (TID {})", socket.tid());
        let (session, initial) = TransferSession::write_request(
            target,
            local,
            remote,
            self.store.as_ref(),
            self.config.session.clone(),
        )?;
        self.finish(session.run(socket, initial).await, remote)
    }

    fn finish(
        &self,
        result: Result<TransferStats, TftpError>,
        remote: &str,
    ) -> Result<TransferStats, TftpError> {
        match &result {
            Ok(stats) => log::info!(
                "[client] {remote:?}: {} bytes in {} blocks",
                stats.bytes,
                stats.blocks
            ),
            Err(e) => log::warn!("[client] {remote:?}: {e}"),
        }
        result
    }
}
