//! Entry point for `tftp`.
//!
//! Parses CLI arguments and dispatches into **server**, **get** or **put**.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use tftp::config::{ClientConfig, ServerConfig, SessionConfig, DEFAULT_SERVER_PORT};
use tftp::storage::LocalStore;
use tftp::timer::RetransmitPolicy;
use tftp::{Client, Server};

/// TFTP server and client (octet mode, RFC 1350).
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve files from a directory.
    Server {
        /// Local address to bind.
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)))]
        bind: SocketAddr,
        /// Directory to serve.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
        /// Cap on the total bytes stored below the root.
        #[arg(long)]
        quota: Option<u64>,
        #[command(flatten)]
        common: Common,
    },
    /// Download a file.
    Get {
        #[command(flatten)]
        target: Target,
        /// File name on the server.
        remote: String,
        /// Local destination (defaults to the remote name).
        local: Option<PathBuf>,
        #[command(flatten)]
        common: Common,
    },
    /// Upload a file.
    Put {
        #[command(flatten)]
        target: Target,
        /// Local file to send.
        local: PathBuf,
        /// File name on the server (defaults to the local file name).
        remote: Option<String>,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Args)]
struct Target {
    /// Server address.
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)))]
    server: SocketAddr,
    /// Send the request through a fault relay at this address instead.
    #[arg(long)]
    relay: Option<SocketAddr>,
}

#[derive(Args)]
struct Common {
    /// Log every datagram.
    #[arg(short, long)]
    verbose: bool,
    /// Retransmit after this many milliseconds of silence (disabled when unset).
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Retransmissions before giving up.
    #[arg(long, default_value_t = 5)]
    retries: u32,
}

impl Common {
    fn session(&self) -> SessionConfig {
        SessionConfig {
            verbose: self.verbose,
            retransmit: self.timeout_ms.map(|ms| {
                let initial = Duration::from_millis(ms);
                RetransmitPolicy {
                    initial_timeout: initial,
                    max_timeout: initial * 8,
                    max_retries: self.retries,
                }
            }),
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

/// Split a local path into the directory a store is rooted at and the name
/// inside it.
fn split_local(path: &Path) -> Result<(PathBuf, String)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} is not a file path", path.display()))?
        .to_string();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, name))
}

fn client_config(target: &Target, common: &Common) -> ClientConfig {
    let mut config = ClientConfig::new(target.server);
    if let Some(relay) = target.relay {
        config = config.via_relay(relay);
    }
    config.session = common.session();
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            root,
            quota,
            common,
        } => {
            init_logging(common.verbose);
            if !root.is_dir() {
                bail!("{} is not a directory", root.display());
            }
            let mut store = LocalStore::new(root);
            if let Some(bytes) = quota {
                store = store.with_quota(bytes);
            }
            let config = ServerConfig {
                bind,
                session: common.session(),
            };
            let server = Server::bind(config, Arc::new(store))
                .await
                .with_context(|| format!("binding {bind}"))?;
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => log::info!("[server] shutting down"),
            }
        }
        Mode::Get {
            target,
            remote,
            local,
            common,
        } => {
            init_logging(common.verbose);
            let local = local.unwrap_or_else(|| PathBuf::from(&remote));
            let (dir, name) = split_local(&local)?;
            let store = Arc::new(LocalStore::new(dir));
            let client = Client::new(client_config(&target, &common), store);
            let stats = client.get(&remote, &name).await?;
            println!("received {} bytes into {}", stats.bytes, local.display());
        }
        Mode::Put {
            target,
            local,
            remote,
            common,
        } => {
            init_logging(common.verbose);
            let (dir, name) = split_local(&local)?;
            let remote = remote.unwrap_or_else(|| name.clone());
            let store = Arc::new(LocalStore::new(dir));
            let client = Client::new(client_config(&target, &common), store);
            let stats = client.put(&name, &remote).await?;
            println!("sent {} bytes as {remote}", stats.bytes);
        }
    }
    Ok(())
}
