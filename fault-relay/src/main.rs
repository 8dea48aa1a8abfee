//! Entry point for `fault-relay`.
//!
//! Rules come from `--rule` flags and, with `--stdin-rules`, from stdin one
//! per line while the relay runs.  On stdin, `list` prints the queue and
//! `clear` empties it.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use fault_relay::{FaultInjector, ModificationRegistry, ModificationRule, RelayConfig};
use tftp::config::{DEFAULT_RELAY_PORT, DEFAULT_SERVER_PORT};

/// Fault-injecting TFTP relay.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address clients send their requests to.
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)))]
    listen: SocketAddr,
    /// TFTP server to relay to.
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)))]
    server: SocketAddr,
    /// Queue a rule, e.g. "DATA 2 invalid-block-number".  Repeatable.
    #[arg(short, long = "rule")]
    rules: Vec<ModificationRule>,
    /// Read further rules from stdin.
    #[arg(long)]
    stdin_rules: bool,
    /// Hold time for delayed datagrams, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    delay_ms: u64,
    /// End a relay session after this many seconds without traffic.
    #[arg(long, default_value_t = 30)]
    idle_secs: u64,
    /// Wait this long for the answer to an unknown-TID delivery, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    probe_ms: u64,
    /// Keep relaying after a lost datagram instead of ending the session.
    #[arg(long)]
    keep_on_loss: bool,
    /// Log every relayed datagram.
    #[arg(short, long)]
    verbose: bool,
}

async fn read_rules(registry: ModificationRegistry) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("[registry] reading stdin failed: {e}");
                break;
            }
        };
        let line = line.trim();
        match line {
            "" => {}
            _ if line.starts_with('#') => {}
            "list" => {
                for (i, rule) in registry.pending().iter().enumerate() {
                    println!("{i}: {rule}");
                }
            }
            "clear" => {
                registry.clear();
                log::info!("[registry] cleared");
            }
            _ => match line.parse::<ModificationRule>() {
                Ok(rule) => registry.enqueue(rule),
                Err(e) => log::warn!("[registry] {line:?}: {e}"),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();

    let registry = ModificationRegistry::new();
    for rule in cli.rules {
        registry.enqueue(rule);
    }

    let config = RelayConfig {
        delay: Duration::from_millis(cli.delay_ms),
        idle_timeout: Duration::from_secs(cli.idle_secs),
        probe_timeout: Duration::from_millis(cli.probe_ms),
        end_on_loss: !cli.keep_on_loss,
        verbose: cli.verbose,
    };
    let relay = FaultInjector::bind(cli.listen, cli.server, registry.clone(), config)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;

    if cli.stdin_rules {
        tokio::spawn(read_rules(registry));
    }

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("[relay] shutting down"),
    }
    Ok(())
}
