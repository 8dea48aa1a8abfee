//! Transfers through the fault relay on loopback.
//!
//! Every test runs a real `tftp` server, a [`FaultInjector`] (or a bare
//! [`RelaySession`]) and a real client, then checks what each fault does to
//! the transfer.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::timeout;

use fault_relay::{
    FaultInjector, ModificationRegistry, ModificationRule, RelayConfig, RelayError, RelayOutcome,
    RelaySession,
};
use tftp::config::{ClientConfig, ServerConfig, SessionConfig};
use tftp::packet::{encode_ack, encode_error, encode_rrq, ErrorCode, Packet, BLOCK_SIZE};
use tftp::socket::Socket;
use tftp::storage::{FileStore, MemoryStore};
use tftp::timer::RetransmitPolicy;
use tftp::{Client, Server, TftpError, TransferSession};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(10);

/// How long a datagram that should have been dropped is waited for.
const QUIET: Duration = Duration::from_millis(300);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

type ServerTask = JoinHandle<Result<(), TftpError>>;

async fn start_server(files: &[(&str, Vec<u8>)]) -> (SocketAddr, MemoryStore, ServerTask) {
    let store = MemoryStore::new();
    for (name, contents) in files {
        store.insert(name, contents.clone());
    }
    let config = ServerConfig {
        bind: loopback(),
        session: SessionConfig::default(),
    };
    let server = Server::bind(config, Arc::new(store.clone()))
        .await
        .expect("bind server");
    let addr = server.local_addr();
    (addr, store, tokio::spawn(server.run()))
}

async fn start_relay(
    server: SocketAddr,
    rules: &[&str],
    config: RelayConfig,
) -> (SocketAddr, ModificationRegistry, JoinHandle<Result<(), RelayError>>) {
    let registry = ModificationRegistry::new();
    for line in rules {
        registry.enqueue(line.parse::<ModificationRule>().expect("rule"));
    }
    let relay = FaultInjector::bind(loopback(), server, registry.clone(), config)
        .await
        .expect("bind relay");
    let addr = relay.local_addr();
    (addr, registry, tokio::spawn(relay.run()))
}

fn retransmitting() -> SessionConfig {
    SessionConfig {
        verbose: true,
        retransmit: Some(RetransmitPolicy {
            initial_timeout: Duration::from_millis(150),
            max_timeout: Duration::from_millis(300),
            max_retries: 5,
        }),
    }
}

fn relayed_client(
    server: SocketAddr,
    relay: SocketAddr,
    local: &MemoryStore,
    session: SessionConfig,
) -> Client {
    let mut config = ClientConfig::new(server).via_relay(relay);
    config.session = session;
    Client::new(config, Arc::new(local.clone()))
}

// ---------------------------------------------------------------------------
// Content faults
// ---------------------------------------------------------------------------

/// DATA 2 relabelled as block 1 is caught by the client, which aborts with
/// ILLEGAL_OPERATION and keeps no partial file.
#[tokio::test]
async fn invalid_block_number_on_data_2_aborts_the_read() {
    let (server, _, server_task) = start_server(&[("f", pattern(3 * BLOCK_SIZE))]).await;
    let (relay, registry, relay_task) =
        start_relay(server, &["DATA 2 invalid-block-number"], RelayConfig::default()).await;

    let local = MemoryStore::new();
    let client = relayed_client(server, relay, &local, SessionConfig::default());
    let err = timeout(WAIT, client.get("f", "f"))
        .await
        .expect("get timed out")
        .unwrap_err();

    assert!(
        matches!(err, TftpError::Local { code: ErrorCode::IllegalOperation, .. }),
        "{err}"
    );
    assert!(!local.exists("f"));
    assert!(registry.is_empty());

    relay_task.abort();
    server_task.abort();
}

/// When block 2 carries the same bytes as block 1, the relabelled datagram is
/// identical to a retransmitted DATA 1.  The client re-acknowledges it, the
/// server resends the real DATA 2 and the read completes intact.
#[tokio::test]
async fn relabelled_block_with_identical_payload_reads_as_duplicate() {
    let contents = vec![0u8; 2 * BLOCK_SIZE];
    let (server, _, server_task) = start_server(&[("zeros", contents.clone())]).await;
    let (relay, registry, relay_task) =
        start_relay(server, &["DATA 2 invalid-block-number"], RelayConfig::default()).await;

    let local = MemoryStore::new();
    let client = relayed_client(server, relay, &local, SessionConfig::default());
    let stats = timeout(WAIT, client.get("zeros", "zeros"))
        .await
        .expect("get timed out")
        .expect("identical payload is a duplicate, not a corrupt block");

    assert!(registry.is_empty());
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.blocks, 3);
    assert_eq!(local.get("zeros").unwrap(), contents);

    relay_task.abort();
    server_task.abort();
}

/// A mangled opcode on the client's ACK makes the server abort; the relay
/// carries its ERROR back to the client.
#[tokio::test]
async fn invalid_opcode_is_rejected_by_the_server() {
    let (server, _, server_task) = start_server(&[("f", pattern(2 * BLOCK_SIZE))]).await;
    let (relay, _, relay_task) =
        start_relay(server, &["ACK 1 invalid-opcode"], RelayConfig::default()).await;

    let local = MemoryStore::new();
    let client = relayed_client(server, relay, &local, SessionConfig::default());
    let err = timeout(WAIT, client.get("f", "f"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, TftpError::Remote { code: ErrorCode::IllegalOperation, .. }),
        "{err}"
    );

    relay_task.abort();
    server_task.abort();
}

#[tokio::test]
async fn oversized_data_is_rejected_by_the_client() {
    let (server, _, server_task) = start_server(&[("f", pattern(100))]).await;
    let (relay, _, relay_task) =
        start_relay(server, &["DATA 1 invalid-packet-size"], RelayConfig::default()).await;

    let local = MemoryStore::new();
    let client = relayed_client(server, relay, &local, SessionConfig::default());
    let err = timeout(WAIT, client.get("f", "f"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::IllegalOperation));

    relay_task.abort();
    server_task.abort();
}

/// DATA 2 arrives from a stranger's port: the client answers it with
/// ERROR(5), which the relay collects before ending the session.
#[tokio::test]
async fn stray_transfer_id_collects_error_5() {
    let (server, _, server_task) = start_server(&[("f", pattern(3 * BLOCK_SIZE))]).await;
    let registry = ModificationRegistry::new();
    registry.enqueue("DATA 2 unknown-transfer-id".parse().unwrap());

    let client_socket = Socket::bind(loopback()).await.unwrap();
    let config = RelayConfig {
        probe_timeout: Duration::from_secs(2),
        ..RelayConfig::default()
    };
    let relay = RelaySession::start(
        encode_rrq("f", "octet"),
        client_socket.local_addr,
        server,
        registry,
        config,
    )
    .await
    .unwrap();

    // The relay already holds the RRQ, so the client session sends nothing
    // first and binds to whichever port answers.
    let local = MemoryStore::new();
    let (session, _rrq) = TransferSession::read_request(
        relay.client_side_addr(),
        "f",
        "f",
        &local,
        SessionConfig::default(),
    )
    .unwrap();
    let client_task = tokio::spawn(session.run(client_socket, Vec::new()));

    let outcome = timeout(WAIT, relay.run())
        .await
        .expect("relay timed out")
        .expect("relay failed");
    match outcome {
        RelayOutcome::TidProbe { reply: Some(reply) } => match Packet::decode(&reply).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownTransferId),
            other => panic!("expected ERROR(5), got {other}"),
        },
        other => panic!("unexpected outcome {other:?}"),
    }

    client_task.abort();
    server_task.abort();
}

// ---------------------------------------------------------------------------
// Network faults
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicated_data_is_written_once() {
    let contents = pattern(3 * BLOCK_SIZE + 5);
    let (server, _, server_task) = start_server(&[("f", contents.clone())]).await;
    let (relay, _, relay_task) =
        start_relay(server, &["DATA 1 duplicated"], RelayConfig::default()).await;

    let local = MemoryStore::new();
    let client = relayed_client(server, relay, &local, SessionConfig::default());
    let stats = timeout(WAIT, client.get("f", "f"))
        .await
        .unwrap()
        .expect("transfer should survive a duplicate");
    assert!(stats.duplicates >= 1);
    assert_eq!(local.get("f").unwrap(), contents);

    relay_task.abort();
    server_task.abort();
}

#[tokio::test]
async fn delayed_ack_slows_but_completes_the_write() {
    let (server, remote, server_task) = start_server(&[]).await;
    let config = RelayConfig {
        delay: Duration::from_millis(300),
        ..RelayConfig::default()
    };
    let (relay, _, relay_task) = start_relay(server, &["ACK 1 delayed"], config).await;

    let local = MemoryStore::new();
    local.insert("up", pattern(BLOCK_SIZE + 1));
    let started = Instant::now();
    let client = relayed_client(server, relay, &local, SessionConfig::default());
    timeout(WAIT, client.put("up", "up"))
        .await
        .unwrap()
        .expect("delayed transfer should complete");
    assert!(started.elapsed() >= Duration::from_millis(300));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.get("up").unwrap(), pattern(BLOCK_SIZE + 1));

    relay_task.abort();
    server_task.abort();
}

/// With the session kept alive after a loss, the client's retransmitted ACK
/// makes the server resend the missing block.
#[tokio::test]
async fn lost_data_is_recovered_by_retransmission() {
    let contents = pattern(3 * BLOCK_SIZE);
    let (server, _, server_task) = start_server(&[("f", contents.clone())]).await;
    let config = RelayConfig {
        end_on_loss: false,
        ..RelayConfig::default()
    };
    let (relay, _, relay_task) = start_relay(server, &["DATA 2 lost"], config).await;

    let local = MemoryStore::new();
    let client = relayed_client(server, relay, &local, retransmitting());
    let stats = timeout(WAIT, client.get("f", "f"))
        .await
        .unwrap()
        .expect("transfer should recover");
    assert!(stats.retransmissions >= 1);
    assert_eq!(local.get("f").unwrap(), contents);

    relay_task.abort();
    server_task.abort();
}

/// A lost request ends its relay session; the client's retry opens a new one.
#[tokio::test]
async fn lost_request_is_retried_through_a_fresh_session() {
    let (server, _, server_task) = start_server(&[("f", pattern(700))]).await;
    let (relay, registry, relay_task) =
        start_relay(server, &["RRQ lost"], RelayConfig::default()).await;

    let local = MemoryStore::new();
    let client = relayed_client(server, relay, &local, retransmitting());
    timeout(WAIT, client.get("f", "f"))
        .await
        .unwrap()
        .expect("retried request should go through");
    assert_eq!(local.get("f").unwrap(), pattern(700));
    assert!(registry.is_empty());

    relay_task.abort();
    server_task.abort();
}

#[tokio::test]
async fn clean_relay_is_transparent() {
    let (server, _, server_task) = start_server(&[("f", pattern(2 * BLOCK_SIZE))]).await;
    let (relay, _, relay_task) = start_relay(server, &[], RelayConfig::default()).await;

    let local = MemoryStore::new();
    let client = relayed_client(server, relay, &local, SessionConfig::default());
    let stats = timeout(WAIT, client.get("f", "f"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.blocks, 3);
    assert_eq!(stats.retransmissions, 0);
    assert_eq!(local.get("f").unwrap(), pattern(2 * BLOCK_SIZE));

    relay_task.abort();
    server_task.abort();
}

// ---------------------------------------------------------------------------
// Strangers
// ---------------------------------------------------------------------------

/// A two-block read through a bare relay session, driven from a raw socket
/// so each step is explicit.
struct RawRead {
    client: Socket,
    /// Where the client-facing relay socket sends from.
    relay: SocketAddr,
    /// The relay's server-facing socket, on loopback.
    server_side: SocketAddr,
    outcome: JoinHandle<Result<RelayOutcome, RelayError>>,
    server_task: ServerTask,
}

impl RawRead {
    /// Start the session and wait for DATA 1, which fixes the server TID.
    async fn start() -> Self {
        let (server, _, server_task) = start_server(&[("f", pattern(BLOCK_SIZE + 88))]).await;
        let client = Socket::bind(loopback()).await.unwrap();
        let session = RelaySession::start(
            encode_rrq("f", "octet"),
            client.local_addr,
            server,
            ModificationRegistry::new(),
            RelayConfig::default(),
        )
        .await
        .unwrap();
        let server_side_port = session.server_side_addr().port();
        let server_side = SocketAddr::from((Ipv4Addr::LOCALHOST, server_side_port));
        let outcome = tokio::spawn(session.run());

        let (packet, relay) = recv(&client).await;
        assert!(matches!(packet, Packet::Data { block: 1, .. }), "{packet}");
        Self {
            client,
            relay,
            server_side,
            outcome,
            server_task,
        }
    }

    /// Nothing reaches the client for a while.
    async fn assert_client_quiet(&self) {
        assert!(timeout(QUIET, self.client.recv_from()).await.is_err());
    }

    /// ACK 1, receive the short DATA 2, ACK 2, and collect the relay outcome.
    async fn finish(self) -> RelayOutcome {
        self.client.send_to(&encode_ack(1), self.relay).await.unwrap();
        match recv(&self.client).await.0 {
            Packet::Data { block, payload } => {
                assert_eq!(block, 2);
                assert_eq!(payload.len(), 88);
            }
            other => panic!("expected DATA 2, got {other}"),
        }
        self.client.send_to(&encode_ack(2), self.relay).await.unwrap();

        let outcome = timeout(WAIT, self.outcome)
            .await
            .expect("relay timed out")
            .expect("relay task panicked")
            .expect("relay failed");
        self.server_task.abort();
        outcome
    }
}

async fn recv(socket: &Socket) -> (Packet, SocketAddr) {
    let (bytes, from) = timeout(WAIT, socket.recv_from())
        .await
        .expect("timed out waiting for a datagram")
        .expect("recv failed");
    (Packet::decode(&bytes).expect("decode"), from)
}

/// Once the server TID is known, replies from any other port are dropped.
#[tokio::test]
async fn reply_from_other_server_port_is_dropped() {
    let read = RawRead::start().await;

    let stranger = Socket::bind(loopback()).await.unwrap();
    let spoofed = encode_error(ErrorCode::NotDefined, "spoofed");
    stranger.send_to(&spoofed, read.server_side).await.unwrap();
    read.assert_client_quiet().await;

    assert_eq!(read.finish().await, RelayOutcome::Completed);
}

/// Only the client that opened the session may use its client-facing socket.
#[tokio::test]
async fn stranger_on_client_leg_is_dropped() {
    let read = RawRead::start().await;

    let stranger = Socket::bind(loopback()).await.unwrap();
    stranger.send_to(&encode_ack(1), read.relay).await.unwrap();
    stranger
        .send_to(&encode_error(ErrorCode::NotDefined, "spoofed"), read.relay)
        .await
        .unwrap();
    // A forwarded ACK 1 would have released DATA 2 early.
    read.assert_client_quiet().await;
    assert!(timeout(QUIET, stranger.recv_from()).await.is_err());

    assert_eq!(read.finish().await, RelayOutcome::Completed);
}
