//! End-to-end tunnel integration tests
//!
//! Two WireGuard transports, each backed by its own userspace network
//! stack, exchange encrypted traffic over the host loopback interface.
//! No privileges and no real tunnel interfaces are needed: the overlay
//! runs entirely in process, and only the encrypted UDP datagrams touch
//! the kernel.
//!
//! Tests verify:
//! - Handshake and encrypted TCP echo between two stacks
//! - Traffic counters and handshake time reported by the transport
//! - Tunnel construction from a typed client configuration
//! - Idempotent close at the tunnel and transport layers

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use wgbridge::netstack::{Netstack, NetstackConfig};
use wgbridge::uapi::{self, ClientConfig, Entry, Operation};
use wgbridge::wg::{KeyPair, PrivateKey, PublicKey, Tunnel, TunnelTransport, WgTransport};

const CLIENT_OVERLAY: &str = "10.9.0.1";
const SERVER_OVERLAY: &str = "10.9.0.2";
const ECHO_PORT: u16 = 7777;

fn overlay(ip: &str) -> IpAddr {
    ip.parse().expect("Invalid overlay address")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A netstack plus the transport that bridges it onto the real network.
fn new_node() -> (Netstack, WgTransport) {
    init_tracing();
    let stack = Netstack::new(NetstackConfig::default()).expect("Failed to create netstack");
    let transport = WgTransport::new(Arc::new(stack.clone()));
    (stack, transport)
}

/// Applies a single private_key entry, leaving the listen port ephemeral.
async fn apply_identity(transport: &WgTransport, key: &PrivateKey) {
    let mut op = Operation::new();
    op.push(Entry::PrivateKey(key.clone()));
    transport
        .apply_config(&op.encode())
        .await
        .expect("Failed to apply identity");
}

/// Adds a peer reachable on the loopback interface, routing one overlay
/// address to it.
async fn apply_peer(transport: &WgTransport, public_key: &PublicKey, port: u16, overlay: &str) {
    let mut op = Operation::new();
    op.push(Entry::PublicKey(public_key.clone()));
    op.push(Entry::Endpoint(SocketAddr::from(([127, 0, 0, 1], port))));
    op.push(Entry::AllowedIp(
        format!("{}/32", overlay).parse().expect("Invalid overlay net"),
    ));
    transport
        .apply_config(&op.encode())
        .await
        .expect("Failed to apply peer");
}

/// Reads the UDP port the transport actually bound.
async fn reported_port(transport: &WgTransport) -> u16 {
    let raw = transport
        .fetch_config()
        .await
        .expect("Failed to fetch config");
    let op = uapi::parse(&raw).expect("Config response did not parse");
    op.iter()
        .find_map(|entry| match entry {
            Entry::ListenPort(port) => Some(*port),
            _ => None,
        })
        .expect("Response carried no listen_port")
}

#[tokio::test]
async fn test_encrypted_echo_between_stacks() -> Result<()> {
    let client_keys = KeyPair::generate();
    let server_keys = KeyPair::generate();

    let (client_stack, client_transport) = new_node();
    let (server_stack, server_transport) = new_node();

    // Identities first; peers are added once both ports are known.
    apply_identity(&client_transport, &client_keys.private).await;
    apply_identity(&server_transport, &server_keys.private).await;
    client_transport.up().await?;
    server_transport.up().await?;

    let client_port = reported_port(&client_transport).await;
    let server_port = reported_port(&server_transport).await;
    assert_ne!(client_port, 0, "Client transport reported no bound port");
    assert_ne!(server_port, 0, "Server transport reported no bound port");

    apply_peer(
        &client_transport,
        &server_keys.public,
        server_port,
        SERVER_OVERLAY,
    )
    .await;
    apply_peer(
        &server_transport,
        &client_keys.public,
        client_port,
        CLIENT_OVERLAY,
    )
    .await;

    let listener = server_stack
        .net(overlay(SERVER_OVERLAY))
        .listen_tcp(ECHO_PORT)?;
    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("Accept failed");
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.expect("Server read failed");
        stream
            .write_all(&buf[..n])
            .await
            .expect("Server write failed");
    });

    // Dialing triggers the handshake; the first SYN is queued until the
    // session is established, then flushed.
    let client_net = client_stack.net(overlay(CLIENT_OVERLAY));
    let mut stream = timeout(
        Duration::from_secs(15),
        client_net.dial_tcp(SocketAddr::new(overlay(SERVER_OVERLAY), ECHO_PORT)),
    )
    .await??;

    stream.write_all(b"over the wire").await?;
    let mut reply = [0u8; 13];
    timeout(Duration::from_secs(15), stream.read_exact(&mut reply)).await??;
    assert_eq!(&reply, b"over the wire");

    // Real bytes moved, so the counters must say so.
    let raw = client_transport.fetch_config().await?;
    let status = uapi::parse(&raw)?;
    let some_tx = status
        .iter()
        .any(|entry| matches!(entry, Entry::TxBytes(n) if *n > 0));
    let some_rx = status
        .iter()
        .any(|entry| matches!(entry, Entry::RxBytes(n) if *n > 0));
    let handshake = status
        .iter()
        .any(|entry| matches!(entry, Entry::LastHandshakeSec(s) if *s > 0));
    assert!(some_tx, "tx_bytes was not incremented");
    assert!(some_rx, "rx_bytes was not incremented");
    assert!(handshake, "No handshake was recorded");

    timeout(Duration::from_secs(5), server_task).await??;
    client_transport.close().await?;
    server_transport.close().await?;
    assert!(client_stack.is_closed());
    assert!(server_stack.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_tunnel_from_client_config() -> Result<()> {
    let client_keys = KeyPair::generate();
    let server_keys = KeyPair::generate();

    // Server side first, so its port is known when the client config is
    // written.
    let (server_stack, server_transport) = new_node();
    apply_identity(&server_transport, &server_keys.private).await;
    server_transport.up().await?;
    let server_port = reported_port(&server_transport).await;

    let (client_stack, client_transport) = new_node();
    let config = ClientConfig::new(
        client_keys.private.clone(),
        server_keys.public.clone(),
        SocketAddr::from(([127, 0, 0, 1], server_port)),
    )
    .allow_all_traffic();
    let tunnel = Tunnel::new(Box::new(client_transport), &config).await?;

    // Tell the server how to reach the client.
    let client_port = tunnel
        .config()
        .await?
        .iter()
        .find_map(|entry| match entry {
            Entry::ListenPort(port) => Some(*port),
            _ => None,
        })
        .expect("Tunnel reported no listen_port");
    apply_peer(
        &server_transport,
        &client_keys.public,
        client_port,
        CLIENT_OVERLAY,
    )
    .await;

    let listener = server_stack
        .net(overlay(SERVER_OVERLAY))
        .listen_tcp(ECHO_PORT)?;
    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("Accept failed");
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.expect("Server read failed");
        stream
            .write_all(&buf[..n])
            .await
            .expect("Server write failed");
    });

    let client_net = client_stack.net(overlay(CLIENT_OVERLAY));
    let mut stream = timeout(
        Duration::from_secs(15),
        client_net.dial_tcp(SocketAddr::new(overlay(SERVER_OVERLAY), ECHO_PORT)),
    )
    .await??;
    stream.write_all(b"ping").await?;
    let mut reply = [0u8; 4];
    timeout(Duration::from_secs(15), stream.read_exact(&mut reply)).await??;
    assert_eq!(&reply, b"ping");

    timeout(Duration::from_secs(5), server_task).await??;

    // Close is idempotent at both layers.
    tunnel.close().await?;
    tunnel.close().await?;
    assert!(
        tunnel.config().await.is_err(),
        "Config after close should fail"
    );
    server_transport.close().await?;
    server_transport.close().await?;
    assert!(client_stack.is_closed());
    assert!(server_stack.is_closed());
    Ok(())
}
