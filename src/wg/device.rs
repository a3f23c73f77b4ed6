//! boringtun-backed tunnel transport
//!
//! [`WgTransport`] drives the WireGuard data plane over a tunnel device:
//! outbound packets are routed to a peer by allowed-ips, encapsulated, and
//! sent over UDP; inbound datagrams are matched to a peer by source
//! address, decapsulated, and written back into the device. Configuration
//! arrives and leaves as control protocol operations.

use crate::error::{Error, Result};
use crate::netstack::MAX_PACKET_SIZE;
use crate::tun::Device;
use crate::uapi::{self, Entry, Operation, ERRNO_NONE};
use crate::wg::peer::{Peer, PeerUpdate};
use crate::wg::tunnel::TunnelTransport;
use crate::wg::{PrivateKey, PublicKey};
use async_trait::async_trait;
use boringtun::noise::TunnResult;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Timer tick driving per-peer keepalive and rekey maintenance.
const TIMER_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Bound on how long `down` waits for pump tasks before aborting them.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Device configuration and peer table, shared with the pump tasks.
struct DeviceState {
    private_key: Option<PrivateKey>,
    listen_port: u16,
    fwmark: u32,
    peers: HashMap<PublicKey, Peer>,
    endpoints: HashMap<SocketAddr, PublicKey>,
    next_index: u32,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            private_key: None,
            listen_port: 0,
            fwmark: 0,
            peers: HashMap::new(),
            endpoints: HashMap::new(),
            next_index: 0,
        }
    }

    /// Peer with the most specific allowed-ips match for `addr`.
    fn route(&self, addr: IpAddr) -> Option<PublicKey> {
        self.peers
            .values()
            .filter_map(|peer| peer.allows(addr).map(|len| (len, &peer.public_key)))
            .max_by_key(|(len, _)| *len)
            .map(|(_, key)| key.clone())
    }

    /// Install a new device key and rebuild every peer session with it.
    fn rekey(&mut self, key: PrivateKey) -> Result<()> {
        for peer in self.peers.values_mut() {
            peer.rebuild_session(&key)?;
        }
        self.private_key = Some(key);
        Ok(())
    }

    /// Apply one finished peer section of a set operation.
    fn commit_peer(&mut self, update: PeerUpdate) -> Result<()> {
        if update.remove {
            if let Some(peer) = self.peers.remove(&update.public_key) {
                if let Some(endpoint) = peer.endpoint {
                    self.endpoints.remove(&endpoint);
                }
                debug!("Removed peer {}", update.public_key);
            }
            return Ok(());
        }

        let private = self
            .private_key
            .clone()
            .ok_or_else(|| Error::WireGuard("No private key configured".to_string()))?;

        if let Some(peer) = self.peers.get_mut(&update.public_key) {
            let old_endpoint = peer.endpoint;
            if let Some(endpoint) = update.endpoint {
                peer.endpoint = Some(endpoint);
            }
            let mut rebuild = false;
            if let Some(secs) = update.keepalive {
                peer.keepalive = (secs > 0).then_some(secs);
                rebuild = true;
            }
            if let Some(psk) = update.preshared_key {
                peer.preshared_key = Some(psk);
                rebuild = true;
            }
            if update.replace_allowed_ips {
                peer.allowed_ips.clear();
            }
            peer.allowed_ips.extend(update.allowed_ips);
            if rebuild {
                peer.rebuild_session(&private)?;
            }
            let new_endpoint = peer.endpoint;
            if old_endpoint != new_endpoint {
                if let Some(endpoint) = old_endpoint {
                    self.endpoints.remove(&endpoint);
                }
                if let Some(endpoint) = new_endpoint {
                    self.endpoints.insert(endpoint, update.public_key.clone());
                }
            }
        } else {
            if update.update_only {
                debug!("Ignoring update for unknown peer {}", update.public_key);
                return Ok(());
            }
            let index = self.next_index;
            self.next_index += 1;
            let keepalive = update.keepalive.filter(|secs| *secs > 0);
            let mut peer = Peer::new(
                &private,
                update.public_key.clone(),
                update.preshared_key,
                keepalive,
                index,
            )?;
            peer.endpoint = update.endpoint;
            peer.allowed_ips = update.allowed_ips;
            if let Some(endpoint) = peer.endpoint {
                self.endpoints.insert(endpoint, update.public_key.clone());
            }
            debug!("Added peer {}", update.public_key);
            self.peers.insert(update.public_key, peer);
        }

        Ok(())
    }
}

/// Handles owned by a running transport. The pump tasks keep the UDP
/// socket alive through their own references.
struct Pumps {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// A WireGuard transport shuttling packets between a tunnel device and an
/// encrypted UDP socket.
pub struct WgTransport {
    device: Arc<dyn Device>,
    state: Arc<RwLock<DeviceState>>,
    pumps: Mutex<Option<Pumps>>,
}

impl WgTransport {
    /// Create a transport over `device`.
    ///
    /// Nothing is bound and no peers exist until a configuration is
    /// applied and the transport is brought up.
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            state: Arc::new(RwLock::new(DeviceState::new())),
            pumps: Mutex::new(None),
        }
    }

    /// Outbound path: device -> encapsulate -> UDP.
    async fn outbound_pump(
        device: Arc<dyn Device>,
        socket: Arc<UdpSocket>,
        state: Arc<RwLock<DeviceState>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!("Outbound pump started");
        let mut packet = vec![0u8; MAX_PACKET_SIZE];
        let mut out = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let n = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                result = async {
                    let mut bufs = [&mut packet[..]];
                    let mut sizes = [0usize; 1];
                    device.read(&mut bufs, &mut sizes, 0).await.map(|_| sizes[0])
                } => match result {
                    Ok(n) => n,
                    Err(e) if e.is_closed() => {
                        debug!("Device closed, stopping outbound pump");
                        break;
                    }
                    Err(e) => {
                        warn!("Device read error: {}", e);
                        break;
                    }
                },
            };

            let Some(dst) = dst_address(&packet[..n]) else {
                debug!("Dropping outbound packet without destination");
                continue;
            };

            let mut guard = state.write().await;
            let Some(key) = guard.route(dst) else {
                debug!("No peer routes {}, dropping packet", dst);
                continue;
            };
            let Some(peer) = guard.peers.get_mut(&key) else {
                continue;
            };
            let endpoint = peer.endpoint;
            let result = peer.tunn.encapsulate(&packet[..n], &mut out);
            // The datagram lands in `out`; the lock is not needed for
            // the send and must not be held across it.
            drop(guard);

            match result {
                TunnResult::Done => {}
                TunnResult::Err(e) => {
                    debug!("Encapsulation error for peer {}: {:?}", key, e);
                }
                TunnResult::WriteToNetwork(data) => {
                    let Some(endpoint) = endpoint else {
                        debug!("Peer {} has no endpoint, dropping packet", key);
                        continue;
                    };
                    match socket.send_to(data, endpoint).await {
                        Ok(sent) => record_tx(&state, &key, sent).await,
                        Err(e) => warn!("UDP send to {} failed: {}", endpoint, e),
                    }
                }
                TunnResult::WriteToTunnelV4(_, _) | TunnResult::WriteToTunnelV6(_, _) => {
                    debug!("Unexpected tunnel output in outbound path");
                }
            }
        }
        debug!("Outbound pump stopped");
    }

    /// Inbound path: UDP -> decapsulate -> device.
    async fn inbound_pump(
        device: Arc<dyn Device>,
        socket: Arc<UdpSocket>,
        state: Arc<RwLock<DeviceState>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!("Inbound pump started");
        let mut datagram = vec![0u8; MAX_PACKET_SIZE];
        let mut plain = vec![0u8; MAX_PACKET_SIZE];
        let mut queued = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (n, src) = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                result = socket.recv_from(&mut datagram) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("UDP recv error: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let mut guard = state.write().await;
            let Some(key) = guard.endpoints.get(&src).cloned() else {
                debug!("Datagram from unknown endpoint {}", src);
                continue;
            };
            let Some(peer) = guard.peers.get_mut(&key) else {
                continue;
            };
            let result = peer.tunn.decapsulate(Some(src.ip()), &datagram[..n], &mut plain);
            drop(guard);

            match result {
                TunnResult::Done => {}
                TunnResult::Err(e) => {
                    debug!("Decapsulation error from {}: {:?}", src, e);
                }
                TunnResult::WriteToNetwork(data) => {
                    // Handshake reply or cookie. Send it, then flush any
                    // packets boringtun queued while the handshake
                    // settled, relocking per packet so no send happens
                    // under the device lock.
                    match socket.send_to(data, src).await {
                        Ok(sent) => record_tx(&state, &key, sent).await,
                        Err(e) => {
                            warn!("UDP send to {} failed: {}", src, e);
                            continue;
                        }
                    }
                    loop {
                        let mut guard = state.write().await;
                        let Some(peer) = guard.peers.get_mut(&key) else {
                            break;
                        };
                        let flush = peer.tunn.decapsulate(None, &[], &mut queued);
                        drop(guard);
                        match flush {
                            TunnResult::WriteToNetwork(more) => {
                                match socket.send_to(more, src).await {
                                    Ok(sent) => record_tx(&state, &key, sent).await,
                                    Err(e) => {
                                        warn!("UDP send to {} failed: {}", src, e);
                                        break;
                                    }
                                }
                            }
                            _ => break,
                        }
                    }
                }
                TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                    if let Some(peer) = state.write().await.peers.get_mut(&key) {
                        peer.rx_bytes += n as u64;
                    }
                    if let Err(e) = device.write(&[&data[..]], 0) {
                        warn!("Device write error: {}", e);
                    }
                }
            }
        }
        debug!("Inbound pump stopped");
    }

    /// Timer path: per-peer keepalive and rekey upkeep.
    async fn timer_pump(
        socket: Arc<UdpSocket>,
        state: Arc<RwLock<DeviceState>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!("Timer pump started");
        let mut interval = time::interval(TIMER_TICK_INTERVAL);
        let mut out = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                _ = interval.tick() => {}
            }

            let keys: Vec<PublicKey> = state.read().await.peers.keys().cloned().collect();
            for key in keys {
                let mut guard = state.write().await;
                let Some(peer) = guard.peers.get_mut(&key) else {
                    continue;
                };
                let endpoint = peer.endpoint;
                let result = peer.tunn.update_timers(&mut out);
                drop(guard);

                match result {
                    TunnResult::Done => {}
                    TunnResult::Err(e) => {
                        debug!("Timer update error for peer {}: {:?}", key, e);
                    }
                    TunnResult::WriteToNetwork(data) => {
                        let Some(endpoint) = endpoint else {
                            continue;
                        };
                        match socket.send_to(data, endpoint).await {
                            Ok(sent) => record_tx(&state, &key, sent).await,
                            Err(e) => warn!("UDP send to {} failed: {}", endpoint, e),
                        }
                    }
                    TunnResult::WriteToTunnelV4(_, _) | TunnResult::WriteToTunnelV6(_, _) => {}
                }
            }
        }
        debug!("Timer pump stopped");
    }
}

#[async_trait]
impl TunnelTransport for WgTransport {
    async fn apply_config(&self, config: &[u8]) -> Result<()> {
        let op = uapi::parse(config)?;
        let mut state = self.state.write().await;
        let mut pending: Option<PeerUpdate> = None;

        for entry in &op {
            if is_device_entry(entry) && pending.is_some() {
                return Err(Error::WireGuard(format!(
                    "Device key {} after peer section",
                    entry.key()
                )));
            }
            match entry {
                Entry::Set => {}
                Entry::Get => {
                    return Err(Error::WireGuard(
                        "Get directive in set operation".to_string(),
                    ));
                }
                Entry::PrivateKey(key) => state.rekey(key.clone())?,
                Entry::ListenPort(port) => state.listen_port = *port,
                Entry::Fwmark(mark) => state.fwmark = *mark,
                Entry::ReplacePeers => {
                    state.peers.clear();
                    state.endpoints.clear();
                }
                Entry::PublicKey(key) => {
                    if let Some(update) = pending.take() {
                        state.commit_peer(update)?;
                    }
                    pending = Some(PeerUpdate::new(key.clone()));
                }
                Entry::PresharedKey(key) => {
                    peer_section(&mut pending, entry)?.preshared_key = Some(key.clone());
                }
                Entry::Endpoint(addr) => {
                    peer_section(&mut pending, entry)?.endpoint = Some(*addr);
                }
                Entry::PersistentKeepalive(secs) => {
                    peer_section(&mut pending, entry)?.keepalive = Some(*secs);
                }
                Entry::AllowedIp(net) => {
                    peer_section(&mut pending, entry)?.allowed_ips.push(*net);
                }
                Entry::Remove => peer_section(&mut pending, entry)?.remove = true,
                Entry::UpdateOnly => peer_section(&mut pending, entry)?.update_only = true,
                Entry::ReplaceAllowedIps => {
                    peer_section(&mut pending, entry)?.replace_allowed_ips = true;
                }
                Entry::ProtocolVersion => {
                    peer_section(&mut pending, entry)?;
                }
                Entry::RxBytes(_)
                | Entry::TxBytes(_)
                | Entry::LastHandshakeSec(_)
                | Entry::LastHandshakeNsec(_)
                | Entry::Errno(_) => {
                    return Err(Error::WireGuard(format!(
                        "Read-only key in set operation: {}",
                        entry.key()
                    )));
                }
            }
        }

        if let Some(update) = pending {
            state.commit_peer(update)?;
        }

        info!("Applied configuration: {} peers", state.peers.len());
        Ok(())
    }

    async fn fetch_config(&self) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let mut op = Operation::new();

        if let Some(key) = &state.private_key {
            op.push(Entry::PrivateKey(key.clone()));
        }
        op.push(Entry::ListenPort(state.listen_port));
        if state.fwmark != 0 {
            op.push(Entry::Fwmark(state.fwmark));
        }

        for peer in state.peers.values() {
            op.push(Entry::PublicKey(peer.public_key.clone()));
            if let Some(psk) = &peer.preshared_key {
                op.push(Entry::PresharedKey(psk.clone()));
            }
            op.push(Entry::ProtocolVersion);
            if let Some(endpoint) = peer.endpoint {
                op.push(Entry::Endpoint(endpoint));
            }
            let handshake = peer
                .last_handshake()
                .and_then(|at| at.duration_since(UNIX_EPOCH).ok());
            let (sec, nsec) = match handshake {
                Some(since_epoch) => (
                    since_epoch.as_secs() as i64,
                    since_epoch.subsec_nanos() as i64,
                ),
                None => (0, 0),
            };
            op.push(Entry::LastHandshakeSec(sec));
            op.push(Entry::LastHandshakeNsec(nsec));
            op.push(Entry::TxBytes(peer.tx_bytes));
            op.push(Entry::RxBytes(peer.rx_bytes));
            op.push(Entry::PersistentKeepalive(peer.keepalive.unwrap_or(0)));
            for net in &peer.allowed_ips {
                op.push(Entry::AllowedIp(*net));
            }
        }

        op.push(Entry::Errno(ERRNO_NONE));

        let mut bytes = op.encode();
        bytes.push(b'\n');
        Ok(bytes)
    }

    async fn up(&self) -> Result<()> {
        let mut pumps = self.pumps.lock().await;
        if pumps.is_some() {
            return Err(Error::InvalidState("Transport is already up".to_string()));
        }

        let port = self.state.read().await.listen_port;
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|e| Error::Io(format!("Failed to bind UDP socket on port {}: {}", port, e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| Error::Io(format!("Failed to read UDP socket address: {}", e)))?;
        if port == 0 {
            self.state.write().await.listen_port = local.port();
        }
        let socket = Arc::new(socket);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Self::outbound_pump(
                Arc::clone(&self.device),
                Arc::clone(&socket),
                Arc::clone(&self.state),
                shutdown_rx.clone(),
            )),
            tokio::spawn(Self::inbound_pump(
                Arc::clone(&self.device),
                Arc::clone(&socket),
                Arc::clone(&self.state),
                shutdown_rx.clone(),
            )),
            tokio::spawn(Self::timer_pump(
                Arc::clone(&socket),
                Arc::clone(&self.state),
                shutdown_rx,
            )),
        ];

        info!("Transport up, listening on {}", local);
        *pumps = Some(Pumps { shutdown_tx, tasks });
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        let mut pumps = self.pumps.lock().await;
        let Some(Pumps {
            shutdown_tx,
            mut tasks,
        }) = pumps.take()
        else {
            return Ok(());
        };

        info!("Transport going down");
        let _ = shutdown_tx.send(true);

        let drained = time::timeout(SHUTDOWN_TIMEOUT, async {
            for task in &mut tasks {
                let _ = task.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("Timed out waiting for pump tasks to stop, aborting them");
            for task in &tasks {
                task.abort();
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.down().await?;
        self.device.close().await?;
        info!("Transport closed");
        Ok(())
    }
}

/// True for keys that configure the device rather than a peer.
fn is_device_entry(entry: &Entry) -> bool {
    matches!(
        entry,
        Entry::PrivateKey(_) | Entry::ListenPort(_) | Entry::Fwmark(_) | Entry::ReplacePeers
    )
}

/// The open peer section, or an error naming the out-of-place key.
fn peer_section<'a>(
    pending: &'a mut Option<PeerUpdate>,
    entry: &Entry,
) -> Result<&'a mut PeerUpdate> {
    pending.as_mut().ok_or_else(|| {
        Error::WireGuard(format!(
            "Peer key {} before any public_key",
            entry.key()
        ))
    })
}

/// Credit sent bytes to a peer under a short-lived lock.
async fn record_tx(state: &RwLock<DeviceState>, key: &PublicKey, sent: usize) {
    if let Some(peer) = state.write().await.peers.get_mut(key) {
        peer.tx_bytes += sent as u64;
    }
}

/// Destination address of a raw IP packet, by version nibble.
fn dst_address(packet: &[u8]) -> Option<IpAddr> {
    match packet.first().copied()? >> 4 {
        4 if packet.len() >= 20 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&packet[16..20]);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
