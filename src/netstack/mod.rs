//! Userspace network stack bridge
//!
//! Runs a smoltcp interface over an in-memory link endpoint and exposes it
//! two ways at once: as a [`tun::Device`](crate::tun::Device) moving whole
//! IP packets (the side a WireGuard transport drives), and as per-address
//! [`NetHandle`]s offering listen/dial with ordinary socket semantics (the
//! side applications use). A single reactor task owns interface progress:
//! it polls the stack, drains transmitted packets into a rendezvous
//! channel, and sleeps until the next protocol deadline or an explicit
//! wake.

mod link;
mod socket;

pub use socket::{NetHandle, TcpListener, TcpStream, UdpConn};

use crate::error::{Error, Result};
use crate::tun::{self, Event};
use link::ChannelEndpoint;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, State as TcpState};
use smoltcp::socket::udp::Socket as UdpSocket;
use smoltcp::socket::AnySocket;
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv6Address,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::{mpsc, watch, Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default MTU for the virtual interface: an Ethernet-sized packet minus
/// the tunnel's framing.
pub const DEFAULT_MTU: usize = 1500 - crate::wg::WIREGUARD_OVERHEAD;

/// Default upper bound on packets per device read/write call.
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Default depth of the link endpoint packet queues.
pub const DEFAULT_CHANNEL_SIZE: usize = 8 * DEFAULT_BATCH_SIZE;

/// Largest IP packet the bridge will carry.
pub const MAX_PACKET_SIZE: usize = 65535;

const NETSTACK_NAME: &str = "netstack";

/// Ceiling on reactor sleep between polls.
const POLL_FALLBACK: Duration = Duration::from_millis(250);

fn smoltcp_now() -> SmoltcpInstant {
    static START: std::sync::OnceLock<StdInstant> = std::sync::OnceLock::new();
    let start = START.get_or_init(StdInstant::now);
    SmoltcpInstant::from_micros(start.elapsed().as_micros() as i64)
}

pub(crate) fn smol_ip(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

pub(crate) fn std_ip(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6),
    }
}

pub(crate) fn smol_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(smol_ip(addr.ip()), addr.port())
}

pub(crate) fn std_endpoint(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(std_ip(endpoint.addr), endpoint.port)
}

/// Construction parameters for [`Netstack`].
#[derive(Debug, Clone)]
pub struct NetstackConfig {
    /// Maximum payload size of a single packet.
    pub mtu: usize,
    /// Upper bound on packets per device read/write call.
    pub batch_size: usize,
    /// Depth of the link endpoint packet queues.
    pub channel_size: usize,
}

impl Default for NetstackConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            batch_size: DEFAULT_BATCH_SIZE,
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

impl NetstackConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.mtu == 0 || self.mtu > MAX_PACKET_SIZE {
            return Err(Error::Validation(format!(
                "MTU must be between 1 and {}, got {}",
                MAX_PACKET_SIZE, self.mtu
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Validation("Batch size must be non-zero".to_string()));
        }
        if self.channel_size == 0 {
            return Err(Error::Validation(
                "Channel size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) struct StackState {
    pub(crate) endpoint: ChannelEndpoint,
    pub(crate) iface: Interface,
    pub(crate) sockets: SocketSet<'static>,
    /// Handles whose owner is gone; reaped once fully closed.
    pub(crate) detached: Vec<SocketHandle>,
}

impl StackState {
    /// Poll the interface in place, advancing socket state machines.
    pub(crate) fn poll_now(&mut self) {
        let StackState {
            endpoint,
            iface,
            sockets,
            ..
        } = self;
        iface.poll(smoltcp_now(), endpoint, sockets);
    }
}

struct Inner {
    mtu: usize,
    batch_size: usize,
    state: Mutex<StackState>,
    packets_tx: mpsc::Sender<Vec<u8>>,
    packets_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    /// Dropped on close so event consumers see the stream end.
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    poll_wake: Notify,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    /// Runs teardown once; late closers wait on it instead of returning
    /// before the reactor has stopped.
    close_done: OnceCell<()>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

/// The userspace network stack bridge.
///
/// Cheap to clone; all clones share one interface and one reactor.
#[derive(Clone)]
pub struct Netstack {
    inner: Arc<Inner>,
}

impl Netstack {
    /// Create the bridge and spawn its reactor.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: NetstackConfig) -> Result<Self> {
        config.validate()?;

        let mut endpoint = ChannelEndpoint::new(config.mtu, config.channel_size);
        let iface_config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(iface_config, &mut endpoint, smoltcp_now());
        // Accept and originate traffic for any address; routing is the
        // tunnel's job, not the stack's.
        iface.set_any_ip(true);
        iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Address::UNSPECIFIED)
            .map_err(|e| Error::Netstack(format!("Failed to install IPv4 route: {:?}", e)))?;
        iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Address::UNSPECIFIED)
            .map_err(|e| Error::Netstack(format!("Failed to install IPv6 route: {:?}", e)))?;

        let (packets_tx, packets_rx) = mpsc::channel(1);
        // Holds the pending Up until the first events() call drains it;
        // Down is best-effort and dropped if the slot is still full.
        let (events_tx, events_rx) = mpsc::channel(1);
        events_tx
            .try_send(Event::Up)
            .map_err(|_| Error::Netstack("Event queue rejected startup event".to_string()))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stack = Self {
            inner: Arc::new(Inner {
                mtu: config.mtu,
                batch_size: config.batch_size,
                state: Mutex::new(StackState {
                    endpoint,
                    iface,
                    sockets: SocketSet::new(vec![]),
                    detached: Vec::new(),
                }),
                packets_tx,
                packets_rx: tokio::sync::Mutex::new(packets_rx),
                events_tx: Mutex::new(Some(events_tx)),
                events_rx: tokio::sync::Mutex::new(events_rx),
                poll_wake: Notify::new(),
                shutdown_tx,
                closed: AtomicBool::new(false),
                close_done: OnceCell::new(),
                reactor: Mutex::new(None),
            }),
        };

        let task = tokio::spawn(reactor_loop(stack.clone(), shutdown_rx));
        *stack.reactor_slot() = Some(task);

        info!(
            "Created netstack device (mtu {}, batch size {})",
            config.mtu, config.batch_size
        );
        Ok(stack)
    }

    /// Obtain a listen/dial handle bound to one local address.
    ///
    /// Registers the address on the interface; handles never own the stack
    /// and stay valid (failing with [`Error::Closed`]) after close.
    pub fn net(&self, local: IpAddr) -> NetHandle {
        let cidr = match local {
            IpAddr::V4(v4) => IpCidr::new(smol_ip(IpAddr::V4(v4)), 32),
            IpAddr::V6(v6) => IpCidr::new(smol_ip(IpAddr::V6(v6)), 128),
        };
        {
            let mut state = self.state();
            state.iface.update_ip_addrs(|addrs| {
                if addrs.iter().any(|existing| *existing == cidr) {
                    return;
                }
                if addrs.push(cidr).is_err() {
                    warn!("Interface address table full, cannot register {}", local);
                }
            });
        }
        debug!("Created net handle for {}", local);
        NetHandle::new(self.clone(), local)
    }

    /// Whether the bridge has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, StackState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reactor_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .reactor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Nudge the reactor to poll the interface soon.
    pub(crate) fn wake(&self) {
        self.inner.poll_wake.notify_one();
    }

    /// One reactor iteration: poll, reap detached sockets, collect
    /// transmitted packets, compute the next protocol deadline.
    pub(crate) fn poll_once(&self) -> (Vec<Vec<u8>>, Option<Duration>) {
        let mut state = self.state();
        let StackState {
            endpoint,
            iface,
            sockets,
            detached,
        } = &mut *state;

        let now = smoltcp_now();
        iface.poll(now, endpoint, sockets);

        detached.retain(|&handle| {
            let done = sockets.get::<TcpSocket>(handle).state() == TcpState::Closed;
            if done {
                sockets.remove(handle);
            }
            !done
        });

        let mut outbound = Vec::new();
        while let Some(packet) = endpoint.pop_outbound() {
            outbound.push(packet);
        }

        let delay = iface
            .poll_delay(now, sockets)
            .map(|d| Duration::from_micros(d.total_micros()));
        (outbound, delay)
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn reactor_loop(stack: Netstack, mut shutdown: watch::Receiver<bool>) {
    debug!("Netstack reactor started");
    loop {
        let (outbound, delay) = stack.poll_once();

        for packet in outbound {
            tokio::select! {
                sent = stack.inner.packets_tx.send(packet) => {
                    if sent.is_err() {
                        debug!("Netstack reactor stopping: packet channel dropped");
                        return;
                    }
                }
                _ = wait_shutdown(&mut shutdown) => return,
            }
        }

        let wait = match delay {
            Some(d) if d.is_zero() => continue,
            Some(d) => d.min(POLL_FALLBACK),
            None => POLL_FALLBACK,
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stack.inner.poll_wake.notified() => {}
            _ = wait_shutdown(&mut shutdown) => return,
        }
    }
}

#[async_trait::async_trait]
impl tun::Device for Netstack {
    fn name(&self) -> &str {
        NETSTACK_NAME
    }

    fn mtu(&self) -> usize {
        self.inner.mtu
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    async fn next_event(&self) -> Option<Event> {
        self.inner.events_rx.lock().await.recv().await
    }

    async fn read(
        &self,
        bufs: &mut [&mut [u8]],
        sizes: &mut [usize],
        offset: usize,
    ) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let packet = {
            let mut rx = self.inner.packets_rx.lock().await;
            let mut shutdown = self.inner.shutdown_tx.subscribe();
            tokio::select! {
                packet = rx.recv() => packet.ok_or(Error::Closed)?,
                _ = wait_shutdown(&mut shutdown) => return Err(Error::Closed),
            }
        };

        let buf = bufs
            .get_mut(0)
            .ok_or_else(|| Error::Io("Read requires at least one buffer".to_string()))?;
        let dst = buf
            .get_mut(offset..)
            .ok_or_else(|| Error::Io("Read offset beyond buffer length".to_string()))?;
        let len = packet.len().min(dst.len());
        dst[..len].copy_from_slice(&packet[..len]);
        *sizes
            .get_mut(0)
            .ok_or_else(|| Error::Io("Read requires a size slot".to_string()))? = len;
        Ok(1)
    }

    fn write(&self, bufs: &[&[u8]], offset: usize) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut state = self.state();
        for buf in bufs {
            let packet = match buf.get(offset..) {
                Some(packet) if !packet.is_empty() => packet,
                _ => continue,
            };
            match packet[0] >> 4 {
                4 | 6 => state.endpoint.inject(packet.to_vec()),
                version => {
                    trace!("Dropping {} byte packet with IP version {}", packet.len(), version);
                }
            }
        }
        drop(state);
        self.wake();
        Ok(bufs.len())
    }

    async fn close(&self) -> Result<()> {
        // Teardown runs once; every other caller waits here until the
        // first one has stopped the reactor.
        self.inner
            .close_done
            .get_or_init(|| async {
                self.inner.closed.store(true, Ordering::Release);
                debug!("Closing netstack device");

                let events = self
                    .inner
                    .events_tx
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(tx) = events {
                    tx.try_send(Event::Down).ok();
                }
                self.inner.shutdown_tx.send(true).ok();

                {
                    let mut state = self.state();
                    for (_, socket) in state.sockets.iter_mut() {
                        if let Some(tcp) = TcpSocket::downcast_mut(socket) {
                            tcp.abort();
                        } else if let Some(udp) = UdpSocket::downcast_mut(socket) {
                            udp.close();
                        }
                    }
                }
                self.wake();

                let reactor = self.reactor_slot().take();
                if let Some(task) = reactor {
                    task.await.ok();
                }
                info!("Netstack device closed");
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::Device;
    use std::time::Duration;

    fn stack() -> Netstack {
        Netstack::new(NetstackConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        assert!(Netstack::new(NetstackConfig {
            mtu: 0,
            ..Default::default()
        })
        .is_err());
        assert!(Netstack::new(NetstackConfig {
            batch_size: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_up_event_preloaded_and_down_on_close() {
        let stack = stack();
        assert_eq!(stack.next_event().await, Some(Event::Up));
        stack.close().await.unwrap();
        assert_eq!(stack.next_event().await, Some(Event::Down));
        assert_eq!(stack.next_event().await, None);
    }

    #[tokio::test]
    async fn test_down_event_dropped_when_up_unconsumed() {
        let stack = stack();
        stack.close().await.unwrap();

        // The single event slot still holds the startup event, so the
        // close notification is dropped rather than queued behind it.
        assert_eq!(stack.next_event().await, Some(Event::Up));
        assert_eq!(stack.next_event().await, None);
    }

    #[tokio::test]
    async fn test_write_dispatches_on_version_nibble() {
        let stack = stack();
        let v4 = [0x45u8, 0, 0, 20];
        let junk = [0xA5u8, 1, 2, 3];
        let v6 = [0x60u8, 0, 0, 0];

        let written = stack.write(&[&v4[..], &junk[..], &v6[..]], 0).unwrap();
        assert_eq!(written, 3);
        assert_eq!(stack.state().endpoint.pending_inbound(), 2);

        stack.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_skips_empty_buffers_and_respects_offset() {
        let stack = stack();
        let empty: [u8; 0] = [];
        let padded = [0u8, 0u8, 0x45u8, 0, 0, 20];

        let written = stack.write(&[&empty[..], &padded[..]], 2).unwrap();
        assert_eq!(written, 2);
        assert_eq!(stack.state().endpoint.pending_inbound(), 1);

        stack.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_returns_one_packet_per_call_in_order() {
        let stack = stack();
        {
            let mut state = stack.state();
            state.endpoint.push_outbound(vec![1, 1, 1]);
            state.endpoint.push_outbound(vec![2, 2]);
            state.endpoint.push_outbound(vec![3]);
        }
        stack.wake();

        let mut storage = [0u8; 32];
        let mut sizes = [0usize; 1];
        for expected in [&[1u8, 1, 1][..], &[2, 2][..], &[3][..]] {
            let mut bufs = [&mut storage[..]];
            let count = stack.read(&mut bufs, &mut sizes, 4).await.unwrap();
            assert_eq!(count, 1);
            assert_eq!(sizes[0], expected.len());
            assert_eq!(&storage[4..4 + sizes[0]], expected);
        }

        stack.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_concurrent() {
        let stack = stack();
        let stack_clone = stack.clone();
        let (a, b, c) = tokio::join!(stack.close(), stack.close(), stack_clone.close());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert!(c.is_ok());

        // Whichever close returned, teardown has fully run: the reactor
        // task is gone and the stack reports closed.
        assert!(stack.is_closed());
        assert!(stack.reactor_slot().is_none());
    }

    #[tokio::test]
    async fn test_read_and_write_fail_after_close() {
        let stack = stack();
        stack.close().await.unwrap();

        let mut storage = [0u8; 32];
        let mut sizes = [0usize; 1];
        let mut bufs = [&mut storage[..]];
        assert!(matches!(
            stack.read(&mut bufs, &mut sizes, 0).await,
            Err(Error::Closed)
        ));
        assert!(matches!(stack.write(&[&[0x45u8][..]], 0), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_blocked_read_unblocks_on_close() {
        let stack = stack();
        let reader = {
            let stack = stack.clone();
            tokio::spawn(async move {
                let mut storage = [0u8; 32];
                let mut sizes = [0usize; 1];
                let mut bufs = [&mut storage[..]];
                stack.read(&mut bufs, &mut sizes, 0).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stack.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_dial_timeout_expired_deadline_leaks_no_socket() {
        let stack = stack();
        let net = stack.net("10.0.0.1".parse().unwrap());

        let result = net
            .dial_tcp_timeout("10.0.0.99:4000".parse().unwrap(), Duration::ZERO)
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        // The aborted socket is reaped on the next poll.
        stack.poll_once();
        assert_eq!(stack.state().sockets.iter().count(), 0);

        stack.close().await.unwrap();
    }
}
