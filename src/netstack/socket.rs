//! Sockets over the userspace stack
//!
//! [`NetHandle`] is the per-address entry point: listen and dial from one
//! local address without owning the stack. [`TcpStream`] speaks tokio's
//! `AsyncRead`/`AsyncWrite` backed by per-socket smoltcp wakers;
//! [`TcpListener`] works around smoltcp's lack of an accept backlog by
//! replacing its listening socket each time a handshake completes;
//! [`UdpConn`] covers both connected and unconnected packet sockets.

use super::{smol_endpoint, smol_ip, std_endpoint, Netstack, StackState};
use crate::error::{Error, Result};
use crate::listener::{BoxConn, Listener, ListenerAddr};
use async_trait::async_trait;
use rand::Rng;
use smoltcp::iface::{SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::socket::udp::{
    self, PacketBuffer as UdpPacketBuffer, PacketMetadata as UdpPacketMetadata,
    Socket as UdpSocket, UdpMetadata,
};
use smoltcp::socket::AnySocket;
use smoltcp::wire::{IpEndpoint, IpListenEndpoint};
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

const TCP_BUFFER_SIZE: usize = 65536;
const UDP_BUFFER_SIZE: usize = 65536;
const UDP_METADATA_ENTRIES: usize = 16;
const EPHEMERAL_PORT_MIN: u16 = 49152;
const EPHEMERAL_PORT_ATTEMPTS: usize = 128;

fn make_tcp_socket() -> TcpSocket<'static> {
    let rx = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
    let tx = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
    TcpSocket::new(rx, tx)
}

fn make_udp_socket() -> UdpSocket<'static> {
    let rx = UdpPacketBuffer::new(
        vec![UdpPacketMetadata::EMPTY; UDP_METADATA_ENTRIES],
        vec![0u8; UDP_BUFFER_SIZE],
    );
    let tx = UdpPacketBuffer::new(
        vec![UdpPacketMetadata::EMPTY; UDP_METADATA_ENTRIES],
        vec![0u8; UDP_BUFFER_SIZE],
    );
    UdpSocket::new(rx, tx)
}

fn port_in_use(sockets: &SocketSet<'_>, port: u16) -> bool {
    sockets.iter().any(|(_, socket)| {
        if let Some(tcp) = TcpSocket::downcast(socket) {
            // Listening sockets report only a listen endpoint.
            tcp.listen_endpoint().port == port
                || tcp.local_endpoint().map(|ep| ep.port) == Some(port)
        } else if let Some(udp) = UdpSocket::downcast(socket) {
            udp.endpoint().port == port
        } else {
            false
        }
    })
}

fn ephemeral_port(sockets: &SocketSet<'_>) -> Result<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..EPHEMERAL_PORT_ATTEMPTS {
        let port: u16 = rng.gen_range(EPHEMERAL_PORT_MIN..=u16::MAX);
        if !port_in_use(sockets, port) {
            return Ok(port);
        }
    }
    Err(Error::Netstack("No free ephemeral port".to_string()))
}

/// Listen/dial handle bound to one local address.
///
/// Handles are cheap clones sharing the stack; any number may exist and
/// none of them owns it. Every operation fails with
/// [`Error::Closed`] once the stack shuts down.
#[derive(Clone)]
pub struct NetHandle {
    stack: Netstack,
    local: IpAddr,
}

impl NetHandle {
    pub(crate) fn new(stack: Netstack, local: IpAddr) -> Self {
        Self { stack, local }
    }

    /// The local address this handle listens and dials from.
    pub fn local_ip(&self) -> IpAddr {
        self.local
    }

    /// Listen for TCP connections on `(local address, port)`.
    ///
    /// Port 0 picks an ephemeral port.
    pub fn listen_tcp(&self, port: u16) -> Result<TcpListener> {
        if self.stack.is_closed() {
            return Err(Error::Closed);
        }
        let handle;
        let port = {
            let mut state = self.stack.state();
            let sockets = &mut state.sockets;
            let port = if port == 0 { ephemeral_port(sockets)? } else { port };
            let mut socket = make_tcp_socket();
            socket
                .listen(IpListenEndpoint {
                    addr: Some(smol_ip(self.local)),
                    port,
                })
                .map_err(|e| {
                    Error::Listen(format!("Listen on {}:{} failed: {}", self.local, port, e))
                })?;
            handle = sockets.add(socket);
            port
        };
        self.stack.wake();
        debug!("Listening on {}:{}", self.local, port);
        Ok(TcpListener {
            stack: self.stack.clone(),
            local: SocketAddr::new(self.local, port),
            handle: Mutex::new(handle),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to `remote` from this handle's address and an ephemeral
    /// port. Resolves once the handshake completes; dropping the future
    /// aborts the connection attempt and releases its socket.
    pub async fn dial_tcp(&self, remote: SocketAddr) -> Result<TcpStream> {
        if self.stack.is_closed() {
            return Err(Error::Closed);
        }
        let (handle, local) = {
            let mut state = self.stack.state();
            let StackState { iface, sockets, .. } = &mut *state;
            let port = ephemeral_port(sockets)?;
            let mut socket = make_tcp_socket();
            socket
                .connect(
                    iface.context(),
                    smol_endpoint(remote),
                    IpEndpoint::new(smol_ip(self.local), port),
                )
                .map_err(|e| Error::Dial(format!("Connect to {} failed: {}", remote, e)))?;
            (sockets.add(socket), SocketAddr::new(self.local, port))
        };
        self.stack.wake();

        let mut guard = DialGuard {
            stack: self.stack.clone(),
            handle,
            armed: true,
        };
        poll_fn(|cx| {
            let mut state = self.stack.state();
            if self.stack.is_closed() {
                return Poll::Ready(Err(Error::Closed));
            }
            state.poll_now();
            let socket = state.sockets.get_mut::<TcpSocket>(handle);
            if socket.may_send() {
                Poll::Ready(Ok(()))
            } else if socket.state() == TcpState::Closed {
                Poll::Ready(Err(Error::Dial(format!("Connection to {} refused", remote))))
            } else {
                socket.register_recv_waker(cx.waker());
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
        })
        .await?;
        guard.armed = false;

        debug!("Connected to {} from {}", remote, local);
        Ok(TcpStream {
            stack: self.stack.clone(),
            handle,
            local,
            peer: remote,
        })
    }

    /// [`dial_tcp`](Self::dial_tcp) bounded by a deadline. An expired or
    /// zero deadline returns [`Error::Timeout`] promptly and leaks no
    /// socket.
    pub async fn dial_tcp_timeout(&self, remote: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        match tokio::time::timeout(timeout, self.dial_tcp(remote)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "Dial to {} timed out after {:?}",
                remote, timeout
            ))),
        }
    }

    /// Open a connected UDP socket to `remote`. `send`/`recv` are
    /// filtered to that endpoint; datagrams from anyone else are dropped.
    pub fn dial_udp(&self, remote: SocketAddr) -> Result<UdpConn> {
        let (handle, local) = self.bind_udp(0)?;
        debug!("UDP socket {} connected to {}", local, remote);
        Ok(UdpConn {
            stack: self.stack.clone(),
            handle,
            local,
            remote: Some(remote),
            closed: AtomicBool::new(false),
        })
    }

    /// Bind an unconnected UDP socket on `(local address, port)` with
    /// `send_to`/`recv_from` semantics. Port 0 picks an ephemeral port.
    pub fn listen_udp(&self, port: u16) -> Result<UdpConn> {
        let (handle, local) = self.bind_udp(port)?;
        debug!("UDP socket listening on {}", local);
        Ok(UdpConn {
            stack: self.stack.clone(),
            handle,
            local,
            remote: None,
            closed: AtomicBool::new(false),
        })
    }

    fn bind_udp(&self, port: u16) -> Result<(SocketHandle, SocketAddr)> {
        if self.stack.is_closed() {
            return Err(Error::Closed);
        }
        let mut state = self.stack.state();
        let sockets = &mut state.sockets;
        let port = if port == 0 { ephemeral_port(sockets)? } else { port };
        let mut socket = make_udp_socket();
        socket
            .bind(IpListenEndpoint {
                addr: Some(smol_ip(self.local)),
                port,
            })
            .map_err(|e| Error::Udp(format!("Bind {}:{} failed: {}", self.local, port, e)))?;
        let handle = sockets.add(socket);
        drop(state);
        self.stack.wake();
        Ok((handle, SocketAddr::new(self.local, port)))
    }
}

struct DialGuard {
    stack: Netstack,
    handle: SocketHandle,
    armed: bool,
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.stack.state();
        let socket = state.sockets.get_mut::<TcpSocket>(self.handle);
        socket.abort();
        state.detached.push(self.handle);
        drop(state);
        self.stack.wake();
    }
}

/// TCP listener over the userspace stack.
pub struct TcpListener {
    stack: Netstack,
    local: SocketAddr,
    /// Current listening socket; swapped for a fresh one per accept.
    handle: Mutex<SocketHandle>,
    closed: AtomicBool,
}

impl TcpListener {
    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Wait for the next established connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Result<(TcpStream, SocketAddr)>> {
        let mut state = self.stack.state();
        if self.closed.load(Ordering::Acquire) || self.stack.is_closed() {
            return Poll::Ready(Err(Error::Closed));
        }
        state.poll_now();
        let mut held = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sockets = &mut state.sockets;
        let socket = sockets.get_mut::<TcpSocket>(*held);
        let endpoint = IpListenEndpoint {
            addr: Some(smol_ip(self.local.ip())),
            port: self.local.port(),
        };

        match socket.state() {
            TcpState::Listen | TcpState::SynReceived => {
                socket.register_recv_waker(cx.waker());
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            TcpState::Closed => {
                // The pending handshake was reset; listen again.
                if let Err(e) = socket.listen(endpoint) {
                    return Poll::Ready(Err(Error::Listen(format!(
                        "Re-listen on {} failed: {}",
                        self.local, e
                    ))));
                }
                socket.register_recv_waker(cx.waker());
                socket.register_send_waker(cx.waker());
                Poll::Pending
            }
            _ => match socket.remote_endpoint() {
                Some(remote) => {
                    let peer = std_endpoint(remote);
                    // Restore a listening socket before handing out the
                    // established one.
                    let mut fresh = make_tcp_socket();
                    if let Err(e) = fresh.listen(endpoint) {
                        return Poll::Ready(Err(Error::Listen(format!(
                            "Re-listen on {} failed: {}",
                            self.local, e
                        ))));
                    }
                    let conn = std::mem::replace(&mut *held, sockets.add(fresh));
                    self.stack.wake();
                    debug!("Accepted connection from {}", peer);
                    Poll::Ready(Ok((
                        TcpStream {
                            stack: self.stack.clone(),
                            handle: conn,
                            local: self.local,
                            peer,
                        },
                        peer,
                    )))
                }
                None => {
                    socket.register_recv_waker(cx.waker());
                    socket.register_send_waker(cx.waker());
                    Poll::Pending
                }
            },
        }
    }

    /// Stop listening. Pending accepts fail with [`Error::Closed`];
    /// already-accepted streams are unaffected. Safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        self.close_inner();
        Ok(())
    }

    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.stack.state();
        let held = *self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let socket = state.sockets.get_mut::<TcpSocket>(held);
        socket.abort();
        state.detached.push(held);
        drop(state);
        self.stack.wake();
        debug!("Closed listener on {}", self.local);
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.close_inner();
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<BoxConn> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(Box::new(stream))
    }

    fn addr(&self) -> ListenerAddr {
        ListenerAddr::Socket(self.local)
    }

    async fn close(&self) -> Result<()> {
        TcpListener::close(self)
    }
}

/// Established TCP connection over the userspace stack.
pub struct TcpStream {
    stack: Netstack,
    handle: SocketHandle,
    local: SocketAddr,
    peer: SocketAddr,
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl TcpStream {
    /// The local endpoint of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The remote endpoint of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.stack.state();
        state.poll_now();
        let socket = state.sockets.get_mut::<TcpSocket>(self.handle);
        if socket.can_recv() {
            match socket.recv_slice(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    drop(state);
                    self.stack.wake();
                    Poll::Ready(Ok(()))
                }
                Err(e) => Poll::Ready(Err(io::Error::other(format!("{}", e)))),
            }
        } else if !socket.may_recv() {
            // Remote side closed and the buffer is drained: EOF.
            Poll::Ready(Ok(()))
        } else {
            socket.register_recv_waker(cx.waker());
            Poll::Pending
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.stack.state();
        state.poll_now();
        let socket = state.sockets.get_mut::<TcpSocket>(self.handle);
        if socket.can_send() {
            match socket.send_slice(buf) {
                Ok(n) => {
                    state.poll_now();
                    drop(state);
                    self.stack.wake();
                    Poll::Ready(Ok(n))
                }
                Err(e) => Poll::Ready(Err(io::Error::other(format!("{}", e)))),
            }
        } else if !socket.may_send() {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            )))
        } else {
            socket.register_send_waker(cx.waker());
            Poll::Pending
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.stack.state();
        state.poll_now();
        drop(state);
        self.stack.wake();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.stack.state();
        let socket = state.sockets.get_mut::<TcpSocket>(self.handle);
        socket.close();
        state.poll_now();
        drop(state);
        self.stack.wake();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let mut state = self.stack.state();
        let socket = state.sockets.get_mut::<TcpSocket>(self.handle);
        socket.close();
        state.detached.push(self.handle);
        drop(state);
        self.stack.wake();
    }
}

/// UDP socket over the userspace stack, connected or unconnected.
pub struct UdpConn {
    stack: Netstack,
    handle: SocketHandle,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    closed: AtomicBool,
}

impl UdpConn {
    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The connected remote endpoint, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Send a datagram to the connected remote endpoint.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        let target = self
            .remote
            .ok_or_else(|| Error::Udp("Socket is not connected".to_string()))?;
        self.send_inner(buf, target).await
    }

    /// Send a datagram to `target`.
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        self.send_inner(buf, target).await
    }

    /// Receive a datagram from the connected remote endpoint. Datagrams
    /// from other senders are discarded.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let expected = self
            .remote
            .ok_or_else(|| Error::Udp("Socket is not connected".to_string()))?;
        loop {
            let (n, from) = self.recv_inner(buf).await?;
            if from == expected {
                return Ok(n);
            }
            trace!("Discarding datagram from unexpected peer {}", from);
        }
    }

    /// Receive a datagram from any sender.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.recv_inner(buf).await
    }

    async fn send_inner(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        poll_fn(|cx| {
            let mut state = self.stack.state();
            if self.closed.load(Ordering::Acquire) || self.stack.is_closed() {
                return Poll::Ready(Err(Error::Closed));
            }
            let socket = state.sockets.get_mut::<UdpSocket>(self.handle);
            match socket.send_slice(buf, UdpMetadata::from(smol_endpoint(target))) {
                Ok(()) => {
                    drop(state);
                    self.stack.wake();
                    Poll::Ready(Ok(buf.len()))
                }
                Err(udp::SendError::BufferFull) => {
                    socket.register_send_waker(cx.waker());
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(Error::Udp(format!(
                    "Send to {} failed: {}",
                    target, e
                )))),
            }
        })
        .await
    }

    async fn recv_inner(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        poll_fn(|cx| {
            let mut state = self.stack.state();
            if self.closed.load(Ordering::Acquire) || self.stack.is_closed() {
                return Poll::Ready(Err(Error::Closed));
            }
            state.poll_now();
            let socket = state.sockets.get_mut::<UdpSocket>(self.handle);
            match socket.recv_slice(buf) {
                Ok((n, meta)) => Poll::Ready(Ok((n, std_endpoint(meta.endpoint)))),
                Err(udp::RecvError::Exhausted) => {
                    socket.register_recv_waker(cx.waker());
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(Error::Udp(format!("Receive failed: {}", e)))),
            }
        })
        .await
    }

    /// Close the socket and release it. Pending operations fail with
    /// [`Error::Closed`]. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.stack.state();
        let socket = state.sockets.get_mut::<UdpSocket>(self.handle);
        // close() wakes any registered wakers before the socket goes away.
        socket.close();
        state.sockets.remove(self.handle);
        drop(state);
        self.stack.wake();
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_in_use_sees_bound_udp_socket() {
        let mut sockets = SocketSet::new(vec![]);
        let mut socket = make_udp_socket();
        socket
            .bind(IpListenEndpoint {
                addr: None,
                port: 50000,
            })
            .unwrap();
        sockets.add(socket);

        assert!(port_in_use(&sockets, 50000));
        assert!(!port_in_use(&sockets, 50001));
    }

    #[test]
    fn test_port_in_use_sees_listening_tcp_socket() {
        let mut sockets = SocketSet::new(vec![]);
        let mut socket = make_tcp_socket();
        socket
            .listen(IpListenEndpoint {
                addr: None,
                port: 50002,
            })
            .unwrap();
        sockets.add(socket);

        assert!(port_in_use(&sockets, 50002));
    }

    #[test]
    fn test_ephemeral_port_in_dynamic_range() {
        let sockets = SocketSet::new(vec![]);
        for _ in 0..32 {
            let port = ephemeral_port(&sockets).unwrap();
            assert!(port >= EPHEMERAL_PORT_MIN);
        }
    }

    #[test]
    fn test_ephemeral_port_skips_used_ports() {
        let mut sockets = SocketSet::new(vec![]);
        let mut socket = make_udp_socket();
        socket
            .bind(IpListenEndpoint {
                addr: None,
                port: 49160,
            })
            .unwrap();
        sockets.add(socket);

        for _ in 0..32 {
            assert_ne!(ephemeral_port(&sockets).unwrap(), 49160);
        }
    }
}
