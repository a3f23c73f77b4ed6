//! Connection listeners and multiplexing
//!
//! The accept-side abstractions of the crate. [`Listener`] is the common
//! trait; [`ChannelListener`] is its channel-backed workhorse, delivering
//! connections produced elsewhere and latching exactly one close error for
//! every blocked and future accept. [`MergeListener`] fans several
//! listeners into one accept point; [`StubListener`] never delivers and
//! exists to hold an address.

mod merge;
mod stub;

pub use merge::MergeListener;
pub use stub::StubListener;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

/// A bidirectional byte-stream connection.
///
/// Blanket-implemented for everything that reads and writes async, so
/// tunnel streams, in-memory pipes, and OS sockets all fit.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// An owned, type-erased connection.
pub type BoxConn = Box<dyn Conn>;

/// Address carried by a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAddr {
    /// A concrete socket address.
    Socket(SocketAddr),
    /// A named pseudo-address for listeners without a real endpoint.
    Named {
        /// Transport tag, e.g. `"stub"`.
        network: String,
        /// Human-readable name.
        name: String,
    },
}

impl ListenerAddr {
    /// The transport tag of this address.
    pub fn network(&self) -> &str {
        match self {
            ListenerAddr::Socket(_) => "tcp",
            ListenerAddr::Named { network, .. } => network,
        }
    }
}

impl fmt::Display for ListenerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerAddr::Socket(addr) => write!(f, "{}", addr),
            ListenerAddr::Named { name, .. } => f.write_str(name),
        }
    }
}

/// Something connections can be accepted from.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection.
    async fn accept(&self) -> Result<BoxConn>;

    /// The listener's address.
    fn addr(&self) -> ListenerAddr;

    /// Close the listener. Blocked accepts unblock with an error; repeat
    /// closes are harmless.
    async fn close(&self) -> Result<()>;
}

/// One-shot close latch: stores the first close error and broadcasts
/// closure to every waiter exactly once.
pub(crate) struct CloseLatch {
    err: OnceLock<Error>,
    done: Notify,
}

impl CloseLatch {
    pub(crate) fn new() -> Self {
        Self {
            err: OnceLock::new(),
            done: Notify::new(),
        }
    }

    /// Latch `err` if nothing is latched yet. Returns whether this call
    /// won; the winner fires the broadcast.
    pub(crate) fn close_with(&self, err: Error) -> bool {
        if self.err.set(err).is_ok() {
            self.done.notify_waiters();
            true
        } else {
            false
        }
    }

    /// The latched error, if any.
    pub(crate) fn error(&self) -> Option<Error> {
        self.err.get().cloned()
    }

    /// Wait until the latch fires and return the latched error.
    pub(crate) async fn closed(&self) -> Error {
        let notified = self.done.notified();
        tokio::pin!(notified);
        // Register before checking so a concurrent close_with cannot slip
        // between the check and the await.
        notified.as_mut().enable();
        if let Some(err) = self.err.get() {
            return err.clone();
        }
        notified.await;
        self.err.get().cloned().unwrap_or(Error::Closed)
    }
}

/// Listener over a channel of ready connections.
///
/// Producers push established connections into the sending half; `accept`
/// takes them out. The first close error wins and is replayed verbatim to
/// every subsequent accept.
pub struct ChannelListener {
    rx: Mutex<mpsc::Receiver<BoxConn>>,
    addr: ListenerAddr,
    latch: CloseLatch,
}

impl ChannelListener {
    /// Wrap a receiving channel half as a listener with the given address.
    pub fn new(rx: mpsc::Receiver<BoxConn>, addr: ListenerAddr) -> Self {
        Self {
            rx: Mutex::new(rx),
            addr,
            latch: CloseLatch::new(),
        }
    }

    /// The listener's address.
    pub fn addr(&self) -> ListenerAddr {
        self.addr.clone()
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<BoxConn> {
        if let Some(err) = self.latch.error() {
            return Err(err);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            err = self.latch.closed() => Err(err),
            conn = rx.recv() => match conn {
                Some(conn) => Ok(conn),
                None => {
                    // Every producer is gone; the listener closes itself.
                    self.latch.close_with(Error::Closed);
                    Err(self.latch.error().unwrap_or(Error::Closed))
                }
            }
        }
    }

    /// Close with a specific error. Only the first caller's error sticks;
    /// all calls succeed.
    pub fn close_with(&self, err: Error) -> Result<()> {
        if self.latch.close_with(err) {
            debug!("Listener on {} closed", self.addr);
        }
        Ok(())
    }

    /// Wait until the listener is closed and return its close error.
    pub async fn closed(&self) -> Error {
        self.latch.closed().await
    }

    /// The latched close error, if the listener is closed.
    pub fn close_error(&self) -> Option<Error> {
        self.latch.error()
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn accept(&self) -> Result<BoxConn> {
        ChannelListener::accept(self).await
    }

    fn addr(&self) -> ListenerAddr {
        ChannelListener::addr(self)
    }

    async fn close(&self) -> Result<()> {
        self.close_with(Error::Closed)
    }
}
