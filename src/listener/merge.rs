//! Listener fan-in
//!
//! Merges several listeners into one accept point. Each source gets a
//! forwarding worker; accepted connections funnel through a rendezvous
//! channel into a shared [`ChannelListener`]. The first source failure
//! closes the aggregate with that error; connections accepted after the
//! aggregate closed are shut down and discarded rather than leaked.

use super::{BoxConn, ChannelListener, Listener, ListenerAddr};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bound on waiting for forwarding workers during close.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Several listeners behind one accept point.
///
/// Carries the primary listener's address. No ordering or fairness across
/// sources is guaranteed.
pub struct MergeListener {
    inner: Arc<ChannelListener>,
    sources: Vec<Arc<dyn Listener>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MergeListener {
    /// Merge `primary` with any number of additional sources.
    ///
    /// Must be called within a Tokio runtime.
    pub fn wrap(primary: Box<dyn Listener>, extra: Vec<Box<dyn Listener>>) -> Self {
        let addr = primary.addr();
        let mut sources: Vec<Arc<dyn Listener>> = Vec::with_capacity(1 + extra.len());
        sources.push(Arc::from(primary));
        sources.extend(extra.into_iter().map(Arc::from));

        let (tx, rx) = mpsc::channel(1);
        let inner = Arc::new(ChannelListener::new(rx, addr));

        let workers = sources
            .iter()
            .map(|source| tokio::spawn(forward(source.clone(), tx.clone(), inner.clone())))
            .collect();
        // The local sender drops here, so the channel closes once every
        // worker is done.

        debug!("Merged {} listeners behind {}", sources.len(), inner.addr());
        Self {
            inner,
            sources,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        }
    }

    /// Wait for the next connection from any source.
    pub async fn accept(&self) -> Result<BoxConn> {
        self.inner.accept().await
    }

    /// The primary listener's address.
    pub fn addr(&self) -> ListenerAddr {
        self.inner.addr()
    }

    /// Close the aggregate and every source.
    ///
    /// All sources are closed even if some fail; a single failure is
    /// returned verbatim, several are combined into [`Error::Shutdown`].
    /// Repeat closes return `Ok`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.close_with(Error::Closed)?;

        let mut failures = Vec::new();
        for source in &self.sources {
            if let Err(err) = source.close().await {
                failures.push(err);
            }
        }

        let workers = {
            let mut slot = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *slot)
        };
        for worker in workers {
            if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, worker).await.is_err() {
                warn!("Forwarding worker did not stop in time");
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(Error::Shutdown(
                failures
                    .iter()
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}

#[async_trait]
impl Listener for MergeListener {
    async fn accept(&self) -> Result<BoxConn> {
        MergeListener::accept(self).await
    }

    fn addr(&self) -> ListenerAddr {
        MergeListener::addr(self)
    }

    async fn close(&self) -> Result<()> {
        MergeListener::close(self).await
    }
}

async fn forward(source: Arc<dyn Listener>, tx: mpsc::Sender<BoxConn>, inner: Arc<ChannelListener>) {
    loop {
        let conn = match source.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                // The first failing source decides the aggregate's error.
                let _ = inner.close_with(err);
                return;
            }
        };
        tokio::select! {
            biased;
            _ = inner.closed() => {
                discard(conn).await;
                return;
            }
            permit = tx.reserve() => match permit {
                Ok(permit) => permit.send(conn),
                Err(_) => {
                    discard(conn).await;
                    return;
                }
            }
        }
    }
}

async fn discard(mut conn: BoxConn) {
    conn.shutdown().await.ok();
}
