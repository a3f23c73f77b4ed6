//! Stub listener
//!
//! A listener that never produces a connection. Useful as a placeholder
//! source: it occupies an address and blocks accepts until closed, at
//! which point it behaves like any closed [`ChannelListener`].

use super::{BoxConn, ChannelListener, Listener, ListenerAddr};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A named listener that blocks every accept until closed.
pub struct StubListener {
    inner: ChannelListener,
    // Parked sender: keeps the channel open so accepts block instead of
    // observing a closed channel.
    _tx: mpsc::Sender<BoxConn>,
}

impl StubListener {
    /// Create a stub listener carrying `name` on the `"stub"` network.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let addr = ListenerAddr::Named {
            network: "stub".to_string(),
            name: name.into(),
        };
        Self {
            inner: ChannelListener::new(rx, addr),
            _tx: tx,
        }
    }
}

#[async_trait]
impl Listener for StubListener {
    async fn accept(&self) -> Result<BoxConn> {
        self.inner.accept().await
    }

    fn addr(&self) -> ListenerAddr {
        self.inner.addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close_with(Error::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_addr_reports_stub_network() {
        let stub = StubListener::new("wg.internal");
        assert_eq!(stub.addr().network(), "stub");
        assert_eq!(stub.addr().to_string(), "wg.internal");
    }

    #[tokio::test]
    async fn test_accept_blocks_until_closed() {
        let stub = Arc::new(StubListener::new("wg.internal"));

        let pending = {
            let stub = stub.clone();
            tokio::spawn(async move { stub.accept().await })
        };
        // Still blocked after a grace period.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        stub.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Closed)));
    }
}
