//! Tunnel lifecycle
//!
//! [`Tunnel`] ties a [`TunnelTransport`] to a control protocol
//! configuration: construction applies the configuration and brings the
//! transport up, close tears both down exactly once.

use crate::error::{Error, Result};
use crate::uapi::{self, Configurable, Operation};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// A configurable packet transport with an up/down lifecycle.
///
/// Configuration crosses this trait in the control protocol's wire form,
/// which keeps the trait object-safe and transports swappable.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Apply a control protocol set operation.
    async fn apply_config(&self, config: &[u8]) -> Result<()>;

    /// Render the current state as a control protocol get response.
    async fn fetch_config(&self) -> Result<Vec<u8>>;

    /// Start moving packets.
    async fn up(&self) -> Result<()>;

    /// Stop moving packets. Idempotent.
    async fn down(&self) -> Result<()>;

    /// Stop moving packets and release the underlying device.
    async fn close(&self) -> Result<()>;
}

/// A running tunnel over some transport.
pub struct Tunnel {
    transport: Box<dyn TunnelTransport>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Configure `transport` and bring it up.
    ///
    /// On failure the transport is closed before the error is returned, so
    /// a tunnel is never left half-open.
    pub async fn new(
        transport: Box<dyn TunnelTransport>,
        config: &dyn Configurable,
    ) -> Result<Self> {
        if let Err(e) = transport.apply_config(&config.uapi()).await {
            close_quietly(&*transport).await;
            return Err(e);
        }
        if let Err(e) = transport.up().await {
            close_quietly(&*transport).await;
            return Err(e);
        }

        info!("Tunnel established");
        Ok(Self {
            transport,
            closed: AtomicBool::new(false),
        })
    }

    /// Fetch and decode the transport's current configuration.
    pub async fn config(&self) -> Result<Operation> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let bytes = self.transport.fetch_config().await?;
        Ok(uapi::parse(&bytes)?)
    }

    /// Tear the tunnel down. Later calls return `Ok` without effect.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let down = self.transport.down().await;
        let close = self.transport.close().await;
        info!("Tunnel closed");
        down.and(close)
    }
}

async fn close_quietly(transport: &dyn TunnelTransport) {
    if let Err(e) = transport.close().await {
        warn!("Failed to close transport: {}", e);
    }
}
