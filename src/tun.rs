//! Tunnel device abstraction
//!
//! The seam between packet producers (the userspace network stack) and
//! packet consumers (the WireGuard transport). Devices move whole IP
//! packets; framing, encryption, and routing live on either side of the
//! trait.

use crate::error::Result;
use async_trait::async_trait;

/// Lifecycle event emitted by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The device is ready to move packets.
    Up,
    /// The device has shut down and will move no more packets.
    Down,
}

/// A bidirectional IP packet device.
///
/// Methods take `&self`; implementations use interior mutability so a
/// device can be shared behind an [`Arc`](std::sync::Arc) by its reader,
/// writer, and event consumer at once.
#[async_trait]
pub trait Device: Send + Sync {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Maximum payload size of a single packet.
    fn mtu(&self) -> usize;

    /// Upper bound on packets moved per read or write call.
    fn batch_size(&self) -> usize;

    /// Wait for the next lifecycle event. Returns `None` once the event
    /// stream is exhausted.
    async fn next_event(&self) -> Option<Event>;

    /// Read outbound packets from the device.
    ///
    /// Each received packet `i` is copied into `bufs[i][offset..]` and its
    /// length stored in `sizes[i]`. Returns the number of packets filled,
    /// at least one; blocks until a packet arrives. Fails with
    /// [`Error::Closed`](crate::Error::Closed) once the device shuts down.
    async fn read(&self, bufs: &mut [&mut [u8]], sizes: &mut [usize], offset: usize) -> Result<usize>;

    /// Write inbound packets into the device.
    ///
    /// Each `bufs[i][offset..]` holds one whole IP packet. Returns the
    /// number of buffers consumed. Packets that are neither IPv4 nor IPv6
    /// are dropped without error.
    fn write(&self, bufs: &[&[u8]], offset: usize) -> Result<usize>;

    /// Shut down the device. Safe to call more than once; later calls
    /// return `Ok` without effect.
    async fn close(&self) -> Result<()>;
}
