//! WireGuard transport
//!
//! Key material handling, per-peer noise sessions, and the boringtun-backed
//! transport that shuttles packets between a tunnel device and the
//! encrypted UDP socket. The [`Tunnel`] type ties a transport to a control
//! protocol configuration and manages its lifecycle.

mod device;
mod keys;
mod peer;
mod tunnel;

/// Bytes of framing WireGuard adds above an inner IP packet: outer IPv4
/// and UDP headers plus the transport message header and auth tag.
pub const WIREGUARD_OVERHEAD: usize = 80;

pub use device::WgTransport;
pub use keys::{KeyPair, PresharedKey, PrivateKey, PublicKey};
pub use tunnel::{Tunnel, TunnelTransport};
