//! wgbridge: Userspace WireGuard bridging library
//!
//! This library runs WireGuard tunnels entirely in process: packets flow
//! between a boringtun transport and an embedded smoltcp network stack, so
//! tunnelled TCP and UDP can be served without a kernel TUN interface or
//! elevated privileges.
//!
//! # Modules
//!
//! - `uapi`: Control protocol codec (the WireGuard key=value wire format)
//! - `tun`: Tunnel device abstraction packets move through
//! - `netstack`: Userspace TCP/UDP network stack behind the device
//! - `wg`: Keys, peers, and the boringtun transport
//! - `listener`: Connection fan-in across listeners
//! - `error`: Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod listener;
pub mod netstack;
pub mod tun;
pub mod uapi;
pub mod wg;

// Re-export commonly used types
pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
