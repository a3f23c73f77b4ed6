//! WireGuard userspace control protocol codec
//!
//! The userspace device protocol is line-oriented ASCII: one `key=value`
//! pair per line. A set request configures keys, peers and routing; a get
//! response reports device state and is terminated by a blank line. This
//! module provides the typed entries, their canonical wire encodings, and
//! the decoder ([`parse`]).
//!
//! Entries are ordered. In a set operation every attribute entry after a
//! `public_key` line attaches to that peer, so [`Operation`] preserves
//! insertion order and the encoder never reorders.

mod config;
mod parser;

pub use config::{ClientConfig, ServerConfig, ServerPeer};
pub use parser::{parse, ParseError};

use crate::wg::{PresharedKey, PrivateKey, PublicKey};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, SocketAddr};

/// Default persistent keepalive interval in seconds.
pub const DEFAULT_PERSISTENT_KEEPALIVE: u16 = 25;

/// Default WireGuard listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Success status in an `errno` entry.
pub const ERRNO_NONE: i64 = 0;
/// Device I/O failure status.
pub const ERRNO_IO: i64 = -5;
/// Protocol violation status.
pub const ERRNO_PROTOCOL: i64 = -71;
/// Invalid request status.
pub const ERRNO_INVALID: i64 = -22;
/// Listen port already taken status.
pub const ERRNO_PORT_IN_USE: i64 = -98;
/// Unclassified failure status.
pub const ERRNO_UNKNOWN: i64 = -55;

/// The IPv4 subnet matching all traffic (`0.0.0.0/0`).
pub fn all_traffic() -> IpNet {
    IpNet::V4(Ipv4Net::default())
}

/// The IPv6 subnet matching all traffic (`::/0`).
pub fn all_traffic_v6() -> IpNet {
    IpNet::V6(Ipv6Net::default())
}

/// The subnet containing exactly one address (/32 for IPv4, /128 for IPv6).
pub fn identity(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::from(v4)),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::from(v6)),
    }
}

/// A single typed entry of the control protocol.
///
/// Each variant corresponds to one fixed wire key and carries its typed
/// payload; [`Entry::key`] and [`Entry::value`] produce the canonical wire
/// form. Entries are immutable once constructed.
#[derive(Debug, Clone)]
pub enum Entry {
    /// `private_key`: the local device key, lowercase hex.
    PrivateKey(PrivateKey),
    /// `public_key`: a peer's key, lowercase hex. Opens a peer section.
    PublicKey(PublicKey),
    /// `preshared_key`: a peer's optional symmetric key, lowercase hex.
    PresharedKey(PresharedKey),
    /// `endpoint`: a peer's UDP address, `host:port`.
    Endpoint(SocketAddr),
    /// `allowed_ip`: one subnet routed through the current peer, CIDR.
    AllowedIp(IpNet),
    /// `listen_port`: the device's UDP listen port.
    ListenPort(u16),
    /// `fwmark`: the device's firewall mark.
    Fwmark(u32),
    /// `persistent_keepalive_interval`: a peer's keepalive, seconds.
    PersistentKeepalive(u16),
    /// `replace_peers=true`: drop all peers before applying the rest.
    ReplacePeers,
    /// `remove=true`: remove the current peer.
    Remove,
    /// `update_only=true`: only touch the current peer if it exists.
    UpdateOnly,
    /// `replace_allowed_ips=true`: reset the current peer's subnets first.
    ReplaceAllowedIps,
    /// `protocol_version=1`: protocol version marker.
    ProtocolVersion,
    /// `get=1`: query request marker.
    Get,
    /// `set=1`: configuration request marker.
    Set,
    /// `rx_bytes`: bytes received from the current peer (get only).
    RxBytes(u64),
    /// `tx_bytes`: bytes sent to the current peer (get only).
    TxBytes(u64),
    /// `last_handshake_time_sec`: unix seconds of the last handshake.
    LastHandshakeSec(i64),
    /// `last_handshake_time_nsec`: nanosecond remainder of the above.
    LastHandshakeNsec(i64),
    /// `errno`: status code closing a response.
    Errno(i64),
}

impl Entry {
    /// The fixed wire key for this entry.
    pub fn key(&self) -> &'static str {
        match self {
            Entry::PrivateKey(_) => "private_key",
            Entry::PublicKey(_) => "public_key",
            Entry::PresharedKey(_) => "preshared_key",
            Entry::Endpoint(_) => "endpoint",
            Entry::AllowedIp(_) => "allowed_ip",
            Entry::ListenPort(_) => "listen_port",
            Entry::Fwmark(_) => "fwmark",
            Entry::PersistentKeepalive(_) => "persistent_keepalive_interval",
            Entry::ReplacePeers => "replace_peers",
            Entry::Remove => "remove",
            Entry::UpdateOnly => "update_only",
            Entry::ReplaceAllowedIps => "replace_allowed_ips",
            Entry::ProtocolVersion => "protocol_version",
            Entry::Get => "get",
            Entry::Set => "set",
            Entry::RxBytes(_) => "rx_bytes",
            Entry::TxBytes(_) => "tx_bytes",
            Entry::LastHandshakeSec(_) => "last_handshake_time_sec",
            Entry::LastHandshakeNsec(_) => "last_handshake_time_nsec",
            Entry::Errno(_) => "errno",
        }
    }

    /// The canonical wire encoding of this entry's value.
    pub fn value(&self) -> String {
        match self {
            Entry::PrivateKey(key) => key.to_hex(),
            Entry::PublicKey(key) => key.to_hex(),
            Entry::PresharedKey(key) => key.to_hex(),
            Entry::Endpoint(addr) => addr.to_string(),
            Entry::AllowedIp(net) => net.to_string(),
            Entry::ListenPort(port) => port.to_string(),
            Entry::Fwmark(mark) => mark.to_string(),
            Entry::PersistentKeepalive(interval) => interval.to_string(),
            Entry::ReplacePeers
            | Entry::Remove
            | Entry::UpdateOnly
            | Entry::ReplaceAllowedIps => "true".to_string(),
            Entry::ProtocolVersion | Entry::Get | Entry::Set => "1".to_string(),
            Entry::RxBytes(n) => n.to_string(),
            Entry::TxBytes(n) => n.to_string(),
            Entry::LastHandshakeSec(n) => n.to_string(),
            Entry::LastHandshakeNsec(n) => n.to_string(),
            Entry::Errno(n) => n.to_string(),
        }
    }
}

/// An ordered sequence of entries forming one request or response.
#[derive(Debug, Clone, Default)]
pub struct Operation {
    entries: Vec<Entry>,
}

impl Operation {
    /// Create an empty operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry.
    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Append every entry from an iterator.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = Entry>) {
        self.entries.extend(entries);
    }

    /// The entries in insertion order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Iterate over the entries in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the operation holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the wire form: one `key=value\n` per entry.
    ///
    /// No terminator line is appended; callers may concatenate several
    /// operations into one stream.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 32);
        for entry in &self.entries {
            out.extend_from_slice(entry.key().as_bytes());
            out.push(b'=');
            out.extend_from_slice(entry.value().as_bytes());
            out.push(b'\n');
        }
        out
    }
}

impl From<Vec<Entry>> for Operation {
    fn from(entries: Vec<Entry>) -> Self {
        Self { entries }
    }
}

impl FromIterator<Entry> for Operation {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Operation {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// A value that renders itself as a control-protocol byte stream.
pub trait Configurable {
    /// The configuration as wire bytes, ready for the tunnel transport.
    fn uapi(&self) -> Vec<u8>;
}

impl Configurable for Operation {
    fn uapi(&self) -> Vec<u8> {
        self.encode()
    }
}
