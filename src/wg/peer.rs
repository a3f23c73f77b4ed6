//! Per-peer session state
//!
//! Each WireGuard peer owns one boringtun [`Tunn`] instance; a `Tunn` is a
//! single pairwise noise session, so the transport keeps a collection of
//! peers keyed by public key. Peers are plain data mutated under the
//! transport's state lock.

use crate::error::{Error, Result};
use crate::wg::{PresharedKey, PrivateKey, PublicKey};
use boringtun::noise::Tunn;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// A configured peer and its live noise session.
pub(crate) struct Peer {
    /// The peer's static public key.
    pub public_key: PublicKey,
    /// Noise session for this peer.
    pub tunn: Tunn,
    /// Remote UDP address, if known.
    pub endpoint: Option<SocketAddr>,
    /// Subnets routed to this peer.
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds; `None` disables keepalives.
    pub keepalive: Option<u16>,
    /// Optional symmetric key mixed into the handshake.
    pub preshared_key: Option<PresharedKey>,
    /// Session index, unique within the owning transport.
    pub index: u32,
    /// Encrypted bytes sent to this peer.
    pub tx_bytes: u64,
    /// Encrypted bytes received from this peer.
    pub rx_bytes: u64,
}

impl Peer {
    /// Create a peer with a fresh noise session and no routes.
    pub fn new(
        local_private: &PrivateKey,
        public_key: PublicKey,
        preshared_key: Option<PresharedKey>,
        keepalive: Option<u16>,
        index: u32,
    ) -> Result<Self> {
        let tunn = build_tunn(
            local_private,
            &public_key,
            preshared_key.as_ref(),
            keepalive,
            index,
        )?;

        Ok(Self {
            public_key,
            tunn,
            endpoint: None,
            allowed_ips: Vec::new(),
            keepalive,
            preshared_key,
            index,
            tx_bytes: 0,
            rx_bytes: 0,
        })
    }

    /// Rebuild the noise session from the current peer parameters.
    ///
    /// Any established session is dropped; the next handshake starts from
    /// scratch. Used when the device rekeys or a peer's handshake inputs
    /// (preshared key, keepalive) change.
    pub fn rebuild_session(&mut self, local_private: &PrivateKey) -> Result<()> {
        self.tunn = build_tunn(
            local_private,
            &self.public_key,
            self.preshared_key.as_ref(),
            self.keepalive,
            self.index,
        )?;
        Ok(())
    }

    /// Length of the longest allowed-ips prefix containing `addr`.
    pub fn allows(&self, addr: IpAddr) -> Option<u8> {
        self.allowed_ips
            .iter()
            .filter(|net| net.contains(&addr))
            .map(|net| net.prefix_len())
            .max()
    }

    /// Wall-clock time of the most recent completed handshake.
    pub fn last_handshake(&self) -> Option<SystemTime> {
        self.tunn
            .time_since_last_handshake()
            .map(|elapsed| SystemTime::now() - elapsed)
    }
}

/// One peer section of a set operation, accumulated until the section ends.
pub(crate) struct PeerUpdate {
    /// Key from the `public_key` line that opened the section.
    pub public_key: PublicKey,
    /// Remove the peer instead of configuring it.
    pub remove: bool,
    /// Only apply if the peer already exists.
    pub update_only: bool,
    /// Clear existing allowed-ips before adding the section's.
    pub replace_allowed_ips: bool,
    /// New preshared key, if the section carried one.
    pub preshared_key: Option<PresharedKey>,
    /// New endpoint, if the section carried one.
    pub endpoint: Option<SocketAddr>,
    /// New keepalive in seconds; `Some(0)` disables keepalives.
    pub keepalive: Option<u16>,
    /// Allowed-ips listed in the section, in order.
    pub allowed_ips: Vec<IpNet>,
}

impl PeerUpdate {
    /// Start an empty update for the given peer.
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            remove: false,
            update_only: false,
            replace_allowed_ips: false,
            preshared_key: None,
            endpoint: None,
            keepalive: None,
            allowed_ips: Vec::new(),
        }
    }
}

fn build_tunn(
    local_private: &PrivateKey,
    public_key: &PublicKey,
    preshared_key: Option<&PresharedKey>,
    keepalive: Option<u16>,
    index: u32,
) -> Result<Tunn> {
    Tunn::new(
        StaticSecret::from(*local_private.as_bytes()),
        X25519PublicKey::from(*public_key.as_bytes()),
        preshared_key.map(|key| *key.as_bytes()),
        keepalive,
        index,
        None,
    )
    .map_err(|e| {
        Error::WireGuard(format!(
            "Failed to create session for peer {}: {}",
            public_key, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> Peer {
        let local = PrivateKey::generate();
        let remote = PrivateKey::generate().public_key();
        Peer::new(&local, remote, None, Some(25), 0).unwrap()
    }

    #[test]
    fn test_peer_new() {
        let peer = test_peer();
        assert!(peer.endpoint.is_none());
        assert!(peer.allowed_ips.is_empty());
        assert_eq!(peer.keepalive, Some(25));
        assert_eq!(peer.tx_bytes, 0);
        assert_eq!(peer.rx_bytes, 0);
    }

    #[test]
    fn test_peer_no_handshake_initially() {
        let peer = test_peer();
        assert!(peer.last_handshake().is_none());
    }

    #[test]
    fn test_peer_allows_longest_prefix() {
        let mut peer = test_peer();
        peer.allowed_ips = vec![
            "10.0.0.0/8".parse().unwrap(),
            "10.1.0.0/16".parse().unwrap(),
        ];

        assert_eq!(peer.allows("10.1.2.3".parse().unwrap()), Some(16));
        assert_eq!(peer.allows("10.99.0.1".parse().unwrap()), Some(8));
        assert_eq!(peer.allows("192.168.0.1".parse().unwrap()), None);
    }

    #[test]
    fn test_peer_allows_v6() {
        let mut peer = test_peer();
        peer.allowed_ips = vec!["fd00::/64".parse().unwrap()];

        assert_eq!(peer.allows("fd00::1".parse().unwrap()), Some(64));
        assert_eq!(peer.allows("fe80::1".parse().unwrap()), None);
    }

    #[test]
    fn test_rebuild_session_keeps_config() {
        let local = PrivateKey::generate();
        let remote = PrivateKey::generate().public_key();
        let mut peer = Peer::new(&local, remote.clone(), None, Some(15), 7).unwrap();
        peer.endpoint = Some("127.0.0.1:51820".parse().unwrap());
        peer.tx_bytes = 42;

        peer.rebuild_session(&local).unwrap();

        assert_eq!(peer.public_key, remote);
        assert_eq!(peer.keepalive, Some(15));
        assert_eq!(peer.index, 7);
        assert_eq!(peer.endpoint, Some("127.0.0.1:51820".parse().unwrap()));
        assert_eq!(peer.tx_bytes, 42);
    }

    #[test]
    fn test_peer_update_defaults() {
        let update = PeerUpdate::new(PrivateKey::generate().public_key());
        assert!(!update.remove);
        assert!(!update.update_only);
        assert!(!update.replace_allowed_ips);
        assert!(update.preshared_key.is_none());
        assert!(update.endpoint.is_none());
        assert!(update.keepalive.is_none());
        assert!(update.allowed_ips.is_empty());
    }
}
