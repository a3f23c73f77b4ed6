//! Typed tunnel configurations
//!
//! High-level descriptions of the two tunnel roles. Each expands to a
//! control protocol [`Operation`] with a fixed entry order, so the bytes
//! handed to a device are reproducible and easy to assert on.

use super::{identity, Configurable, Entry, Operation, DEFAULT_LISTEN_PORT, DEFAULT_PERSISTENT_KEEPALIVE};
use crate::error::{Error, Result};
use crate::wg::{PresharedKey, PrivateKey, PublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Configuration for the dialing side of a tunnel.
///
/// A client has exactly one peer: the server it connects out to. Entries
/// are emitted in a fixed order, with `replace_peers` right after the
/// device keys so applying the same config twice stays idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// This node's private key.
    pub private_key: PrivateKey,
    /// The server's public key.
    pub public_key: PublicKey,
    /// Optional preshared key mixed into the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<PresharedKey>,
    /// The server's address and port.
    pub endpoint: SocketAddr,
    /// Keepalive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
    /// Networks routed through the tunnel.
    pub allowed_ips: Vec<IpNet>,
}

fn default_keepalive() -> u16 {
    DEFAULT_PERSISTENT_KEEPALIVE
}

impl ClientConfig {
    /// Create a client configuration with the default keepalive and no
    /// routed networks. Call [`allow_all_traffic`](Self::allow_all_traffic)
    /// or push into `allowed_ips` before use.
    pub fn new(private_key: PrivateKey, public_key: PublicKey, endpoint: SocketAddr) -> Self {
        Self {
            private_key,
            public_key,
            preshared_key: None,
            endpoint,
            persistent_keepalive: DEFAULT_PERSISTENT_KEEPALIVE,
            allowed_ips: Vec::new(),
        }
    }

    /// Route all IPv4 and IPv6 traffic through the tunnel.
    pub fn allow_all_traffic(mut self) -> Self {
        self.allowed_ips.push(super::all_traffic());
        self.allowed_ips.push(super::all_traffic_v6());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.allowed_ips.is_empty() {
            return Err(Error::Validation(
                "client config routes no networks; add at least one allowed IP".to_string(),
            ));
        }
        Ok(())
    }

    fn operation(&self) -> Operation {
        let mut op = Operation::new();
        op.push(Entry::PrivateKey(self.private_key.clone()));
        op.push(Entry::ReplacePeers);
        op.push(Entry::PublicKey(self.public_key.clone()));
        op.push(Entry::Endpoint(self.endpoint));
        if let Some(preshared) = &self.preshared_key {
            op.push(Entry::PresharedKey(preshared.clone()));
        }
        op.push(Entry::PersistentKeepalive(self.persistent_keepalive));
        for net in &self.allowed_ips {
            op.push(Entry::AllowedIp(*net));
        }
        op
    }
}

impl Configurable for ClientConfig {
    fn uapi(&self) -> Vec<u8> {
        self.operation().encode()
    }
}

/// One peer of a listening tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPeer {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Optional preshared key mixed into the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<PresharedKey>,
    /// The single tunnel address this peer may source traffic from.
    pub address: IpAddr,
}

/// Configuration for the listening side of a tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// This node's private key.
    pub private_key: PrivateKey,
    /// UDP port to receive encrypted traffic on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Allowed peers.
    pub peers: Vec<ServerPeer>,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

impl ServerConfig {
    /// Create a server configuration on the default port with no peers.
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key,
            listen_port: DEFAULT_LISTEN_PORT,
            peers: Vec::new(),
        }
    }

    /// Add a peer reachable at a single tunnel address.
    pub fn with_peer(mut self, public_key: PublicKey, address: IpAddr) -> Self {
        self.peers.push(ServerPeer {
            public_key,
            preshared_key: None,
            address,
        });
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(Error::Validation(
                "server config has no peers".to_string(),
            ));
        }
        Ok(())
    }

    fn operation(&self) -> Operation {
        let mut op = Operation::new();
        op.push(Entry::PrivateKey(self.private_key.clone()));
        op.push(Entry::ListenPort(self.listen_port));
        for peer in &self.peers {
            op.push(Entry::PublicKey(peer.public_key.clone()));
            if let Some(preshared) = &peer.preshared_key {
                op.push(Entry::PresharedKey(preshared.clone()));
            }
            op.push(Entry::AllowedIp(identity(peer.address)));
        }
        op
    }
}

impl Configurable for ServerConfig {
    fn uapi(&self) -> Vec<u8> {
        self.operation().encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (PrivateKey, PublicKey) {
        let private = PrivateKey::generate();
        let server = PrivateKey::generate().public_key();
        (private, server)
    }

    #[test]
    fn test_client_emits_entries_in_order() {
        let (private, server) = keys();
        let private_hex = private.to_hex();
        let server_hex = server.to_hex();
        let mut config = ClientConfig::new(private, server, "203.0.113.5:51820".parse().unwrap());
        config.allowed_ips.push("0.0.0.0/0".parse().unwrap());

        let text = String::from_utf8(config.uapi()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                format!("private_key={}", private_hex).as_str(),
                "replace_peers=true",
                format!("public_key={}", server_hex).as_str(),
                "endpoint=203.0.113.5:51820",
                "persistent_keepalive_interval=25",
                "allowed_ip=0.0.0.0/0",
            ]
        );
    }

    #[test]
    fn test_client_preshared_key_between_endpoint_and_keepalive() {
        let (private, server) = keys();
        let mut config = ClientConfig::new(private, server, "203.0.113.5:51820".parse().unwrap())
            .allow_all_traffic();
        config.preshared_key = Some(PresharedKey::generate());

        let text = String::from_utf8(config.uapi()).unwrap();
        let keys: Vec<&str> = text
            .lines()
            .map(|l| l.split_once('=').unwrap().0)
            .collect();
        assert_eq!(
            keys,
            vec![
                "private_key",
                "replace_peers",
                "public_key",
                "endpoint",
                "preshared_key",
                "persistent_keepalive_interval",
                "allowed_ip",
                "allowed_ip",
            ]
        );
    }

    #[test]
    fn test_allow_all_traffic_routes_both_families() {
        let (private, server) = keys();
        let config = ClientConfig::new(private, server, "203.0.113.5:51820".parse().unwrap())
            .allow_all_traffic();
        let text = String::from_utf8(config.uapi()).unwrap();
        assert!(text.contains("allowed_ip=0.0.0.0/0\n"));
        assert!(text.contains("allowed_ip=::/0\n"));
    }

    #[test]
    fn test_client_without_allowed_ips_fails_validation() {
        let (private, server) = keys();
        let config = ClientConfig::new(private, server, "203.0.113.5:51820".parse().unwrap());
        assert!(config.validate().is_err());
        assert!(config.clone().allow_all_traffic().validate().is_ok());
    }

    #[test]
    fn test_server_identity_allowed_ip_per_peer() {
        let private = PrivateKey::generate();
        let peer_a = PrivateKey::generate().public_key();
        let peer_b = PrivateKey::generate().public_key();
        let config = ServerConfig::new(private)
            .with_peer(peer_a, "10.10.0.2".parse().unwrap())
            .with_peer(peer_b, "fd00::2".parse().unwrap());

        let text = String::from_utf8(config.uapi()).unwrap();
        assert!(text.contains("listen_port=51820\n"));
        assert!(text.contains("allowed_ip=10.10.0.2/32\n"));
        assert!(text.contains("allowed_ip=fd00::2/128\n"));
    }

    #[test]
    fn test_server_without_peers_fails_validation() {
        let config = ServerConfig::new(PrivateKey::generate());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_configs_decode_cleanly() {
        let (private, server) = keys();
        let client = ClientConfig::new(private, server, "203.0.113.5:51820".parse().unwrap())
            .allow_all_traffic();
        let op = super::super::parse(&client.uapi()).unwrap();
        assert_eq!(op.len(), 7);
    }

    #[test]
    fn test_serde_round_trip() {
        let (private, server) = keys();
        let config = ClientConfig::new(private, server, "203.0.113.5:51820".parse().unwrap())
            .allow_all_traffic();
        let json = serde_json::to_string(&config).unwrap();
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.endpoint, config.endpoint);
        assert_eq!(back.persistent_keepalive, 25);
        assert_eq!(back.allowed_ips.len(), 2);
        assert_eq!(back.public_key, config.public_key);
    }
}
