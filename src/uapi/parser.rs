//! Control protocol decoder
//!
//! Decoding is table-driven: each wire key maps to a typed value decoder.
//! The table is built once at first use and is read-only afterwards. Every
//! failure is fatal to the decode call and reports the zero-based line
//! index, so a device's malformed response pinpoints the offending line.

use super::{Entry, Operation};
use crate::wg::{PresharedKey, PrivateKey, PublicKey};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::OnceLock;
use thiserror::Error;

/// Control protocol decode failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A non-blank line without a `=` separator.
    #[error("line {line}: expected key=value, got {content:?}")]
    MalformedLine {
        /// Zero-based line index in the input.
        line: usize,
        /// The offending line text.
        content: String,
    },

    /// A key absent from the decoder table.
    #[error("line {line}: unknown key {key:?}")]
    UnknownKey {
        /// Zero-based line index in the input.
        line: usize,
        /// The unrecognized key.
        key: String,
    },

    /// A value rejected by its key's typed decoder.
    #[error("line {line}: invalid value for {key}: {reason}")]
    InvalidValue {
        /// Zero-based line index in the input.
        line: usize,
        /// The key whose value failed to decode.
        key: String,
        /// The underlying cause.
        reason: String,
    },
}

type ValueDecoder = fn(&str) -> Result<Entry, String>;

static DECODERS: OnceLock<HashMap<&'static str, ValueDecoder>> = OnceLock::new();

fn decoders() -> &'static HashMap<&'static str, ValueDecoder> {
    DECODERS.get_or_init(|| {
        let mut table: HashMap<&'static str, ValueDecoder> = HashMap::new();
        table.insert("private_key", |v| {
            PrivateKey::from_hex(v)
                .map(Entry::PrivateKey)
                .map_err(|e| e.to_string())
        });
        table.insert("public_key", |v| {
            PublicKey::from_hex(v)
                .map(Entry::PublicKey)
                .map_err(|e| e.to_string())
        });
        table.insert("preshared_key", |v| {
            PresharedKey::from_hex(v)
                .map(Entry::PresharedKey)
                .map_err(|e| e.to_string())
        });
        table.insert("endpoint", |v| {
            v.parse::<SocketAddr>()
                .map(Entry::Endpoint)
                .map_err(|e| e.to_string())
        });
        table.insert("allowed_ip", |v| {
            v.parse::<IpNet>()
                .map(Entry::AllowedIp)
                .map_err(|e| e.to_string())
        });
        table.insert("listen_port", |v| {
            v.parse().map(Entry::ListenPort).map_err(u16_err)
        });
        table.insert("fwmark", |v| {
            v.parse::<u32>()
                .map(Entry::Fwmark)
                .map_err(|e| e.to_string())
        });
        table.insert("persistent_keepalive_interval", |v| {
            v.parse().map(Entry::PersistentKeepalive).map_err(u16_err)
        });
        table.insert("replace_peers", |v| flag(v, Entry::ReplacePeers));
        table.insert("remove", |v| flag(v, Entry::Remove));
        table.insert("update_only", |v| flag(v, Entry::UpdateOnly));
        table.insert("replace_allowed_ips", |v| flag(v, Entry::ReplaceAllowedIps));
        table.insert("protocol_version", |v| directive(v, Entry::ProtocolVersion));
        table.insert("get", |v| directive(v, Entry::Get));
        table.insert("set", |v| directive(v, Entry::Set));
        table.insert("rx_bytes", |v| {
            v.parse::<u64>()
                .map(Entry::RxBytes)
                .map_err(|e| e.to_string())
        });
        table.insert("tx_bytes", |v| {
            v.parse::<u64>()
                .map(Entry::TxBytes)
                .map_err(|e| e.to_string())
        });
        table.insert("last_handshake_time_sec", |v| {
            v.parse::<i64>()
                .map(Entry::LastHandshakeSec)
                .map_err(|e| e.to_string())
        });
        table.insert("last_handshake_time_nsec", |v| {
            v.parse::<i64>()
                .map(Entry::LastHandshakeNsec)
                .map_err(|e| e.to_string())
        });
        table.insert("errno", |v| {
            v.parse::<i64>()
                .map(Entry::Errno)
                .map_err(|e| e.to_string())
        });
        table
    })
}

fn u16_err(e: std::num::ParseIntError) -> String {
    e.to_string()
}

fn flag(value: &str, entry: Entry) -> Result<Entry, String> {
    if value == "true" {
        Ok(entry)
    } else {
        Err(format!("expected \"true\", got {:?}", value))
    }
}

fn directive(value: &str, entry: Entry) -> Result<Entry, String> {
    if value == "1" {
        Ok(entry)
    } else {
        Err(format!("expected \"1\", got {:?}", value))
    }
}

/// Decode a control protocol byte stream into an [`Operation`].
///
/// A blank line ends decoding successfully; any bytes after it are
/// ignored. An input without a blank line decodes to its end. Each
/// non-blank line is split on its first `=`, the key is looked up in the
/// decoder table, and the value is decoded by the key's typed decoder.
pub fn parse(input: &[u8]) -> Result<Operation, ParseError> {
    let mut op = Operation::new();
    for (index, mut line) in input.split(|&b| b == b'\n').enumerate() {
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            // Terminator: stop here even if more bytes follow.
            return Ok(op);
        }
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(_) => {
                return Err(ParseError::MalformedLine {
                    line: index,
                    content: String::from_utf8_lossy(line).into_owned(),
                })
            }
        };
        let (key, value) = text.split_once('=').ok_or_else(|| ParseError::MalformedLine {
            line: index,
            content: text.to_string(),
        })?;
        let decode = decoders().get(key).ok_or_else(|| ParseError::UnknownKey {
            line: index,
            key: key.to_string(),
        })?;
        let entry = decode(value).map_err(|reason| ParseError::InvalidValue {
            line: index,
            key: key.to_string(),
            reason,
        })?;
        op.push(entry);
    }
    Ok(op)
}
