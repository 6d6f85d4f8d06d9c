//! Handshake line parsing, formatting and protocol version negotiation
//!
//! A plugin announces itself by printing exactly one line to stdout:
//!
//! `CORE|APP|NETWORK|ADDRESS|PROTOCOL[|CERT]`
//!
//! The host reads that line once and uses it to dial the plugin.
use serde::{Serialize, Serializer};
use std::fmt;

use super::certs;
use super::error::{PluginError, Result};
use super::transport::PluginAddr;

/// Core protocol version. Host and plugin must agree on it exactly; a
/// mismatch means one side was built against an incompatible transport.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Protocol assumed when a plugin omits the fifth handshake field.
pub const DEFAULT_RPC_PROTOCOL: &str = "netrpc";

pub const PROTOCOL_GRPC: &str = "grpc";

const HANDSHAKE_DELIMITER: char = '|';
const HANDSHAKE_MAX_FIELDS: usize = 6;
const HANDSHAKE_MIN_FIELDS: usize = 4;

/// Certificates shorter than this are legacy "extra data" and ignored.
const MIN_CERT_FIELD_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tcp" => Some(Self::Tcp),
            "unix" => Some(Self::Unix),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parsed handshake line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handshake {
    pub core_protocol: u32,
    pub app_protocol: u32,
    pub network: Network,
    pub address: String,
    pub rpc_protocol: String,
    /// Raw DER of the plugin's leaf certificate, when it serves auto mTLS
    #[serde(serialize_with = "serialize_cert")]
    pub server_cert: Option<Vec<u8>>,
}

impl Handshake {
    pub fn new(app_protocol: u32, addr: &PluginAddr, rpc_protocol: impl Into<String>) -> Self {
        Self {
            core_protocol: CORE_PROTOCOL_VERSION,
            app_protocol,
            network: addr.network(),
            address: addr.to_string(),
            rpc_protocol: rpc_protocol.into(),
            server_cert: None,
        }
    }

    pub fn with_server_cert(mut self, der: Vec<u8>) -> Self {
        self.server_cert = Some(der);
        self
    }

    /// Parse a handshake line as printed by a plugin.
    ///
    /// Only the core protocol is checked here. The application protocol is
    /// parsed as advertised and negotiated by the caller with
    /// [`negotiate_version`].
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line
            .splitn(HANDSHAKE_MAX_FIELDS, HANDSHAKE_DELIMITER)
            .collect();

        if parts.len() < HANDSHAKE_MIN_FIELDS {
            return Err(PluginError::MalformedHandshake {
                line: line.to_string(),
            });
        }

        let core_protocol: u32 = parts[0]
            .parse()
            .map_err(|e: std::num::ParseIntError| PluginError::InvalidCoreProtocol(e.to_string()))?;
        if core_protocol != CORE_PROTOCOL_VERSION {
            return Err(PluginError::CoreProtocolMismatch {
                plugin: parts[0].to_string(),
            });
        }

        let app_protocol: u32 = parts[1].parse().map_err(|_| PluginError::AppProtocolMismatch {
            plugin: parts[1].to_string(),
            supported: Vec::new(),
        })?;

        let network = Network::parse(parts[2]).ok_or_else(|| PluginError::UnknownAddressType {
            network: parts[2].to_string(),
            address: parts[3].to_string(),
        })?;

        let rpc_protocol = parts
            .get(4)
            .map(|p| p.to_string())
            .unwrap_or_else(|| DEFAULT_RPC_PROTOCOL.to_string());

        let server_cert = match parts.get(5) {
            Some(cert) if cert.len() > MIN_CERT_FIELD_LEN => {
                Some(certs::decode_handshake_cert(cert)?.as_ref().to_vec())
            }
            _ => None,
        };

        Ok(Self {
            core_protocol,
            app_protocol,
            network,
            address: parts[3].to_string(),
            rpc_protocol,
            server_cert,
        })
    }

    /// Format the line a plugin prints on stdout. Never contains a newline.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{}|{}|{}|{}|{}",
            self.core_protocol, self.app_protocol, self.network, self.address, self.rpc_protocol
        );
        if let Some(der) = &self.server_cert {
            line.push(HANDSHAKE_DELIMITER);
            line.push_str(&certs::encode_handshake_cert(der));
        }
        line
    }

    pub fn addr(&self) -> Result<PluginAddr> {
        PluginAddr::resolve(self.network.as_str(), &self.address)
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

fn serialize_cert<S: Serializer>(cert: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match cert {
        Some(der) => serializer.serialize_some(&certs::encode_handshake_cert(der)),
        None => serializer.serialize_none(),
    }
}

/// Pick the highest version present in both `advertised` and `supported`.
pub fn negotiate_version(
    advertised: &[u32],
    supported: impl IntoIterator<Item = u32>,
) -> Option<u32> {
    supported
        .into_iter()
        .filter(|v| advertised.contains(v))
        .max()
}

/// Parse a comma separated version list such as `PLUGIN_PROTOCOL_VERSIONS`.
/// Empty entries are skipped.
pub fn parse_version_list(value: &str) -> Result<Vec<u32>, std::num::ParseIntError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::parse)
        .collect()
}
