//! Error types for the plugin transport

use std::io;
use thiserror::Error;

use super::handshake::CORE_PROTOCOL_VERSION;

pub type Result<T, E = PluginError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(
        "Unrecognized remote plugin message: {line}\n\n\
         This usually means that the plugin is either invalid or simply\n\
         needs to be recompiled to support the latest protocol."
    )]
    MalformedHandshake { line: String },

    #[error("Error parsing core protocol version: {0}")]
    InvalidCoreProtocol(String),

    #[error(
        "Incompatible core API version with plugin. Plugin version: {plugin}, Core version: {core}\n\n\
         To fix this, the plugin usually only needs to be recompiled.\n\
         Please report this to the plugin author.",
        core = CORE_PROTOCOL_VERSION
    )]
    CoreProtocolMismatch { plugin: String },

    #[error(
        "Incompatible API version with plugin. Plugin version: {plugin}, Client versions: {supported:?}"
    )]
    AppProtocolMismatch { plugin: String, supported: Vec<u32> },

    #[error("Unsupported plugin protocol {protocol:?}. Supported: {allowed:?}")]
    UnsupportedProtocol {
        protocol: String,
        allowed: Vec<String>,
    },

    #[error("{address}: unknown address type {network:?}")]
    UnknownAddressType { network: String, address: String },

    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("error parsing server cert: {0}")]
    InvalidServerCert(String),

    #[error("timeout while waiting for plugin to start")]
    StartTimeout,

    #[error("plugin exited before we could connect")]
    ExitedBeforeHandshake,

    #[error("plugin process has exited")]
    PluginExited,

    #[error("timeout waiting for plugin to acknowledge shutdown")]
    ShutdownTimeout,

    #[error("timeout waiting for connection info")]
    ConnectionInfoTimeout,

    #[error("broker closed")]
    BrokerClosed,

    #[error("broker control stream already started")]
    StreamAlreadyStarted,

    #[error("couldn't bind plugin TCP listener")]
    TcpListenerBindFailed,

    #[error("plugin min port is greater than max port")]
    MinPortGreaterThanMaxPort,

    #[error("failed to get value from {var}: {value:?}")]
    InvalidEnvValue { var: &'static str, value: String },

    #[error(
        "This binary is a plugin. These are not meant to be executed directly.\n\
         Please execute the program that consumes these plugins, which will\n\
         load any plugins automatically"
    )]
    MagicCookieMismatch,

    #[error("Only one of Cmd or Reattach must be set")]
    CmdReattachConflict,

    #[error("only one of Reattach or SecureConfig can be set")]
    SecureConfigAndReattach,

    #[error("auto mTLS cannot be combined with an explicit TLS config")]
    AutoMtlsWithTlsConfig,

    #[error("checksums did not match")]
    ChecksumMismatch,

    #[error("error verifying checksum: {0}")]
    ChecksumRead(#[source] io::Error),

    #[error("no services registered for negotiated protocol version {0}")]
    NoServicesForVersion(u32),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("RPC error: {0}")]
    Status(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl PluginError {
    /// Whether this error comes from an incompatible build rather than a
    /// transient condition. These are never worth retrying.
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            Self::CoreProtocolMismatch { .. }
                | Self::AppProtocolMismatch { .. }
                | Self::UnsupportedProtocol { .. }
                | Self::MalformedHandshake { .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::BrokerClosed | Self::PluginExited)
    }
}

impl From<rustls::Error> for PluginError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<rcgen::Error> for PluginError {
    fn from(err: rcgen::Error) -> Self {
        Self::Certificate(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_mismatch_mentions_recompilation() {
        let err = PluginError::CoreProtocolMismatch {
            plugin: "9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Plugin version: 9"));
        assert!(msg.contains("recompiled"));
        assert!(err.is_protocol_mismatch());
    }

    #[test]
    fn closed_errors_are_classified() {
        assert!(PluginError::BrokerClosed.is_closed());
        assert!(PluginError::PluginExited.is_closed());
        assert!(!PluginError::ConnectionInfoTimeout.is_closed());
    }
}
