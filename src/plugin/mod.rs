/// Plugin transport for etxe
///
/// A host launches plugin processes (or reattaches to running ones), reads
/// the one-line handshake each plugin prints, and talks to it over gRPC.
/// On top of that single connection the broker lets either side open more
/// connections by service ID, and the stdio stream carries the plugin's
/// output back to the host.
pub mod broker;
pub mod certs;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod server;
pub mod stdio;
pub mod transport;

/// Generated gRPC types for the broker, stdio and controller services
pub mod protocol {
    tonic::include_proto!("etxe.plugin");
}

// Re-export commonly used types
pub use broker::Broker;
pub use client::{Client, ClientConfig, ReattachConfig, RpcClient, SecureConfig};
pub use config::{HandshakeConfig, PluginManifest};
pub use error::{PluginError, Result};
pub use handshake::Handshake;
pub use server::{PluginEnv, PluginServer, ServeConfig, serve};
pub use transport::PluginAddr;
