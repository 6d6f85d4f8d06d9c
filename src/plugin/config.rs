//! Shared configuration: handshake settings, environment variable names and
//! the YAML plugin manifest used by the CLI.
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::client::{ClientConfig, SecureConfig};
use super::handshake::PROTOCOL_GRPC;

/// Lower bound of the TCP port range handed to plugins
pub const ENV_MIN_PORT: &str = "PLUGIN_MIN_PORT";
/// Upper bound of the TCP port range handed to plugins
pub const ENV_MAX_PORT: &str = "PLUGIN_MAX_PORT";
/// Comma separated application protocol versions the host supports
pub const ENV_PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";
/// The host's PEM certificate when automatic mTLS is on
pub const ENV_CLIENT_CERT: &str = "PLUGIN_CLIENT_CERT";

pub const DEFAULT_MIN_PORT: u16 = 10_000;
pub const DEFAULT_MAX_PORT: u16 = 25_000;
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Names of the services a host expects at one protocol version
pub type ServiceSet = BTreeSet<String>;

/// Settings both the host and the plugin must agree on before a plugin is
/// allowed to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Default application protocol version
    pub protocol_version: u32,
    /// Environment variable the host sets so the plugin can tell it was
    /// launched by a host and not by hand.
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

impl HandshakeConfig {
    pub fn cookie_matches(&self, value: Option<&str>) -> bool {
        value == Some(self.magic_cookie_value.as_str())
    }
}

/// A plugin description loaded from YAML
///
/// ```yaml
/// command: etxe-plugin-echo
/// args: ["--quiet"]
/// handshake:
///   protocol_version: 1
///   magic_cookie_key: ETXE_PLUGIN
///   magic_cookie_value: d2a1c5e0
/// auto_mtls: true
/// versions:
///   1: [echo]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub min_port: Option<u16>,

    #[serde(default)]
    pub max_port: Option<u16>,

    #[serde(default)]
    pub start_timeout_secs: Option<u64>,

    #[serde(default)]
    pub auto_mtls: bool,

    #[serde(default = "default_allowed_protocols")]
    pub allowed_protocols: Vec<String>,

    /// Service names by application protocol version
    #[serde(default)]
    pub versions: BTreeMap<u32, ServiceSet>,

    /// Expected SHA-256 of the plugin binary, hex encoded
    #[serde(default)]
    pub checksum: Option<String>,
}

fn default_allowed_protocols() -> Vec<String> {
    vec![PROTOCOL_GRPC.to_string()]
}

impl PluginManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(content)?;

        if let (Some(min), Some(max)) = (manifest.min_port, manifest.max_port)
            && min > max
        {
            bail!("min_port ({min}) is greater than max_port ({max})");
        }

        Ok(manifest)
    }

    /// Resolve the command on PATH (relative to `base_dir` when it names a
    /// path) and build the host configuration.
    pub fn into_client_config(self, base_dir: &Path) -> Result<ClientConfig> {
        let program = resolve_command(&self.command, base_dir)?;

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&self.args).envs(&self.env);

        let secure = self
            .checksum
            .as_deref()
            .map(|hex_digest| {
                hex::decode(hex_digest.trim())
                    .map(|checksum| SecureConfig { checksum })
                    .with_context(|| format!("Invalid checksum {hex_digest:?}"))
            })
            .transpose()?;

        let mut config = ClientConfig::new(self.handshake);
        config.cmd = Some(cmd);
        config.secure = secure;
        config.auto_mtls = self.auto_mtls;
        config.allowed_protocols = self.allowed_protocols;
        config.versioned_services = self.versions;
        config.min_port = self.min_port.unwrap_or(DEFAULT_MIN_PORT);
        config.max_port = self.max_port.unwrap_or(DEFAULT_MAX_PORT);
        if let Some(secs) = self.start_timeout_secs {
            config.start_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn resolve_command(command: &str, base_dir: &Path) -> Result<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        let candidate = base_dir.join(path);
        if candidate.exists() {
            return Ok(candidate);
        }
        bail!("Plugin command not found: {}", candidate.display());
    }

    which::which(command).with_context(|| format!("Plugin command not found on PATH: {command}"))
}
