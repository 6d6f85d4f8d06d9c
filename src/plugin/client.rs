/// Host side of a plugin session
///
/// A [`Client`] owns one plugin: it either launches the subprocess and reads
/// its handshake line, or reattaches to a plugin that is already running.
/// [`Client::client`] then opens the RPC session (broker control stream and
/// stdio forwarding) and [`Client::kill`] tears everything down.
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Channel;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, ControlStream};
use super::certs::{CertificateBundle, TlsSettings, generate_cert};
use super::config::{
    DEFAULT_MAX_PORT, DEFAULT_MIN_PORT, DEFAULT_START_TIMEOUT, ENV_CLIENT_CERT, ENV_MAX_PORT,
    ENV_MIN_PORT, ENV_PROTOCOL_VERSIONS, HandshakeConfig, ServiceSet,
};
use super::error::{PluginError, Result};
use super::handshake::{Handshake, PROTOCOL_GRPC, negotiate_version};
use super::listener::ListenConfig;
use super::protocol::Empty;
use super::protocol::grpc_controller_client::GrpcControllerClient;
use super::stdio::StdioClient;
use super::transport::{PluginAddr, connect_channel};

/// How long the plugin gets to acknowledge `Shutdown`, and then to exit,
/// before [`Client::kill`] kills the process.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything the host needs to launch (or reattach to) one plugin
pub struct ClientConfig {
    pub handshake: HandshakeConfig,

    /// Command to launch. Exactly one of `cmd` and `reattach` must be set.
    pub cmd: Option<Command>,
    pub reattach: Option<ReattachConfig>,

    /// Verify the plugin binary before launching it
    pub secure: Option<SecureConfig>,

    /// Services the host expects, by application protocol version. When
    /// empty, `handshake.protocol_version` is the only supported version.
    pub versioned_services: BTreeMap<u32, ServiceSet>,

    /// RPC protocols the host can speak
    pub allowed_protocols: Vec<String>,

    pub min_port: u16,
    pub max_port: u16,
    pub start_timeout: Duration,

    /// Generate certificates for both sides and pin each other's
    pub auto_mtls: bool,
    /// Manually provisioned TLS, mutually exclusive with `auto_mtls`
    pub tls: Option<TlsSettings>,

    /// Where forwarded plugin stdout/stderr go. Defaults to the host's own.
    pub stdout: Option<OutputSink>,
    pub stderr: Option<OutputSink>,
}

impl ClientConfig {
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            cmd: None,
            reattach: None,
            secure: None,
            versioned_services: BTreeMap::new(),
            allowed_protocols: vec![PROTOCOL_GRPC.to_string()],
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            start_timeout: DEFAULT_START_TIMEOUT,
            auto_mtls: false,
            tls: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Launch `cmd` as the plugin.
    pub fn with_cmd(mut self, cmd: Command) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Attach to an already running plugin instead of launching one.
    pub fn with_reattach(mut self, reattach: ReattachConfig) -> Self {
        self.reattach = Some(reattach);
        self
    }

    pub fn with_services(mut self, version: u32, services: ServiceSet) -> Self {
        self.versioned_services.insert(version, services);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.cmd.is_some() == self.reattach.is_some() {
            return Err(PluginError::CmdReattachConflict);
        }
        if self.secure.is_some() && self.reattach.is_some() {
            return Err(PluginError::SecureConfigAndReattach);
        }
        if self.auto_mtls && self.tls.is_some() {
            return Err(PluginError::AutoMtlsWithTlsConfig);
        }
        if self.min_port > self.max_port {
            return Err(PluginError::MinPortGreaterThanMaxPort);
        }
        Ok(())
    }

    fn supported_versions(&self) -> Vec<u32> {
        self.versioned_services.keys().copied().collect()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("handshake", &self.handshake)
            .field("cmd", &self.cmd)
            .field("reattach", &self.reattach)
            .field("secure", &self.secure)
            .field("versioned_services", &self.versioned_services)
            .field("allowed_protocols", &self.allowed_protocols)
            .field("min_port", &self.min_port)
            .field("max_port", &self.max_port)
            .field("start_timeout", &self.start_timeout)
            .field("auto_mtls", &self.auto_mtls)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Where to find a plugin that is already running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReattachConfig {
    pub protocol: String,
    pub protocol_version: u32,
    pub address: PluginAddr,
    pub pid: Option<u32>,
}

impl ReattachConfig {
    /// Reattach to the plugin that printed `handshake`.
    pub fn from_handshake(handshake: &Handshake) -> Result<Self> {
        Ok(Self {
            protocol: handshake.rpc_protocol.clone(),
            protocol_version: handshake.app_protocol,
            address: handshake.addr()?,
            pid: None,
        })
    }
}

/// Expected SHA-256 digest of the plugin executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureConfig {
    pub checksum: Vec<u8>,
}

impl SecureConfig {
    pub async fn check(&self, path: &Path) -> Result<()> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(PluginError::ChecksumRead)?;

        if Sha256::digest(&contents).as_slice() == self.checksum.as_slice() {
            Ok(())
        } else {
            Err(PluginError::ChecksumMismatch)
        }
    }
}

/// The application protocol version both sides agreed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub version: u32,
    pub services: ServiceSet,
}

/// An open RPC session with a plugin
pub struct RpcClient {
    channel: Channel,
    broker: Arc<Broker>,
    negotiated: Negotiated,
    closing: CancellationToken,
}

impl RpcClient {
    /// Channel for the plugin's own services
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Ask the plugin to stop serving and close the broker.
    ///
    /// The broker and stdio forwarding are closed however the shutdown call
    /// ends: on error, after [`GRACEFUL_SHUTDOWN_TIMEOUT`], or when this
    /// future is dropped.
    pub async fn close(&self) -> Result<()> {
        let _abandon = self.closing.clone().drop_guard();

        let mut controller = GrpcControllerClient::new(self.channel.clone());
        let shutdown = controller.shutdown(Empty {});
        let result = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, shutdown).await;

        self.abandon();

        match result {
            Ok(reply) => reply.map(|_| ()).map_err(PluginError::from),
            Err(_) => Err(PluginError::ShutdownTimeout),
        }
    }

    /// Close the broker and stop stdio forwarding without telling the plugin.
    fn abandon(&self) {
        self.broker.close();
        self.closing.cancel();
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("negotiated", &self.negotiated)
            .field("broker_closed", &self.broker.is_closed())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ProcessState {
    pid: Option<u32>,
    exited: bool,
    status: Option<ExitStatus>,
}

struct Session {
    config: ClientConfig,
    address: Option<PluginAddr>,
    protocol: String,
    negotiated: Option<Negotiated>,
    tls: Option<TlsSettings>,
}

/// Manages the lifecycle of one plugin
pub struct Client {
    /// Held across start and connect; [`Client::kill`] never takes it
    session: AsyncMutex<Session>,
    rpc: Mutex<Option<Arc<RpcClient>>>,
    reattached: bool,
    process: Arc<Mutex<ProcessState>>,
    /// Cancelled when teardown begins; aborts a start or connect in flight
    stopping: CancellationToken,
    /// Cancelled to force the subprocess down
    kill: CancellationToken,
    /// Cancelled once the subprocess has exited and its output is drained
    exited: CancellationToken,
    tasks: TaskTracker,
}

impl Client {
    pub fn new(mut config: ClientConfig) -> Self {
        if config.versioned_services.is_empty() {
            config
                .versioned_services
                .insert(config.handshake.protocol_version, ServiceSet::new());
        }

        let tls = config.tls.clone();
        let reattached = config.reattach.is_some();
        Self {
            session: AsyncMutex::new(Session {
                config,
                address: None,
                protocol: String::new(),
                negotiated: None,
                tls,
            }),
            rpc: Mutex::new(None),
            reattached,
            process: Arc::default(),
            stopping: CancellationToken::new(),
            kill: CancellationToken::new(),
            exited: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Launch or reattach to the plugin and return its address.
    ///
    /// Calling it again returns the same address without relaunching. Once
    /// a start has failed or [`kill`](Self::kill) has been called, it fails
    /// with [`PluginError::PluginExited`].
    pub async fn start(&self) -> Result<PluginAddr> {
        let mut session = self.session.lock().await;
        if let Some(address) = &session.address {
            return Ok(address.clone());
        }
        if self.stopping.is_cancelled() || self.kill.is_cancelled() {
            return Err(PluginError::PluginExited);
        }

        session.config.validate()?;

        if let Some(reattach) = session.config.reattach.clone() {
            return Ok(self.reattach(&mut session, reattach));
        }

        match self.launch(&mut session).await {
            Ok(address) => Ok(address),
            Err(e) => {
                // Never leave a half-started plugin behind
                self.kill.cancel();
                if self.pid().is_some()
                    && tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, self.exited.cancelled())
                        .await
                        .is_err()
                {
                    warn!("plugin did not exit after a failed start");
                }
                Err(e)
            }
        }
    }

    fn reattach(&self, session: &mut Session, reattach: ReattachConfig) -> PluginAddr {
        debug!(address = %reattach.address, pid = reattach.pid, "reattaching to plugin");

        let services = session
            .config
            .versioned_services
            .get(&reattach.protocol_version)
            .cloned()
            .unwrap_or_default();

        self.lock_process().pid = reattach.pid;
        session.protocol = reattach.protocol;
        session.negotiated = Some(Negotiated {
            version: reattach.protocol_version,
            services,
        });
        session.address = Some(reattach.address.clone());
        reattach.address
    }

    async fn launch(&self, session: &mut Session) -> Result<PluginAddr> {
        let Some(mut cmd) = session.config.cmd.take() else {
            return Err(PluginError::CmdReattachConflict);
        };
        let path = PathBuf::from(cmd.as_std().get_program());

        if let Some(secure) = &session.config.secure {
            let resolved = which::which(&path).unwrap_or_else(|_| path.clone());
            secure.check(&resolved).await?;
        }

        let config = &session.config;
        let versions = config
            .supported_versions()
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        cmd.env(&config.handshake.magic_cookie_key, &config.handshake.magic_cookie_value)
            .env(ENV_MIN_PORT, config.min_port.to_string())
            .env(ENV_MAX_PORT, config.max_port.to_string())
            .env(ENV_PROTOCOL_VERSIONS, versions)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let own_cert = if config.auto_mtls {
            info!("configuring client automatic mTLS");
            let bundle = generate_cert()?;
            cmd.env(ENV_CLIENT_CERT, bundle.cert_pem());
            Some(bundle)
        } else {
            None
        };

        if self.stopping.is_cancelled() {
            return Err(PluginError::PluginExited);
        }
        debug!(path = %path.display(), "starting plugin");
        let mut child = cmd.spawn()?;
        let pid = child.id();
        self.lock_process().pid = pid;
        debug!(path = %path.display(), pid, "plugin started");

        let (line_tx, line_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            self.tasks.spawn(read_stdout(stdout, line_tx, pid));
        }
        let stderr = child
            .stderr
            .take()
            .map(|stderr| self.tasks.spawn(drain_stderr(stderr, pid)));

        self.tasks.spawn(supervise(
            child,
            stderr,
            path.clone(),
            self.kill.clone(),
            self.exited.clone(),
            self.process.clone(),
        ));

        let line = tokio::select! {
            biased;
            line = line_rx => line.map_err(|_| PluginError::ExitedBeforeHandshake)?,
            _ = self.exited.cancelled() => return Err(PluginError::ExitedBeforeHandshake),
            _ = self.stopping.cancelled() => return Err(PluginError::PluginExited),
            _ = tokio::time::sleep(config.start_timeout) => return Err(PluginError::StartTimeout),
        };

        debug!(pid, line = %line.trim(), "received handshake");
        self.complete_handshake(session, &line, own_cert)
    }

    fn complete_handshake(
        &self,
        session: &mut Session,
        line: &str,
        own_cert: Option<CertificateBundle>,
    ) -> Result<PluginAddr> {
        let handshake = Handshake::parse(line)?;
        let config = &session.config;

        let supported = config.supported_versions();
        let version = negotiate_version(&[handshake.app_protocol], supported.iter().copied())
            .ok_or_else(|| PluginError::AppProtocolMismatch {
                plugin: handshake.app_protocol.to_string(),
                supported: supported.clone(),
            })?;
        let services = config
            .versioned_services
            .get(&version)
            .cloned()
            .ok_or(PluginError::NoServicesForVersion(version))?;

        let address = handshake.addr()?;

        if !config.allowed_protocols.contains(&handshake.rpc_protocol) {
            return Err(PluginError::UnsupportedProtocol {
                protocol: handshake.rpc_protocol,
                allowed: config.allowed_protocols.clone(),
            });
        }

        let tls = match (own_cert, handshake.server_cert) {
            (Some(own), Some(peer)) => Some(TlsSettings::mutual(&own, peer.into())?),
            (Some(_), None) => {
                return Err(PluginError::Tls(
                    "plugin did not return a certificate for automatic mTLS".into(),
                ));
            }
            (None, Some(_)) if config.tls.is_none() => {
                warn!("plugin sent a server certificate but TLS is not configured, ignoring it");
                None
            }
            (None, _) => config.tls.clone(),
        };

        session.tls = tls;
        session.protocol = handshake.rpc_protocol;
        session.negotiated = Some(Negotiated { version, services });
        session.address = Some(address.clone());
        Ok(address)
    }

    /// Start the plugin if needed and return its RPC session.
    ///
    /// The session is created once; later calls return the same one.
    pub async fn client(&self) -> Result<Arc<RpcClient>> {
        let address = self.start().await?;

        let mut session = self.session.lock().await;
        if let Some(rpc) = self.lock_rpc().clone() {
            return Ok(rpc);
        }
        if self.exited() || self.stopping.is_cancelled() {
            return Err(PluginError::PluginExited);
        }
        if session.protocol != PROTOCOL_GRPC {
            return Err(PluginError::UnsupportedProtocol {
                protocol: session.protocol.clone(),
                allowed: vec![PROTOCOL_GRPC.to_string()],
            });
        }
        let Some(negotiated) = session.negotiated.clone() else {
            return Err(PluginError::PluginExited);
        };

        let rpc = tokio::select! {
            biased;
            _ = self.stopping.cancelled() => return Err(PluginError::PluginExited),
            rpc = self.connect(&mut session, address, negotiated) => rpc?,
        };

        let mut slot = self.lock_rpc();
        if self.stopping.is_cancelled() {
            drop(slot);
            rpc.abandon();
            return Err(PluginError::PluginExited);
        }
        *slot = Some(rpc.clone());
        Ok(rpc)
    }

    /// Open the channel, the broker control stream and stdio forwarding.
    ///
    /// Everything spawned here stops again if the future is dropped before
    /// it completes.
    async fn connect(
        &self,
        session: &mut Session,
        address: PluginAddr,
        negotiated: Negotiated,
    ) -> Result<Arc<RpcClient>> {
        let closing = CancellationToken::new();
        let abandon = closing.clone().drop_guard();

        let channel = connect_channel(address, session.tls.clone()).await?;

        let stream = ControlStream::connect(channel.clone()).await?;
        let broker = Arc::new(Broker::new(
            stream,
            session.tls.clone(),
            ListenConfig::default(),
        ));
        {
            let broker = broker.clone();
            let closing = closing.clone();
            self.tasks.spawn(async move {
                tokio::select! {
                    _ = broker.run() => {}
                    _ = closing.cancelled() => {}
                }
                broker.close();
            });
        }

        let stdout = session
            .config
            .stdout
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::stdout()));
        let stderr = session
            .config
            .stderr
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::stderr()));
        match StdioClient::connect(channel.clone()).await {
            Ok(stdio) => {
                let closing = closing.clone();
                self.tasks.spawn(async move {
                    tokio::select! {
                        _ = stdio.run(stdout, stderr) => {}
                        _ = closing.cancelled() => {}
                    }
                });
            }
            Err(e) => warn!(error = %e, "stdio forwarding unavailable"),
        }

        abandon.disarm();
        Ok(Arc::new(RpcClient {
            channel,
            broker,
            negotiated,
            closing,
        }))
    }

    /// Shut the plugin down and wait for every background task to finish.
    ///
    /// Tries a graceful shutdown over RPC first, then kills the process if it
    /// has not exited within [`GRACEFUL_SHUTDOWN_TIMEOUT`]. A start or
    /// connect still in progress is abandoned. Safe to call more than once.
    pub async fn kill(&self) {
        self.stopping.cancel();
        let rpc = self.lock_rpc().take();

        let mut graceful = false;
        if let Some(rpc) = rpc {
            match rpc.close().await {
                Ok(()) => graceful = true,
                Err(e) => warn!(error = %e, "error closing plugin client"),
            }
        }

        let launched = !self.reattached && self.pid().is_some();
        if graceful && launched {
            if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, self.exited.cancelled())
                .await
                .is_err()
            {
                warn!("plugin failed to exit gracefully");
            }
        }

        self.kill.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Whether the launched process has exited
    pub fn exited(&self) -> bool {
        self.lock_process().exited
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.lock_process().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_process().pid
    }

    /// Resolves once the launched process has exited.
    pub async fn wait_exit(&self) {
        self.exited.cancelled().await;
    }

    /// The application protocol version negotiated at start
    pub async fn negotiated_version(&self) -> Option<u32> {
        self.session
            .lock()
            .await
            .negotiated
            .as_ref()
            .map(|negotiated| negotiated.version)
    }

    fn lock_process(&self) -> std::sync::MutexGuard<'_, ProcessState> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rpc(&self) -> std::sync::MutexGuard<'_, Option<Arc<RpcClient>>> {
        self.rpc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("process", &self.process)
            .field("killed", &self.kill.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Hand the first stdout line to the launcher, then keep draining so the
/// plugin never blocks on a full pipe.
async fn read_stdout(stdout: ChildStdout, line_tx: oneshot::Sender<String>, pid: Option<u32>) {
    let mut lines = BufReader::new(stdout).lines();

    match lines.next_line().await {
        Ok(Some(line)) => {
            let _ = line_tx.send(line);
        }
        Ok(None) => return,
        Err(e) => {
            warn!(pid, error = %e, "error reading plugin stdout");
            return;
        }
    }

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(pid, line = %line, "plugin stdout");
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "etxe::plugin::stderr", pid, "{line}"),
            Ok(None) => return,
            Err(e) => {
                error!(pid, error = %e, "reading plugin stderr");
                return;
            }
        }
    }
}

/// Wait for the process to exit (or kill it when asked), record how it
/// ended, and signal that it is gone.
async fn supervise(
    mut child: Child,
    stderr: Option<JoinHandle<()>>,
    path: PathBuf,
    kill: CancellationToken,
    exited: CancellationToken,
    process: Arc<Mutex<ProcessState>>,
) {
    let pid = child.id();

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            debug!(pid, "killing plugin process");
            if let Err(e) = child.start_kill() {
                debug!(pid, error = %e, "error killing plugin process");
            }
            child.wait().await
        }
    };

    // Everything the plugin wrote to stderr is logged before reporting exit
    if let Some(stderr) = stderr {
        let _ = stderr.await;
    }

    match &status {
        Ok(status) if status.success() => {
            info!(path = %path.display(), pid, "plugin process exited");
        }
        Ok(status) => {
            error!(path = %path.display(), pid, %status, "plugin process exited");
        }
        Err(e) => {
            error!(path = %path.display(), pid, error = %e, "error waiting for plugin process");
        }
    }

    {
        let mut process = process.lock().unwrap_or_else(PoisonError::into_inner);
        process.exited = true;
        process.status = status.ok();
    }
    exited.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::handshake::Network;
    use crate::plugin::listener::PluginListener;
    use crate::plugin::protocol::grpc_broker_server::GrpcBrokerServer;
    use crate::plugin::protocol::grpc_controller_server::{GrpcController, GrpcControllerServer};
    use crate::plugin::protocol::grpc_stdio_server::GrpcStdioServer;
    use crate::plugin::stdio::StdioServer;
    use tonic::transport::Server;
    use tonic::{Request, Response, Status};

    fn handshake_config() -> HandshakeConfig {
        HandshakeConfig {
            protocol_version: 1,
            magic_cookie_key: "ETXE_TEST_PLUGIN".into(),
            magic_cookie_value: "test".into(),
        }
    }

    fn reattach_config() -> ReattachConfig {
        ReattachConfig {
            protocol: PROTOCOL_GRPC.into(),
            protocol_version: 1,
            address: PluginAddr::Tcp("127.0.0.1:1".parse().unwrap()),
            pid: None,
        }
    }

    #[tokio::test]
    async fn requires_exactly_one_of_cmd_and_reattach() {
        let client = Client::new(ClientConfig::new(handshake_config()));
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, PluginError::CmdReattachConflict));

        let client = Client::new(
            ClientConfig::new(handshake_config())
                .with_cmd(Command::new("true"))
                .with_reattach(reattach_config()),
        );
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, PluginError::CmdReattachConflict));
    }

    #[tokio::test]
    async fn secure_config_cannot_reattach() {
        let mut config = ClientConfig::new(handshake_config()).with_reattach(reattach_config());
        config.secure = Some(SecureConfig { checksum: vec![] });

        let err = Client::new(config).start().await.unwrap_err();
        assert!(matches!(err, PluginError::SecureConfigAndReattach));
    }

    #[tokio::test]
    async fn auto_mtls_excludes_manual_tls() {
        let own = generate_cert().unwrap();
        let peer = generate_cert().unwrap();
        let mut config = ClientConfig::new(handshake_config()).with_reattach(reattach_config());
        config.auto_mtls = true;
        config.tls = Some(TlsSettings::mutual(&own, peer.cert_der().clone()).unwrap());

        let err = Client::new(config).start().await.unwrap_err();
        assert!(matches!(err, PluginError::AutoMtlsWithTlsConfig));
    }

    #[tokio::test]
    async fn reattach_is_idempotent() {
        let client = Client::new(ClientConfig::new(handshake_config()).with_reattach(reattach_config()));

        let first = client.start().await.unwrap();
        let second = client.start().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.network(), Network::Tcp);
        assert_eq!(client.negotiated_version().await, Some(1));
        assert!(!client.exited());
    }

    #[tokio::test]
    async fn checksum_is_verified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin");
        std::fs::write(&path, b"plugin binary").unwrap();

        let good = SecureConfig {
            checksum: Sha256::digest(b"plugin binary").to_vec(),
        };
        good.check(&path).await.unwrap();

        let bad = SecureConfig {
            checksum: Sha256::digest(b"something else").to_vec(),
        };
        assert!(matches!(
            bad.check(&path).await.unwrap_err(),
            PluginError::ChecksumMismatch
        ));

        assert!(matches!(
            good.check(&dir.path().join("missing")).await.unwrap_err(),
            PluginError::ChecksumRead(_)
        ));
    }

    fn session(config: ClientConfig) -> Session {
        Session {
            config,
            address: None,
            protocol: String::new(),
            negotiated: None,
            tls: None,
        }
    }

    #[test]
    fn handshake_negotiates_highest_common_version() {
        let client = Client::new(ClientConfig::new(handshake_config()));
        let config = ClientConfig::new(handshake_config())
            .with_services(1, ServiceSet::from(["old".to_string()]))
            .with_services(3, ServiceSet::from(["new".to_string()]));
        let mut session = session(config);

        let address = client
            .complete_handshake(&mut session, "1|3|tcp|127.0.0.1:4000|grpc", None)
            .unwrap();

        assert_eq!(address.to_string(), "127.0.0.1:4000");
        let negotiated = session.negotiated.unwrap();
        assert_eq!(negotiated.version, 3);
        assert!(negotiated.services.contains("new"));
        assert_eq!(session.protocol, "grpc");
    }

    #[test]
    fn handshake_rejects_unknown_app_version() {
        let client = Client::new(ClientConfig::new(handshake_config()));
        let mut session = session(
            ClientConfig::new(handshake_config()).with_services(1, ServiceSet::new()),
        );

        let err = client
            .complete_handshake(&mut session, "1|7|tcp|127.0.0.1:4000|grpc", None)
            .unwrap_err();
        assert!(matches!(err, PluginError::AppProtocolMismatch { .. }));
        assert!(session.address.is_none());
    }

    #[test]
    fn handshake_without_protocol_is_not_allowed_by_default() {
        let client = Client::new(ClientConfig::new(handshake_config()));
        let mut session = session(
            ClientConfig::new(handshake_config()).with_services(1, ServiceSet::new()),
        );

        let err = client
            .complete_handshake(&mut session, "1|1|tcp|127.0.0.1:4000", None)
            .unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedProtocol { ref protocol, .. } if protocol == "netrpc"));
    }

    #[test]
    fn auto_mtls_requires_server_certificate() {
        let client = Client::new(ClientConfig::new(handshake_config()));
        let mut session = session(
            ClientConfig::new(handshake_config()).with_services(1, ServiceSet::new()),
        );

        let err = client
            .complete_handshake(
                &mut session,
                "1|1|tcp|127.0.0.1:4000|grpc",
                Some(generate_cert().unwrap()),
            )
            .unwrap_err();
        assert!(matches!(err, PluginError::Tls(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exiting_before_handshake_fails_start() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo oops >&2; exit 3"]);
        let client = Client::new(ClientConfig::new(handshake_config()).with_cmd(cmd));

        let err = client.start().await.unwrap_err();
        assert!(matches!(err, PluginError::ExitedBeforeHandshake));

        client.kill().await;
        assert!(client.exited());
        assert_eq!(client.exit_status().and_then(|status| status.code()), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_plugin_times_out_and_is_killed() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 30"]);
        let mut config = ClientConfig::new(handshake_config()).with_cmd(cmd);
        config.start_timeout = Duration::from_millis(200);
        let client = Client::new(config);

        let err = client.start().await.unwrap_err();
        assert!(matches!(err, PluginError::StartTimeout));
        assert!(client.exited());

        let retry = client.start().await.unwrap_err();
        assert!(matches!(retry, PluginError::PluginExited));

        client.kill().await;
        assert!(client.exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_interrupts_a_start_in_progress() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 60"]);
        let mut config = ClientConfig::new(handshake_config()).with_cmd(cmd);
        config.start_timeout = Duration::from_secs(20);
        let client = Arc::new(Client::new(config));

        let starting = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(5), client.kill())
            .await
            .unwrap();
        let started = tokio::time::timeout(Duration::from_secs(5), starting)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(started, Err(PluginError::PluginExited)));
        assert!(client.exited());
    }

    /// Never answers `Shutdown`
    struct UnresponsiveController;

    #[tonic::async_trait]
    impl GrpcController for UnresponsiveController {
        async fn shutdown(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn kill_finishes_when_shutdown_is_never_acknowledged() {
        let listener = PluginListener::bind(&ListenConfig::tcp(0, 0)).await.unwrap();
        let address = listener.addr().clone();
        let stop = CancellationToken::new();

        let (_stream, broker_service) = ControlStream::server();
        let stdio = StdioServer::new(
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::empty()),
            stop.clone(),
        );
        let serving = tokio::spawn(
            Server::builder()
                .add_service(GrpcBrokerServer::new(broker_service))
                .add_service(GrpcStdioServer::new(stdio))
                .add_service(GrpcControllerServer::new(UnresponsiveController))
                .serve_with_incoming_shutdown(listener.into_incoming(None), stop.clone().cancelled_owned()),
        );

        let reattach = ReattachConfig {
            address,
            ..reattach_config()
        };
        let mut config = ClientConfig::new(handshake_config()).with_reattach(reattach);
        config.stdout = Some(Box::new(tokio::io::sink()));
        config.stderr = Some(Box::new(tokio::io::sink()));
        let client = Client::new(config);
        let rpc = client.client().await.unwrap();

        tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT + Duration::from_secs(3), client.kill())
            .await
            .unwrap();
        assert!(rpc.broker().is_closed());
        assert!(matches!(
            client.client().await.unwrap_err(),
            PluginError::PluginExited
        ));

        stop.cancel();
        serving.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_exports_negotiation_environment() {
        let mut cmd = Command::new("sh");
        cmd.args([
            "-c",
            "echo \"1|$PLUGIN_PROTOCOL_VERSIONS|tcp|127.0.0.1:$PLUGIN_MIN_PORT|$ETXE_TEST_PLUGIN\"; exec sleep 30",
        ]);
        let mut config = ClientConfig::new(handshake_config())
            .with_cmd(cmd)
            .with_services(2, ServiceSet::new());
        config.min_port = 12345;
        config.max_port = 12345;
        config.allowed_protocols = vec!["test".into()];
        let client = Client::new(config);

        let address = client.start().await.unwrap();

        assert_eq!(address.to_string(), "127.0.0.1:12345");
        assert_eq!(client.negotiated_version().await, Some(2));
        assert!(client.pid().is_some());

        client.kill().await;
        assert!(client.exited());
    }
}
