//! Plugin side of a session: validate the launch environment, open the
//! listener, print the handshake line and serve until the host says stop.
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::transport::server::Router;
use tracing::{debug, info};

use super::broker::{Broker, ControlStream};
use super::certs::{TlsSettings, generate_cert, parse_pem_certificate};
use super::config::{
    ENV_CLIENT_CERT, ENV_MAX_PORT, ENV_MIN_PORT, ENV_PROTOCOL_VERSIONS, HandshakeConfig,
};
use super::controller::ControllerService;
use super::error::{PluginError, Result};
use super::handshake::{Handshake, Network, PROTOCOL_GRPC, negotiate_version, parse_version_list};
use super::listener::{ListenConfig, PluginListener};
use super::protocol::grpc_broker_server::GrpcBrokerServer;
use super::protocol::grpc_controller_server::GrpcControllerServer;
use super::protocol::grpc_stdio_server::GrpcStdioServer;
use super::stdio::StdioServer;

/// Adds a plugin's own services to the router. Receives the plugin-side
/// broker so services can open more connections to the host.
pub type ServiceRegistrar = Box<dyn FnOnce(Router, &Arc<Broker>) -> Router + Send>;

type StdioSource = Box<dyn AsyncRead + Send + Unpin>;

/// What a plugin serves and how
pub struct ServeConfig {
    pub handshake: HandshakeConfig,

    /// Services by application protocol version. The highest version the
    /// host also supports is served.
    pub versioned_services: BTreeMap<u32, ServiceRegistrar>,

    /// Manually provisioned TLS. Takes precedence over automatic mTLS.
    pub tls: Option<TlsSettings>,

    /// Output forwarded to the host over the stdio stream
    pub stdout: Option<StdioSource>,
    pub stderr: Option<StdioSource>,

    /// Overrides the default listener (Unix socket where available)
    pub listen: Option<ListenConfig>,
}

impl ServeConfig {
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            versioned_services: BTreeMap::new(),
            tls: None,
            stdout: None,
            stderr: None,
            listen: None,
        }
    }

    pub fn with_services<F>(mut self, version: u32, register: F) -> Self
    where
        F: FnOnce(Router, &Arc<Broker>) -> Router + Send + 'static,
    {
        self.versioned_services.insert(version, Box::new(register));
        self
    }
}

impl fmt::Debug for ServeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeConfig")
            .field("handshake", &self.handshake)
            .field(
                "versions",
                &self.versioned_services.keys().collect::<Vec<_>>(),
            )
            .field("tls", &self.tls)
            .field("listen", &self.listen)
            .finish_non_exhaustive()
    }
}

/// The launch environment a host hands to a plugin, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginEnv {
    pub magic_cookie: Option<String>,
    pub min_port: Option<String>,
    pub max_port: Option<String>,
    pub protocol_versions: Option<String>,
    pub client_cert: Option<String>,
}

impl PluginEnv {
    /// Read the variables a host sets, using the cookie name from `handshake`.
    pub fn from_env(handshake: &HandshakeConfig) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            magic_cookie: var(&handshake.magic_cookie_key),
            min_port: var(ENV_MIN_PORT),
            max_port: var(ENV_MAX_PORT),
            protocol_versions: var(ENV_PROTOCOL_VERSIONS),
            client_cert: var(ENV_CLIENT_CERT),
        }
    }

    fn port(value: Option<&str>, var: &'static str) -> Result<u16> {
        match value {
            None => Ok(0),
            Some(value) => value.trim().parse().map_err(|_| PluginError::InvalidEnvValue {
                var,
                value: value.to_string(),
            }),
        }
    }
}

/// A plugin that has done everything but serve: its listener is bound and
/// its handshake line is known.
pub struct PluginServer {
    handshake: Handshake,
    listener: PluginListener,
    listen: ListenConfig,
    tls: Option<TlsSettings>,
    services: Option<ServiceRegistrar>,
    stdout: Option<StdioSource>,
    stderr: Option<StdioSource>,
    shutdown: CancellationToken,
}

impl PluginServer {
    /// Validate `env`, negotiate the protocol version, bind the listener and
    /// set up TLS.
    pub async fn bind(mut config: ServeConfig, env: PluginEnv) -> Result<Self> {
        if !config.handshake.cookie_matches(env.magic_cookie.as_deref()) {
            return Err(PluginError::MagicCookieMismatch);
        }

        let version = negotiate_protocol(&config, &env)?;
        let services = config.versioned_services.remove(&version);
        if services.is_none() && !config.versioned_services.is_empty() {
            return Err(PluginError::NoServicesForVersion(version));
        }

        let mut listen = config.listen.take().unwrap_or_default();
        if listen.network == Network::Tcp && (env.min_port.is_some() || env.max_port.is_some()) {
            listen.min_port = PluginEnv::port(env.min_port.as_deref(), ENV_MIN_PORT)?;
            listen.max_port = PluginEnv::port(env.max_port.as_deref(), ENV_MAX_PORT)?;
        }
        let listener = PluginListener::bind(&listen).await?;

        let mut handshake = Handshake::new(version, listener.addr(), PROTOCOL_GRPC);
        let tls = match (config.tls.take(), env.client_cert.as_deref()) {
            (Some(tls), _) => Some(tls),
            (None, Some(client_cert)) => {
                debug!("configuring server automatic mTLS");
                let peer = parse_pem_certificate(client_cert)?;
                let own = generate_cert()?;
                handshake = handshake.with_server_cert(own.cert_der().to_vec());
                Some(TlsSettings::mutual(&own, peer)?)
            }
            (None, None) => None,
        };

        debug!(address = %listener.addr(), version, tls = tls.is_some(), "plugin listener bound");

        Ok(Self {
            handshake,
            listener,
            listen,
            tls,
            services,
            stdout: config.stdout,
            stderr: config.stderr,
            shutdown: CancellationToken::new(),
        })
    }

    /// The line to print for the host
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Cancel to stop serving. The host's `Shutdown` call cancels it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until shut down, then close the broker.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.shutdown;

        let (stream, broker_service) = ControlStream::server();
        let broker = Arc::new(Broker::new(stream, self.tls.clone(), self.listen));

        let stdio = StdioServer::new(
            self.stdout.unwrap_or_else(|| Box::new(tokio::io::empty())),
            self.stderr.unwrap_or_else(|| Box::new(tokio::io::empty())),
            shutdown.clone(),
        );
        let stdio_producers = stdio.producers();

        let mut router = Server::builder()
            .add_service(GrpcBrokerServer::new(broker_service))
            .add_service(GrpcStdioServer::new(stdio))
            .add_service(GrpcControllerServer::new(ControllerService::new(
                shutdown.clone(),
            )));
        if let Some(register) = self.services {
            router = register(router, &broker);
        }

        let broker_loop = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.run().await })
        };
        // Long-lived broker streams would otherwise hold up graceful shutdown
        let close_broker = {
            let broker = broker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                broker.close();
            })
        };

        info!(address = %self.listener.addr(), "plugin server listening");
        let incoming = self
            .listener
            .into_incoming(self.tls.as_ref().map(TlsSettings::acceptor));
        let served = router
            .serve_with_incoming_shutdown(incoming, shutdown.clone().cancelled_owned())
            .await;

        shutdown.cancel();
        broker.close();
        let _ = close_broker.await;
        let _ = broker_loop.await;
        stdio_producers.wait().await;

        info!("plugin server stopped");
        served.map_err(PluginError::from)
    }
}

impl fmt::Debug for PluginServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginServer")
            .field("handshake", &self.handshake)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

/// Pick the highest version both sides support, falling back to the
/// configured default when the host did not say or nothing overlaps.
fn negotiate_protocol(config: &ServeConfig, env: &PluginEnv) -> Result<u32> {
    let default = config.handshake.protocol_version;
    let Some(list) = env.protocol_versions.as_deref() else {
        return Ok(default);
    };

    let host_versions = parse_version_list(list).map_err(|_| PluginError::InvalidEnvValue {
        var: ENV_PROTOCOL_VERSIONS,
        value: list.to_string(),
    })?;

    let ours = config.versioned_services.keys().copied();
    Ok(negotiate_version(&host_versions, ours).unwrap_or(default))
}

/// Run a plugin from `main`: read the environment, print the handshake line
/// on stdout and serve until the host shuts the plugin down.
pub async fn serve(config: ServeConfig) -> Result<()> {
    let env = PluginEnv::from_env(&config.handshake);

    let server = match PluginServer::bind(config, env).await {
        Ok(server) => server,
        Err(e @ PluginError::MagicCookieMismatch) => {
            eprintln!("{e}");
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", server.handshake().to_line())?;
        stdout.flush()?;
    }

    server.run().await
}
