//! Loopback listeners for the plugin's RPC server and broker connections
//!
//! Unix domain sockets are used by default. On platforms without them, or
//! when asked explicitly, a TCP port is picked by scanning a port range low
//! to high and taking the first free one.
use futures::stream::{self, BoxStream, StreamExt};
use std::io;
#[cfg(unix)]
use tempfile::TempDir;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tracing::{debug, warn};

use super::error::{PluginError, Result};
use super::handshake::Network;
use super::transport::{PluginAddr, PluginStream};

const SOCKET_DIR_PREFIX: &str = "plugin";
const SOCKET_FILE_NAME: &str = "plugin.sock";

/// Where and how a plugin listener is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    pub network: Network,
    pub min_port: u16,
    pub max_port: u16,
}

impl ListenConfig {
    pub fn tcp(min_port: u16, max_port: u16) -> Self {
        Self {
            network: Network::Tcp,
            min_port,
            max_port,
        }
    }

    pub fn unix() -> Self {
        Self {
            network: Network::Unix,
            min_port: 0,
            max_port: 0,
        }
    }
}

impl Default for ListenConfig {
    /// Unix sockets where available; otherwise any free loopback TCP port.
    fn default() -> Self {
        if cfg!(unix) { Self::unix() } else { Self::tcp(0, 0) }
    }
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        // Removing the directory removes the socket file with it.
        _dir: TempDir,
    },
}

/// A bound plugin listener. Unix socket listeners delete their socket file
/// when dropped.
pub struct PluginListener {
    inner: Inner,
    addr: PluginAddr,
}

impl std::fmt::Debug for PluginListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginListener").field("addr", &self.addr).finish()
    }
}

impl PluginListener {
    pub async fn bind(config: &ListenConfig) -> Result<Self> {
        match config.network {
            Network::Tcp => Self::bind_tcp(config.min_port, config.max_port).await,
            Network::Unix => Self::bind_unix(),
        }
    }

    /// Bind the first free port in `[min_port, max_port]` on 127.0.0.1.
    ///
    /// `0..=0` asks the OS for any free port.
    pub async fn bind_tcp(min_port: u16, max_port: u16) -> Result<Self> {
        if min_port > max_port {
            return Err(PluginError::MinPortGreaterThanMaxPort);
        }

        for port in min_port..=max_port {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    let addr = PluginAddr::Tcp(listener.local_addr()?);
                    debug!(address = %addr, "bound plugin TCP listener");
                    return Ok(Self {
                        inner: Inner::Tcp(listener),
                        addr,
                    });
                }
                Err(e) => debug!(port, error = %e, "port unavailable"),
            }
        }

        Err(PluginError::TcpListenerBindFailed)
    }

    #[cfg(unix)]
    pub fn bind_unix() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SOCKET_DIR_PREFIX)
            .tempdir()?;
        let path = dir.path().join(SOCKET_FILE_NAME);
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "bound plugin unix listener");

        Ok(Self {
            inner: Inner::Unix {
                listener,
                _dir: dir,
            },
            addr: PluginAddr::Unix(path),
        })
    }

    #[cfg(not(unix))]
    pub fn bind_unix() -> Result<Self> {
        Err(PluginError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )))
    }

    pub fn addr(&self) -> &PluginAddr {
        &self.addr
    }

    pub fn network(&self) -> Network {
        self.addr.network()
    }

    /// Accept one plain connection.
    pub async fn accept(&self) -> io::Result<PluginStream> {
        match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(PluginStream::Tcp(stream))
            }
            #[cfg(unix)]
            Inner::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(PluginStream::Unix(stream))
            }
        }
    }

    /// Turn the listener into a stream of accepted connections for tonic,
    /// terminating TLS on each one when `tls` is set.
    ///
    /// A connection whose TLS handshake fails is logged and skipped; it does
    /// not end the stream. The listener lives as long as the stream.
    pub fn into_incoming(
        self,
        tls: Option<TlsAcceptor>,
    ) -> BoxStream<'static, io::Result<PluginStream>> {
        stream::unfold((self, tls), |(listener, tls)| async move {
            loop {
                let conn = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => return Some((Err(e), (listener, tls))),
                };

                let Some(acceptor) = &tls else {
                    return Some((Ok(conn), (listener, tls)));
                };

                match acceptor.accept(conn).await {
                    Ok(stream) => {
                        let stream = PluginStream::Tls(Box::new(TlsStream::Server(stream)));
                        return Some((Ok(stream), (listener, tls)));
                    }
                    Err(e) => warn!(error = %e, "TLS handshake with plugin peer failed"),
                }
            }
        })
        .boxed()
    }
}
