/// Connection transport for gRPC communication with plugins
///
/// This module implements the connection type tonic runs over: a loopback
/// TCP or Unix domain socket stream, optionally wrapped in TLS. Both the
/// plugin's main listener and every broker connection use it.
use hyper_util::rt::TokioIo;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::TlsStream;
use tonic::transport::server::Connected;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use super::certs::TlsSettings;
use super::error::{PluginError, Result};
use super::handshake::Network;

/// Placeholder authority for tonic; the connector ignores it and dials the
/// resolved plugin address instead.
const UNUSED_ENDPOINT: &str = "http://[::]:50051";

/// A resolved dial target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl PluginAddr {
    /// Resolve a `network`/`address` pair as found in a handshake line or a
    /// broker connection descriptor.
    pub fn resolve(network: &str, address: &str) -> Result<Self> {
        match Network::parse(network) {
            Some(Network::Tcp) => {
                let addr = match address.parse::<SocketAddr>() {
                    Ok(addr) => addr,
                    Err(_) => address
                        .to_socket_addrs()
                        .map_err(|e| PluginError::InvalidAddress {
                            address: address.to_string(),
                            reason: e.to_string(),
                        })?
                        .next()
                        .ok_or_else(|| PluginError::InvalidAddress {
                            address: address.to_string(),
                            reason: "no addresses resolved".to_string(),
                        })?,
                };
                Ok(Self::Tcp(addr))
            }
            Some(Network::Unix) => Ok(Self::Unix(PathBuf::from(address))),
            None => Err(PluginError::UnknownAddressType {
                network: network.to_string(),
                address: address.to_string(),
            }),
        }
    }

    pub fn network(&self) -> Network {
        match self {
            Self::Tcp(_) => Network::Tcp,
            Self::Unix(_) => Network::Unix,
        }
    }
}

impl fmt::Display for PluginAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A bidirectional plugin connection
///
/// Presents a unified AsyncRead + AsyncWrite interface over TCP, Unix
/// domain sockets and TLS so tonic can serve and dial all of them.
pub enum PluginStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(Box<TlsStream<PluginStream>>),
}

impl PluginStream {
    /// Dial `addr`, performing the TLS handshake when `tls` is set.
    pub async fn connect(addr: &PluginAddr, tls: Option<&TlsSettings>) -> Result<Self> {
        let stream = match addr {
            PluginAddr::Tcp(socket) => {
                let stream = TcpStream::connect(socket).await?;
                stream.set_nodelay(true)?;
                Self::Tcp(stream)
            }
            #[cfg(unix)]
            PluginAddr::Unix(path) => Self::Unix(UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            PluginAddr::Unix(path) => {
                return Err(PluginError::InvalidAddress {
                    address: path.display().to_string(),
                    reason: "unix sockets are not supported on this platform".to_string(),
                });
            }
        };

        match tls {
            Some(tls) => {
                let stream = tls
                    .connector()
                    .connect(TlsSettings::server_name()?, stream)
                    .await?;
                Ok(Self::Tls(Box::new(TlsStream::Client(stream))))
            }
            None => Ok(stream),
        }
    }
}

impl fmt::Debug for PluginStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Tcp(_) => "tcp",
            #[cfg(unix)]
            Self::Unix(_) => "unix",
            Self::Tls(_) => "tls",
        };
        f.debug_tuple("PluginStream").field(&kind).finish()
    }
}

impl AsyncRead for PluginStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PluginStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connected for PluginStream {
    type ConnectInfo = Network;

    fn connect_info(&self) -> Self::ConnectInfo {
        match self {
            Self::Tcp(_) => Network::Tcp,
            #[cfg(unix)]
            Self::Unix(_) => Network::Unix,
            Self::Tls(s) => s.get_ref().0.connect_info(),
        }
    }
}

/// Open a gRPC channel to a plugin address.
///
/// The connection is established eagerly so dial failures surface here
/// rather than on the first RPC.
pub async fn connect_channel(addr: PluginAddr, tls: Option<TlsSettings>) -> Result<Channel> {
    debug!(network = %addr.network(), address = %addr, tls = tls.is_some(), "dialing plugin");

    let channel = Endpoint::from_static(UNUSED_ENDPOINT)
        .connect_with_connector(service_fn(move |_: Uri| {
            let addr = addr.clone();
            let tls = tls.clone();
            async move {
                let stream = PluginStream::connect(&addr, tls.as_ref())
                    .await
                    .map_err(|e| io::Error::other(format!("failed to dial ({}, {addr}): {e}", addr.network())))?;
                Ok::<_, io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;

    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn resolves_tcp_and_unix_addresses() {
        let tcp = PluginAddr::resolve("tcp", "127.0.0.1:5000").unwrap();
        assert_eq!(tcp, PluginAddr::Tcp("127.0.0.1:5000".parse().unwrap()));
        assert_eq!(tcp.to_string(), "127.0.0.1:5000");

        let unix = PluginAddr::resolve("unix", "/tmp/plugin/plugin.sock").unwrap();
        assert_eq!(unix.network(), Network::Unix);
        assert_eq!(unix.to_string(), "/tmp/plugin/plugin.sock");
    }

    #[test]
    fn rejects_unknown_network() {
        let err = PluginAddr::resolve("udp", "127.0.0.1:5000").unwrap_err();
        assert!(matches!(err, PluginError::UnknownAddressType { .. }));
    }

    #[test]
    fn rejects_unresolvable_tcp_address() {
        let err = PluginAddr::resolve("tcp", "not an address").unwrap_err();
        assert!(matches!(err, PluginError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn plain_tcp_stream_carries_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PluginAddr::Tcp(listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = PluginStream::connect(&addr, None).await.unwrap();
        assert_eq!(stream.connect_info(), Network::Tcp);
        stream.write_all(b"hello").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
    }
}
