//! Stdout/stderr forwarding from a plugin to its host over gRPC
//!
//! This is an advisory side channel. A plugin that does not serve it, or a
//! stream that breaks, never affects the main RPC connection.
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, error, warn};

use super::error::Result;
use super::protocol::grpc_stdio_client::GrpcStdioClient;
use super::protocol::grpc_stdio_server::GrpcStdio;
use super::protocol::stdio_data::Channel as StdioChannel;
use super::protocol::{Empty, StdioData};

/// Size of the chunks read from the plugin's stdio sources.
pub const STDIO_CHUNK_SIZE: usize = 1024;

/// Copy `src` into `dst` in chunks of at most [`STDIO_CHUNK_SIZE`] bytes.
///
/// Each chunk waits until the receiver takes it, so a stalled host
/// eventually blocks the plugin's writes. Returns at end of stream, on a
/// read error, or when the receiver goes away.
pub async fn copy_chan<R>(dst: mpsc::Sender<Vec<u8>>, src: R)
where
    R: AsyncRead + Unpin,
{
    let mut src = src;
    loop {
        let mut data = vec![0u8; STDIO_CHUNK_SIZE];
        match src.read(&mut data).await {
            Ok(0) => {
                debug!("stdio EOF, exiting copy loop");
                return;
            }
            Ok(n) => {
                data.truncate(n);
                if dst.send(data).await.is_err() {
                    debug!("stdio receiver dropped, exiting copy loop");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "error copying stdio data, stopping copy");
                return;
            }
        }
    }
}

type StdioSource = Box<dyn AsyncRead + Send + Unpin>;

/// Serves `GRPCStdio.StreamStdio`, forwarding whatever the stdout and
/// stderr producers read.
pub struct StdioServer {
    stdout: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    stderr: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    shutdown: CancellationToken,
    producers: TaskTracker,
}

impl StdioServer {
    /// Start copying `stdout` and `stderr`. Call once per pair of sources.
    ///
    /// Cancelling `shutdown` stops both producers and ends open streams.
    pub fn new(stdout: StdioSource, stderr: StdioSource, shutdown: CancellationToken) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::channel(1);
        let (stderr_tx, stderr_rx) = mpsc::channel(1);

        let producers = TaskTracker::new();
        for (tx, src) in [(stdout_tx, stdout), (stderr_tx, stderr)] {
            let shutdown = shutdown.clone();
            producers.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => debug!("stdio producer stopped"),
                    _ = copy_chan(tx, src) => {}
                }
            });
        }
        producers.close();

        Self {
            stdout: Arc::new(Mutex::new(stdout_rx)),
            stderr: Arc::new(Mutex::new(stderr_rx)),
            shutdown,
            producers,
        }
    }

    /// Tracks the producer tasks. Wait on it to see them finish.
    pub fn producers(&self) -> TaskTracker {
        self.producers.clone()
    }
}

struct Forward {
    stdout: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    stderr: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    shutdown: CancellationToken,
    stdout_open: bool,
    stderr_open: bool,
}

impl Forward {
    /// Next non-empty chunk from whichever producer fires first, or `None`
    /// once both have finished or the server is shutting down.
    async fn next(&mut self) -> Option<StdioData> {
        let mut stdout = self.stdout.lock().await;
        let mut stderr = self.stderr.lock().await;

        while self.stdout_open || self.stderr_open {
            let (channel, data) = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                data = stdout.recv(), if self.stdout_open => match data {
                    Some(data) => (StdioChannel::Stdout, data),
                    None => {
                        self.stdout_open = false;
                        continue;
                    }
                },
                data = stderr.recv(), if self.stderr_open => match data {
                    Some(data) => (StdioChannel::Stderr, data),
                    None => {
                        self.stderr_open = false;
                        continue;
                    }
                },
            };

            if data.is_empty() {
                continue;
            }
            return Some(StdioData {
                channel: channel as i32,
                data,
            });
        }

        None
    }
}

#[tonic::async_trait]
impl GrpcStdio for StdioServer {
    type StreamStdioStream = BoxStream<'static, Result<StdioData, Status>>;

    async fn stream_stdio(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::StreamStdioStream>, Status> {
        let forward = Forward {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            shutdown: self.shutdown.clone(),
            stdout_open: true,
            stderr_open: true,
        };

        // Dropping the stream when the caller goes away ends the forwarding.
        let stream = stream::unfold(forward, |mut forward| async move {
            let data = forward.next().await?;
            Some((Ok(data), forward))
        })
        .boxed();

        Ok(Response::new(stream))
    }
}

/// Copies a plugin's forwarded stdio into local writers.
pub struct StdioClient {
    stream: Option<Streaming<StdioData>>,
}

impl StdioClient {
    /// Open the stdio stream. A plugin that does not serve it yields a
    /// client whose [`run`](Self::run) does nothing.
    pub async fn connect(channel: Channel) -> Result<Self> {
        let mut client = GrpcStdioClient::new(channel);

        match client.stream_stdio(Empty {}).await {
            Ok(response) => Ok(Self {
                stream: Some(response.into_inner()),
            }),
            Err(status) if matches!(status.code(), Code::Unavailable | Code::Unimplemented) => {
                warn!("stdio service not available, stdout/stderr syncing unavailable");
                Ok(Self { stream: None })
            }
            Err(status) => Err(status.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.stream.is_some()
    }

    /// Receive stdio data and write it to `stdout`/`stderr` until the stream
    /// ends. Errors are logged, never returned.
    pub async fn run<O, E>(self, mut stdout: O, mut stderr: E)
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let Some(mut stream) = self.stream else {
            return;
        };

        loop {
            let data = match stream.message().await {
                Ok(Some(data)) => data,
                Ok(None) => return,
                Err(status)
                    if matches!(
                        status.code(),
                        Code::Unavailable | Code::Cancelled | Code::Unimplemented
                    ) =>
                {
                    return;
                }
                Err(status) => {
                    error!(error = %status, "error receiving data");
                    return;
                }
            };

            let written = match StdioChannel::try_from(data.channel) {
                Ok(StdioChannel::Stdout) => write_chunk(&mut stdout, &data.data).await,
                Ok(StdioChannel::Stderr) => write_chunk(&mut stderr, &data.data).await,
                _ => {
                    warn!(channel = data.channel, "unknown channel, dropping");
                    continue;
                }
            };
            if let Err(e) = written {
                error!(error = %e, "failed to copy all bytes");
            }
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
