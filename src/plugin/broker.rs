//! Connection broker multiplexed over a single control stream
//!
//! Either side of a plugin session can ask for a new logical connection by a
//! numeric service ID. The side that calls [`Broker::accept`] opens a fresh
//! listener and sends its address down the control stream; the side that
//! calls [`Broker::dial`] waits for that address to arrive and connects to
//! it. Only the connection descriptors travel over the control stream, the
//! connections themselves are independent sockets.
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::server::Router;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use super::certs::TlsSettings;
use super::error::{PluginError, Result};
use super::listener::{ListenConfig, PluginListener};
use super::protocol::ConnInfo;
use super::protocol::grpc_broker_client::GrpcBrokerClient;
use super::protocol::grpc_broker_server::GrpcBroker;
use super::transport::{PluginAddr, connect_channel};

/// How long a descriptor waits for a dialer, and a dialer for a descriptor.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(5);

/// The wire-facing halves of a [`ControlStream`]
struct StreamEnds {
    outgoing: mpsc::Receiver<ConnInfo>,
    incoming: mpsc::Sender<ConnInfo>,
}

/// Sends and receives connection descriptors over the broker stream.
pub struct ControlStream {
    outgoing: mpsc::Sender<ConnInfo>,
    incoming: AsyncMutex<mpsc::Receiver<ConnInfo>>,
    quit: CancellationToken,
    tasks: TaskTracker,
}

impl ControlStream {
    fn new() -> (Arc<Self>, StreamEnds) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(1);
        let (incoming_tx, incoming_rx) = mpsc::channel(1);

        let stream = Arc::new(Self {
            outgoing: outgoing_tx,
            incoming: AsyncMutex::new(incoming_rx),
            quit: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        let ends = StreamEnds {
            outgoing: outgoing_rx,
            incoming: incoming_tx,
        };
        (stream, ends)
    }

    /// Plugin side: the stream plus the gRPC service the host connects to.
    pub fn server() -> (Arc<Self>, BrokerService) {
        let (stream, ends) = Self::new();
        let service = BrokerService {
            ends: Mutex::new(Some(ends)),
            quit: stream.quit.clone(),
            tasks: stream.tasks.clone(),
        };
        (stream, service)
    }

    /// Host side: open the broker stream on an established channel.
    pub async fn connect(channel: Channel) -> Result<Arc<Self>> {
        let (stream, ends) = Self::new();
        let mut client = GrpcBrokerClient::new(channel);

        let inbound = client
            .start_stream(outgoing_stream(ends.outgoing, stream.quit.clone()))
            .await?
            .into_inner();
        stream
            .tasks
            .spawn(pump_incoming(inbound, ends.incoming, stream.quit.clone()));

        Ok(stream)
    }

    /// Two streams wired to each other in memory.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a, a_ends) = Self::new();
        let (b, b_ends) = Self::new();

        let b_to_a = outgoing_stream(b_ends.outgoing, b.quit.clone()).map(Ok);
        let a_to_b = outgoing_stream(a_ends.outgoing, a.quit.clone()).map(Ok);
        a.tasks
            .spawn(pump_incoming(b_to_a, a_ends.incoming, a.quit.clone()));
        b.tasks
            .spawn(pump_incoming(a_to_b, b_ends.incoming, b.quit.clone()));

        (a, b)
    }

    pub async fn send(&self, info: ConnInfo) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => Err(PluginError::BrokerClosed),
            sent = self.outgoing.send(info) => sent.map_err(|_| PluginError::BrokerClosed),
        }
    }

    pub async fn receive(&self) -> Result<ConnInfo> {
        let mut incoming = tokio::select! {
            biased;
            _ = self.quit.cancelled() => return Err(PluginError::BrokerClosed),
            guard = self.incoming.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.quit.cancelled() => Err(PluginError::BrokerClosed),
            info = incoming.recv() => info.ok_or(PluginError::BrokerClosed),
        }
    }

    /// Shut the stream down. Safe to call more than once.
    pub fn close(&self) {
        self.quit.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Wait until the stream is closed and its pump tasks have exited.
    pub async fn closed(&self) {
        self.quit.cancelled().await;
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Stream of queued outgoing descriptors that ends when the stream quits.
fn outgoing_stream(
    outgoing: mpsc::Receiver<ConnInfo>,
    quit: CancellationToken,
) -> BoxStream<'static, ConnInfo> {
    stream::unfold((outgoing, quit), |(mut outgoing, quit)| async move {
        tokio::select! {
            _ = quit.cancelled() => None,
            info = outgoing.recv() => info.map(|info| (info, (outgoing, quit))),
        }
    })
    .boxed()
}

/// Forward descriptors arriving from the peer until either side goes away.
async fn pump_incoming<S>(inbound: S, incoming: mpsc::Sender<ConnInfo>, quit: CancellationToken)
where
    S: Stream<Item = Result<ConnInfo, Status>> + Send + 'static,
{
    let mut inbound = std::pin::pin!(inbound);
    loop {
        let info = tokio::select! {
            _ = quit.cancelled() => break,
            next = inbound.next() => match next {
                Some(Ok(info)) => info,
                Some(Err(status)) => {
                    debug!(code = ?status.code(), message = status.message(), "broker stream ended with error");
                    break;
                }
                None => break,
            },
        };

        tokio::select! {
            _ = quit.cancelled() => break,
            sent = incoming.send(info) => if sent.is_err() { break },
        }
    }

    quit.cancel();
}

/// gRPC side of the plugin's control stream.
pub struct BrokerService {
    ends: Mutex<Option<StreamEnds>>,
    quit: CancellationToken,
    tasks: TaskTracker,
}

#[tonic::async_trait]
impl GrpcBroker for BrokerService {
    type StartStreamStream = BoxStream<'static, Result<ConnInfo, Status>>;

    async fn start_stream(
        &self,
        request: Request<Streaming<ConnInfo>>,
    ) -> Result<Response<Self::StartStreamStream>, Status> {
        let ends = self
            .ends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Status::failed_precondition(PluginError::StreamAlreadyStarted.to_string()))?;

        self.tasks.spawn(pump_incoming(
            request.into_inner(),
            ends.incoming,
            self.quit.clone(),
        ));

        let outgoing = outgoing_stream(ends.outgoing, self.quit.clone()).map(Ok).boxed();
        Ok(Response::new(outgoing))
    }
}

/// A rendezvous slot for one service ID
struct PendingStream {
    tx: mpsc::Sender<ConnInfo>,
    rx: AsyncMutex<mpsc::Receiver<ConnInfo>>,
    done: CancellationToken,
}

impl PendingStream {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            done: CancellationToken::new(),
        }
    }

    async fn recv(&self) -> Option<ConnInfo> {
        self.rx.lock().await.recv().await
    }
}

#[derive(Clone, Default)]
struct PendingStreams {
    inner: Arc<Mutex<HashMap<u32, Arc<PendingStream>>>>,
}

impl PendingStreams {
    fn get_or_insert(&self, id: u32) -> Arc<PendingStream> {
        let mut streams = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        streams
            .entry(id)
            .or_insert_with(|| Arc::new(PendingStream::new()))
            .clone()
    }

    /// Remove `pending` if it is still the entry registered for `id`.
    fn retire(&self, id: u32, pending: &Arc<PendingStream>) {
        let mut streams = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if streams
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, pending))
        {
            streams.remove(&id);
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Keep an entry around until it is claimed, the broker closes, or the
    /// rendezvous window passes, then forget it.
    async fn expire(self, id: u32, pending: Arc<PendingStream>, closed: CancellationToken) {
        tokio::select! {
            _ = pending.done.cancelled() => {}
            _ = closed.cancelled() => {}
            _ = tokio::time::sleep(RENDEZVOUS_TIMEOUT) => {
                debug!(service_id = id, "connection info was never claimed");
            }
        }
        self.retire(id, &pending);
    }
}

/// Brokers connections by service ID between the host and a plugin.
///
/// Both sides get one. `Accept`/`Dial` may block for up to
/// [`RENDEZVOUS_TIMEOUT`]; keep them off latency-sensitive paths.
pub struct Broker {
    next_id: AtomicU32,
    stream: Arc<ControlStream>,
    pending: PendingStreams,
    tls: Option<TlsSettings>,
    listen: ListenConfig,
    done: CancellationToken,
    tasks: TaskTracker,
}

impl Broker {
    pub fn new(stream: Arc<ControlStream>, tls: Option<TlsSettings>, listen: ListenConfig) -> Self {
        Self {
            next_id: AtomicU32::new(0),
            stream,
            pending: PendingStreams::default(),
            tls,
            listen,
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Open a listener for `id` and tell the peer where to dial it.
    ///
    /// Must not be called twice for the same outstanding ID.
    pub async fn accept(&self, id: u32) -> Result<PluginListener> {
        let listener = PluginListener::bind(&self.listen).await?;

        self.stream
            .send(ConnInfo {
                service_id: id,
                network: listener.network().to_string(),
                address: listener.addr().to_string(),
            })
            .await?;

        debug!(service_id = id, address = %listener.addr(), "accepting brokered connection");
        Ok(listener)
    }

    /// Accept `id` and serve the router built by `build` on it until the
    /// server stops or the broker closes, then stop the server gracefully.
    ///
    /// Every call opens a new listener. Use it for long-lived services, not
    /// per request.
    pub async fn accept_and_serve<F>(&self, id: u32, build: F) -> Result<()>
    where
        F: FnOnce(Server) -> Router,
    {
        let listener = self.accept(id).await?;
        let incoming = listener.into_incoming(self.tls.as_ref().map(TlsSettings::acceptor));
        let router = build(Server::builder());

        let stop = self.done.child_token();
        let _stop_on_exit = stop.clone().drop_guard();

        router
            .serve_with_incoming_shutdown(incoming, stop.cancelled_owned())
            .await?;

        debug!(service_id = id, "brokered server stopped");
        Ok(())
    }

    /// Wait for the peer to accept `id`, then connect to it.
    ///
    /// Fails with [`PluginError::BrokerClosed`] as soon as either this broker
    /// or the control stream underneath it closes.
    pub async fn dial(&self, id: u32) -> Result<Channel> {
        let pending = self.pending.get_or_insert(id);

        let received = tokio::select! {
            biased;
            _ = self.done.cancelled() => {
                self.pending.retire(id, &pending);
                return Err(PluginError::BrokerClosed);
            }
            received = tokio::time::timeout(RENDEZVOUS_TIMEOUT, pending.recv()) => received,
            _ = self.stream.quit.cancelled() => {
                self.pending.retire(id, &pending);
                return Err(PluginError::BrokerClosed);
            }
        };
        pending.done.cancel();
        self.pending.retire(id, &pending);

        let info = match received {
            Ok(Some(info)) => info,
            Ok(None) => return Err(PluginError::BrokerClosed),
            Err(_) => return Err(PluginError::ConnectionInfoTimeout),
        };

        let addr = PluginAddr::resolve(&info.network, &info.address)?;
        debug!(service_id = id, address = %addr, "dialing brokered connection");
        connect_channel(addr, self.tls.clone()).await
    }

    /// A fresh ID, unique for the lifetime of this broker.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Route incoming descriptors to their waiting dialers until the control
    /// stream closes. Descriptors nobody claims are dropped after
    /// [`RENDEZVOUS_TIMEOUT`].
    pub async fn run(&self) {
        loop {
            let info = match self.stream.receive().await {
                Ok(info) => info,
                Err(e) => {
                    debug!(error = %e, "broker run loop exiting");
                    break;
                }
            };

            let id = info.service_id;
            let pending = self.pending.get_or_insert(id);
            if pending.tx.try_send(info).is_err() {
                warn!(service_id = id, "dropping duplicate connection info");
            }

            self.tasks
                .spawn(self.pending.clone().expire(id, pending, self.done.clone()));
        }
    }

    /// Close the control stream and fail every blocked broker call.
    ///
    /// Connections already handed out are left alone. Safe to call more than
    /// once.
    pub fn close(&self) {
        self.stream.close();
        self.done.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Number of service IDs currently waiting for a rendezvous.
    pub fn pending_streams(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the broker's background tasks to finish after [`close`](Self::close).
    pub async fn wait(&self) {
        self.done.cancelled().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.stream.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::controller::ControllerService;
    use crate::plugin::protocol::Empty;
    use crate::plugin::protocol::grpc_controller_client::GrpcControllerClient;
    use crate::plugin::protocol::grpc_controller_server::GrpcControllerServer;

    fn broker_pair() -> (Arc<Broker>, Arc<Broker>) {
        let (a, b) = ControlStream::pair();
        let host = Arc::new(Broker::new(a, None, ListenConfig::tcp(0, 0)));
        let plugin = Arc::new(Broker::new(b, None, ListenConfig::default()));

        for broker in [&host, &plugin] {
            let broker = broker.clone();
            tokio::spawn(async move { broker.run().await });
        }
        (host, plugin)
    }

    #[tokio::test]
    async fn accept_then_dial_reaches_the_accepted_server() {
        let (host, plugin) = broker_pair();
        let id = plugin.next_id();

        let served = CancellationToken::new();
        let server_token = served.clone();
        let serving = {
            let plugin = plugin.clone();
            tokio::spawn(async move {
                plugin
                    .accept_and_serve(id, |mut server| {
                        server.add_service(GrpcControllerServer::new(ControllerService::new(
                            server_token,
                        )))
                    })
                    .await
            })
        };

        let channel = host.dial(id).await.unwrap();
        GrpcControllerClient::new(channel)
            .shutdown(Empty {})
            .await
            .unwrap();
        assert!(served.is_cancelled());
        assert_eq!(host.pending_streams(), 0);

        plugin.close();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn accept_returns_listener_named_in_descriptor() {
        let (a, b) = ControlStream::pair();
        let broker = Broker::new(a, None, ListenConfig::tcp(0, 0));

        let listener = broker.accept(42).await.unwrap();
        let info = b.receive().await.unwrap();

        assert_eq!(info.service_id, 42);
        assert_eq!(info.network, "tcp");
        assert_eq!(info.address, listener.addr().to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn dial_without_accept_times_out() {
        let (host, _plugin) = broker_pair();

        let started = tokio::time::Instant::now();
        let err = host.dial(9).await.unwrap_err();

        assert!(matches!(err, PluginError::ConnectionInfoTimeout));
        assert!(started.elapsed() >= RENDEZVOUS_TIMEOUT);
        assert_eq!(host.pending_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_descriptors_are_evicted() {
        let (host, plugin) = broker_pair();

        let _listener = plugin.accept(3).await.unwrap();
        // Let the run loop pick the descriptor up
        while host.pending_streams() == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(RENDEZVOUS_TIMEOUT + Duration::from_millis(100)).await;
        assert_eq!(host.pending_streams(), 0);
    }

    #[tokio::test]
    async fn repeated_rendezvous_leaves_no_entries() {
        let (host, plugin) = broker_pair();
        let mut servers = Vec::new();

        for _ in 0..5 {
            let id = plugin.next_id();
            let plugin_side = plugin.clone();
            servers.push(tokio::spawn(async move {
                plugin_side
                    .accept_and_serve(id, |mut server| {
                        server.add_service(GrpcControllerServer::new(ControllerService::new(
                            CancellationToken::new(),
                        )))
                    })
                    .await
            }));

            let _channel = host.dial(id).await.unwrap();
            assert_eq!(host.pending_streams(), 0);
        }

        plugin.close();
        for server in servers {
            server.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_blocked_calls() {
        let (a, _b) = ControlStream::pair();
        let broker = Arc::new(Broker::new(a.clone(), None, ListenConfig::default()));

        let receiving = {
            let a = a.clone();
            tokio::spawn(async move { a.receive().await })
        };
        let dialing = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dial(1).await })
        };
        tokio::task::yield_now().await;

        broker.close();
        broker.close();

        let received = tokio::time::timeout(Duration::from_secs(1), receiving)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, Err(PluginError::BrokerClosed)));

        let dialed = tokio::time::timeout(Duration::from_secs(1), dialing)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(dialed, Err(PluginError::BrokerClosed)));

        let sent = a
            .send(ConnInfo {
                service_id: 1,
                network: "tcp".into(),
                address: "127.0.0.1:1".into(),
            })
            .await;
        assert!(matches!(sent, Err(PluginError::BrokerClosed)));
        assert!(broker.accept(2).await.is_err());
    }

    #[tokio::test]
    async fn closing_one_side_closes_the_peer() {
        let (a, b) = ControlStream::pair();
        a.close();

        let received = tokio::time::timeout(Duration::from_secs(1), b.receive())
            .await
            .unwrap();
        assert!(matches!(received, Err(PluginError::BrokerClosed)));
        tokio::time::timeout(Duration::from_secs(1), b.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dial_fails_promptly_once_peer_stream_is_gone() {
        let (a, b) = ControlStream::pair();
        let host = Broker::new(a.clone(), None, ListenConfig::default());

        b.close();
        tokio::time::timeout(Duration::from_secs(1), a.closed())
            .await
            .unwrap();

        let dialed = tokio::time::timeout(Duration::from_secs(1), host.dial(1))
            .await
            .unwrap();
        assert!(matches!(dialed, Err(PluginError::BrokerClosed)));
        assert_eq!(host.pending_streams(), 0);
    }

    #[tokio::test]
    async fn next_id_is_monotonic() {
        let (a, _b) = ControlStream::pair();
        let broker = Broker::new(a, None, ListenConfig::default());
        let ids: Vec<u32> = (0..4).map(|_| broker.next_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }
}
