//! Lets the host ask a plugin to stop serving
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::debug;

use super::protocol::Empty;
use super::protocol::grpc_controller_server::GrpcController;

pub struct ControllerService {
    shutdown: CancellationToken,
}

impl ControllerService {
    /// `shutdown` is cancelled when the host calls `Shutdown`; the plugin
    /// server stops gracefully on it.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

#[tonic::async_trait]
impl GrpcController for ControllerService {
    async fn shutdown(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        debug!("shutdown requested by host");
        self.shutdown.cancel();
        Ok(Response::new(Empty {}))
    }
}
