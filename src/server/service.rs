//! Tonic service wiring for the proxy stream

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::auth::{Authorizer, PeerIdentity};
use crate::proto::proxy_server::Proxy;
use crate::proto::{ProxyReply, ProxyRequest};
use crate::registry::ServiceRegistry;
use crate::server::session::{ProxySession, SessionLimits};

/// The `fanout.v1.Proxy` service implementation. Cheap to clone.
#[derive(Clone)]
pub struct ProxyService {
    registry: Arc<ServiceRegistry>,
    authorizer: Arc<dyn Authorizer>,
    limits: SessionLimits,
}

impl ProxyService {
    pub fn new(registry: Arc<ServiceRegistry>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            registry,
            authorizer,
            limits: SessionLimits::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[tonic::async_trait]
impl Proxy for ProxyService {
    type ProxyStream = ReceiverStream<Result<ProxyReply, Status>>;

    async fn proxy(
        &self,
        request: Request<Streaming<ProxyRequest>>,
    ) -> Result<Response<Self::ProxyStream>, Status> {
        let peer = PeerIdentity::from_request(&request);
        tracing::info!(
            peer = peer.as_ref().and_then(|p| p.common_name.as_deref()),
            "Proxy stream opened"
        );

        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(self.limits.reply_buffer);
        let session = ProxySession::new(Arc::clone(&self.registry), Arc::clone(&self.authorizer))
            .with_peer(peer)
            .with_limits(self.limits);

        tokio::spawn(async move {
            match session.run(inbound, tx.clone()).await {
                Ok(()) => tracing::info!("Proxy stream closed"),
                Err(status) => {
                    tracing::warn!(error = %status, "Proxy session ended with error");
                    let _ = tx.send(Err(status)).await;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
