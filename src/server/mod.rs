//! Server side of the fan-out proxy
//!
//! The proxy session and its stream set are transport-agnostic; the tonic
//! wiring lives in [`service`] and the bootstrap helpers below.

pub mod forward;
pub mod service;
pub mod session;
pub mod stream_set;
pub mod target;

pub use forward::GrpcForwarder;
pub use service::ProxyService;
pub use session::{ProxySession, SessionLimits};
pub use stream_set::TargetStreamSet;
pub use target::{StreamState, TargetStream};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};

use crate::auth::Authorizer;
use crate::config::ProxyConfig;
use crate::proto::proxy_server::ProxyServer;
use crate::registry::ServiceRegistry;

/// Start the proxy server and run until it fails.
pub async fn serve(
    config: &ProxyConfig,
    registry: Arc<ServiceRegistry>,
    authorizer: Arc<dyn Authorizer>,
) -> Result<()> {
    serve_with_shutdown(config, registry, authorizer, std::future::pending::<()>()).await
}

/// Start the proxy server and run until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(
    config: &ProxyConfig,
    registry: Arc<ServiceRegistry>,
    authorizer: Arc<dyn Authorizer>,
    shutdown: F,
) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", config.listen_addr))?;

    let service = ProxyService::new(registry, authorizer).with_limits(SessionLimits::from(config));

    let mut builder = Server::builder();
    if let Some(tls) = &config.tls {
        let cert = tokio::fs::read(&tls.cert)
            .await
            .with_context(|| format!("Failed to read TLS certificate {:?}", tls.cert))?;
        let key = tokio::fs::read(&tls.key)
            .await
            .with_context(|| format!("Failed to read TLS key {:?}", tls.key))?;
        let mut tls_config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
        if let Some(ca) = &tls.client_ca {
            let ca_pem = tokio::fs::read(ca)
                .await
                .with_context(|| format!("Failed to read client CA {:?}", ca))?;
            tls_config = tls_config.client_ca_root(Certificate::from_pem(ca_pem));
        }
        builder = builder
            .tls_config(tls_config)
            .context("Invalid TLS configuration")?;
        tracing::info!("mTLS enabled on proxy listener");
    }

    tracing::info!(addr = %addr, "Starting fan-out proxy server");
    builder
        .add_service(ProxyServer::new(service))
        .serve_with_shutdown(addr, shutdown)
        .await
        .context("Proxy server failed")?;

    Ok(())
}
