//! fanout-proxy - Main entry point

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use fanout_proxy::{
    auth::AllowAll,
    config::ProxyConfig,
    registry::{MethodDescriptor, ServiceRegistry},
    server::{self, GrpcForwarder},
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "fanout-proxy")]
#[command(about = "Fan-out RPC proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listen address
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider globally (required for rustls 0.23+)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    // Setup logging
    let filter = tracing_subscriber::EnvFilter::new(&cli.log_level);
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
    }

    tracing::info!("Starting fan-out proxy");

    // Load configuration
    let mut config = ProxyConfig::load(cli.config)?;

    // CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    config.validate()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        methods = config.methods.len(),
        tls = config.tls.is_some(),
        "Configuration loaded"
    );

    // Every configured method is served by the caching gRPC forwarder.
    let forwarder = Arc::new(GrpcForwarder::from_config(&config));
    let mut builder = ServiceRegistry::builder();
    for method in &config.methods {
        builder = builder.register(
            MethodDescriptor::new(
                &method.name,
                &method.input_type,
                &method.output_type,
                method.client_streaming,
                method.server_streaming,
            ),
            forwarder.clone(),
        );
    }
    let registry = Arc::new(builder.build());

    server::serve_with_shutdown(&config, registry, Arc::new(AllowAll), shutdown_signal()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
