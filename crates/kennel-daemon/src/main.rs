//! kennel: storage provider daemon.
//!
//! Serves uploads and downloads over HTTP, proves storage to the chain and
//! claims stray contracts from other providers.

use std::net::SocketAddr;
use std::sync::Arc;

use kennel_chain::GatewayClient;
use kennel_daemon::{DaemonConfig, Node};
use kennel_engine::HttpFetcher;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = DaemonConfig::load()?;

    // 2. Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.logging.log_level.parse()?),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "kennel provider starting");
    config.validate()?;

    // 3. Chain gateway and peer fetcher
    let chain = Arc::new(GatewayClient::new(
        config.chain.gateway_url.clone(),
        config.chain_timeout(),
    )?);
    let fetcher = Arc::new(HttpFetcher::new(config.chain_timeout())?);
    info!(
        gateway = %chain.base_url(),
        address = %config.provider.address,
        public_url = %config.provider.public_url,
        "using chain gateway"
    );

    // 4. Open storage and start background loops
    let node = Node::start(config, chain, fetcher).await?;

    // 5. Serve HTTP until shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], node.config.http.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    let app = node.router();
    let mut shutdown_rx = node.subscribe();
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    node.shutdown().await;
    Ok(())
}
