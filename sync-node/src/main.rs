//! Process entry point: load configuration, wire the node together, and
//! serve the HTTP façade.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use sync_node::orchestrator::NodeOrchestrator;
use sync_node::{config, http};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let config = config::NodeConfig::from_env()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(node_id = %config.node_id, %addr, peers = ?config.peers, "starting node");

    let node = Arc::new(NodeOrchestrator::new(config));
    node.start().await;

    let app = http::router(node);
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}
