use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod chaos;
mod config;
mod error;
mod metrics;
mod raft;
mod vault;

use api::AppState;
use chaos::ChaosController;
use config::Config;
use metrics::ConsensusMetrics;
use raft::rpc::HttpTransport;
use raft::RaftNode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "raftvault=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "raftvault.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!("could not load {} ({}), using defaults", config_path, e);
            Config::default()
        }
    };
    config.validate()?;
    std::fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("creating data dir {}", config.node.data_dir.display()))?;

    let config = Arc::new(config);
    let metrics = Arc::new(ConsensusMetrics::new(config.metrics.event_capacity));
    let chaos = Arc::new(ChaosController::new(config.chaos.enabled));
    let transport = Arc::new(HttpTransport::new(&config, chaos.clone())?);

    // Recovery runs here: hard state, then snapshot, then Follower.
    let node = RaftNode::new(config.clone(), transport, metrics.clone())?;
    node.start();

    let state = Arc::new(AppState { node: node.clone(), metrics, chaos });
    let app = api::router(state);

    let addr: SocketAddr = config
        .node
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr {}", config.node.listen_addr))?;
    info!(
        "raftvault node {} listening on {} ({} cluster members)",
        config.node.id,
        addr,
        config.cluster.nodes.len()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(node))
        .await?;

    Ok(())
}

async fn shutdown_signal(node: Arc<RaftNode>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("could not install ctrl-c handler: {}", e);
        return;
    }
    info!("shutdown requested");
    node.stop();
}
