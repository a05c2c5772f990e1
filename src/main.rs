//! Orchestration node entry point: recover, join the cluster, serve.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hexafed::adapter::AdapterRegistry;
use hexafed::config::Settings;
use hexafed::consensus::ConsensusNode;
use hexafed::health::HealthMonitor;
use hexafed::metrics::register_metrics;
use hexafed::server;
use hexafed::transport::LocalDirectory;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let settings = Settings::load()?;
    register_metrics()?;

    info!(
        node_id = %settings.node.node_id,
        peers = settings.node.peers.len(),
        wal = ?settings.node.wal_path,
        bind_addr = %settings.bind_addr,
        "Starting hexad federation orchestrator"
    );

    let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
    let directory = Arc::new(LocalDirectory::new());

    let node = ConsensusNode::spawn(settings.node.clone(), adapters.clone(), directory)?;

    // Health prober over the applied registry.
    let monitor = HealthMonitor::new(node.registry(), adapters, settings.health_interval_ms);
    tokio::spawn(monitor.run());

    // Raft RPC + diagnostics endpoint.
    let bind_addr = settings.bind_addr.clone();
    tokio::spawn(server::serve(bind_addr, node.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(node_id = %node.node_id(), "Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
    node.shutdown().await;
    Ok(())
}

/// Structured logging: `RUST_LOG` filtering, JSON output when `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
