//! Prometheus metrics for the consensus node, the resolver and the health
//! prober. Served as text on `GET /metrics`.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

lazy_static::lazy_static! {
    // === Consensus ===

    pub static ref RAFT_PROPOSALS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("raft_proposals_total", "Proposals by outcome")
                .namespace("hexafed"),
            &["outcome"] // accepted, rejected, not_leader, persistence
        ).unwrap();

    pub static ref RAFT_ELECTIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("raft_elections_total", "Elections this node has started")
                .namespace("hexafed")
        ).unwrap();

    pub static ref RAFT_CURRENT_TERM: IntGauge =
        IntGauge::with_opts(
            Opts::new("raft_current_term", "Current Raft term")
                .namespace("hexafed")
        ).unwrap();

    pub static ref RAFT_COMMIT_INDEX: IntGauge =
        IntGauge::with_opts(
            Opts::new("raft_commit_index", "Highest committed log index")
                .namespace("hexafed")
        ).unwrap();

    pub static ref RAFT_APPLIED_INDEX: IntGauge =
        IntGauge::with_opts(
            Opts::new("raft_applied_index", "Highest applied log index")
                .namespace("hexafed")
        ).unwrap();

    pub static ref RAFT_RPC_FAILURES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("raft_rpc_failures_total", "Outbound RPC failures by kind")
                .namespace("hexafed"),
            &["kind"]
        ).unwrap();

    // === Resolver ===

    pub static ref RESOLVER_QUERIES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("resolver_queries_total", "Federated queries handled")
                .namespace("hexafed")
        ).unwrap();

    pub static ref RESOLVER_PEER_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("resolver_peer_errors_total", "Per-peer adapter failures by kind")
                .namespace("hexafed"),
            &["kind"]
        ).unwrap();

    // === Health prober ===

    pub static ref HEALTH_PROBE_FAILURES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("health_probe_failures_total", "Backend probe failures by adapter family")
                .namespace("hexafed"),
            &["adapter"]
        ).unwrap();
}

/// Register every metric with the default registry. Call once at startup;
/// a second call fails with a duplicate-registration error.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(RAFT_PROPOSALS_TOTAL.clone()))?;
    registry.register(Box::new(RAFT_ELECTIONS_TOTAL.clone()))?;
    registry.register(Box::new(RAFT_CURRENT_TERM.clone()))?;
    registry.register(Box::new(RAFT_COMMIT_INDEX.clone()))?;
    registry.register(Box::new(RAFT_APPLIED_INDEX.clone()))?;
    registry.register(Box::new(RAFT_RPC_FAILURES_TOTAL.clone()))?;
    registry.register(Box::new(RESOLVER_QUERIES_TOTAL.clone()))?;
    registry.register(Box::new(RESOLVER_PEER_ERRORS_TOTAL.clone()))?;
    registry.register(Box::new(HEALTH_PROBE_FAILURES_TOTAL.clone()))?;
    Ok(())
}

/// Encode the default registry as Prometheus text.
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    buffer
}
