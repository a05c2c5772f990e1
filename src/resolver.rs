//! The federation resolver: peer selection, bounded fan-out and merge.
//!
//! Given `(pattern, required_modalities, options)` the resolver snapshots
//! the locally applied registry (no consensus round-trip), filters peers by
//! pattern, capability and drift policy, then queries every surviving peer
//! concurrently under one hard deadline. Per-peer failures are captured and
//! reported; they never fail the whole query. Late results are discarded —
//! in-flight adapter workers are left to finish on their own.
//!
//! The merged output is the concatenation of per-peer result lists,
//! stable-sorted by descending score then by source store. The resolver
//! does not de-duplicate across stores: identity semantics are
//! domain-dependent and belong to the caller.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

use crate::adapter::{AdapterRegistry, NeutralQuery, NormalizedResult, QueryOptions};
use crate::config::ResolverConfig;
use crate::metrics::{RESOLVER_PEER_ERRORS_TOTAL, RESOLVER_QUERIES_TOTAL};
use crate::modality::Modality;
use crate::registry::Registry;

// ── Drift policy ──────────────────────────────────────────────────────────────

/// Whether peers are filtered by trust before fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftPolicy {
    /// Include every capable peer regardless of trust.
    Tolerate,
    /// Exclude peers whose trust has dropped below the threshold.
    Strict,
}

impl DriftPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftPolicy::Tolerate => "tolerate",
            DriftPolicy::Strict => "strict",
        }
    }
}

impl FromStr for DriftPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tolerate" => Ok(DriftPolicy::Tolerate),
            "strict" => Ok(DriftPolicy::Strict),
            _ => Err(format!(
                "Invalid drift policy: '{}'. Use 'tolerate' or 'strict'.",
                s
            )),
        }
    }
}

// ── Response shape ────────────────────────────────────────────────────────────

/// Why a peer was left out of the fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedStore {
    pub store_id: String,
    pub reason: String,
}

/// The merged answer for one federated query.
#[derive(Debug, Clone, Serialize)]
pub struct FederationResponse {
    pub results: Vec<NormalizedResult>,
    pub stores_queried: Vec<String>,
    pub stores_excluded: Vec<ExcludedStore>,
    pub drift_policy: DriftPolicy,
    /// Per-store failures captured during fan-out. Partial failure never
    /// fails the query; callers use this to tell "no data" from "down".
    pub peer_errors: BTreeMap<String, String>,
}

/// Per-query overrides on top of [`ResolverConfig`].
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub drift_policy: Option<DriftPolicy>,
    pub timeout_ms: Option<u64>,
}

// ── Pattern matching ──────────────────────────────────────────────────────────

/// Glob-like store pattern: `*` matches everything, `prefix/*` matches ids
/// starting with `prefix/`, anything else matches exactly.
pub fn pattern_matches(pattern: &str, store_id: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => store_id.starts_with(prefix),
        None => store_id == pattern,
    }
}

// ── The resolver ──────────────────────────────────────────────────────────────

pub struct FederationResolver {
    registry_rx: watch::Receiver<Registry>,
    adapters: Arc<AdapterRegistry>,
    config: ResolverConfig,
}

impl FederationResolver {
    pub fn new(
        registry_rx: watch::Receiver<Registry>,
        adapters: Arc<AdapterRegistry>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            registry_rx,
            adapters,
            config,
        }
    }

    /// Run one federated query.
    pub async fn resolve(
        &self,
        pattern: &str,
        required_modalities: &[Modality],
        query: NeutralQuery,
        options: ResolveOptions,
    ) -> FederationResponse {
        RESOLVER_QUERIES_TOTAL.inc();
        let drift_policy = options.drift_policy.unwrap_or(self.config.drift_policy_default);
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);

        // Committed + applied state only; the watch channel is published
        // after apply, so read-your-writes holds for a client that re-reads
        // the node it proposed on.
        let registry = self.registry_rx.borrow().clone();

        let (selected, stores_excluded) =
            self.select_peers(&registry, pattern, required_modalities, drift_policy);
        let stores_queried: Vec<String> = selected.iter().map(|s| s.store_id.clone()).collect();

        debug!(
            pattern,
            queried = stores_queried.len(),
            excluded = stores_excluded.len(),
            drift_policy = drift_policy.as_str(),
            "Resolver fan-out starting"
        );

        let (results, peer_errors) = self.fan_out(selected, query, timeout_ms).await;

        let mut merged = results;
        // Stable sort: descending score, ties broken by source store; the
        // per-peer order each adapter produced survives beyond that.
        merged.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source_store.cmp(&b.source_store))
        });

        FederationResponse {
            results: merged,
            stores_queried,
            stores_excluded,
            drift_policy,
            peer_errors,
        }
    }

    /// Deterministic selection: pattern → capability → drift policy. Every
    /// store removed in a step is reported with its rejection reason.
    fn select_peers(
        &self,
        registry: &Registry,
        pattern: &str,
        required_modalities: &[Modality],
        drift_policy: DriftPolicy,
    ) -> (Vec<crate::registry::StoreInfo>, Vec<ExcludedStore>) {
        let mut selected = Vec::new();
        let mut excluded = Vec::new();

        for store in registry.stores.values() {
            if !pattern_matches(pattern, &store.store_id) {
                excluded.push(ExcludedStore {
                    store_id: store.store_id.clone(),
                    reason: "pattern_mismatch".to_string(),
                });
                continue;
            }
            if let Some(missing) = required_modalities
                .iter()
                .find(|m| !store.modalities.contains(m))
            {
                debug!(store_id = %store.store_id, modality = %missing, "Peer lacks required modality");
                excluded.push(ExcludedStore {
                    store_id: store.store_id.clone(),
                    reason: "modality_not_supported".to_string(),
                });
                continue;
            }
            if drift_policy == DriftPolicy::Strict
                && store.trust_level < self.config.strict_trust_threshold
            {
                excluded.push(ExcludedStore {
                    store_id: store.store_id.clone(),
                    reason: "trust_below_threshold".to_string(),
                });
                continue;
            }
            selected.push(store.clone());
        }
        (selected, excluded)
    }

    /// One worker per selected peer, joined by a hard deadline. Workers post
    /// `(store_id, outcome)` back over a channel; whatever has not arrived
    /// by the deadline is discarded.
    async fn fan_out(
        &self,
        selected: Vec<crate::registry::StoreInfo>,
        query: NeutralQuery,
        timeout_ms: u64,
    ) -> (Vec<NormalizedResult>, BTreeMap<String, String>) {
        let mut results = Vec::new();
        let mut peer_errors = BTreeMap::new();
        if selected.is_empty() {
            return (results, peer_errors);
        }

        let expected = selected.len();
        let (tx, mut rx) = mpsc::channel(expected);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        for store in selected {
            let adapter = match self.adapters.get(&store.adapter_type) {
                Ok(adapter) => adapter,
                Err(e) => {
                    // A registry written by a binary with more families; the
                    // store exists but this node cannot speak to it.
                    peer_errors.insert(store.store_id.clone(), e.kind().to_string());
                    continue;
                }
            };
            let tx = tx.clone();
            let peer = store.peer_info();
            let query = query.clone();
            let opts = QueryOptions { timeout_ms };
            tokio::spawn(async move {
                let store_id = peer.store_id.clone();
                let outcome = adapter.query(&peer, &query, &opts).await;
                let _ = tx.send((store_id, outcome)).await;
            });
        }
        drop(tx);

        let mut received = peer_errors.len();
        while received < expected {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some((store_id, Ok(mut rows))) => {
                        received += 1;
                        results.append(&mut rows);
                        debug!(store_id = %store_id, "Peer responded");
                    }
                    Some((store_id, Err(e))) => {
                        received += 1;
                        RESOLVER_PEER_ERRORS_TOTAL
                            .with_label_values(&[e.kind()])
                            .inc();
                        warn!(store_id = %store_id, error = %e, "Peer query failed");
                        peer_errors.insert(store_id, e.kind().to_string());
                    }
                    None => break,
                },
                _ = time::sleep_until(deadline) => {
                    debug!(
                        received,
                        expected,
                        "Fan-out deadline reached; discarding late peers"
                    );
                    break;
                }
            }
        }
        (results, peer_errors)
    }
}
