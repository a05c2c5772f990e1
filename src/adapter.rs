//! The adapter contract: one small interface every backend family implements.
//!
//! The resolver never talks to a backend directly. It looks the family up in
//! the [`AdapterRegistry`] by its tag, asks the adapter which modalities the
//! concrete instance supports, and hands it a neutral query shape to
//! translate, issue and normalise. Unknown tags are rejected at the boundary
//! with `unknown_adapter` — there is no reflective dispatch.
//!
//! Two of the five operations are pure by contract and must stay callable
//! without network I/O: `supported_modalities` (capability clipping happens
//! during command validation and apply, which must be deterministic on every
//! node) and `translate_results`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{AdapterError, RegistryError};
use crate::modality::Modality;

// ── Peer view ─────────────────────────────────────────────────────────────────

/// The slice of a registered store an adapter needs to reach its backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub store_id: String,
    /// Opaque address, normally a base URL.
    pub endpoint: String,
    /// Adapter-specific options: credentials, database/collection/bucket
    /// names, declared extensions, retention hints.
    pub adapter_config: BTreeMap<String, String>,
}

impl PeerInfo {
    /// Declared extensions, parsed from the comma-separated `extensions`
    /// config key. Absent key means no extensions.
    pub fn extensions(&self) -> BTreeSet<String> {
        parse_extensions(&self.adapter_config)
    }
}

/// Parse the `extensions` key of an adapter config.
pub fn parse_extensions(config: &BTreeMap<String, String>) -> BTreeSet<String> {
    config
        .get("extensions")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

// ── Neutral query shape ───────────────────────────────────────────────────────

/// Inclusive wall-clock window for temporal filters (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalRange {
    pub start: i64,
    pub end: i64,
}

/// Geographic bounding box for spatial filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialBounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

fn default_limit() -> usize {
    100
}

/// The backend-neutral query every adapter translates.
///
/// `modalities` is the required set; empty means no modality filter. The
/// optional clauses are each meaningful to a subset of families — an adapter
/// ignores or deterministically rejects the ones it cannot serve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeutralQuery {
    #[serde(default)]
    pub modalities: Vec<Modality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_query: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_range: Option<TemporalRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_bounds: Option<SpatialBounds>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for NeutralQuery {
    fn default() -> Self {
        Self {
            modalities: Vec::new(),
            text_query: None,
            vector_query: None,
            graph_pattern: None,
            temporal_range: None,
            spatial_bounds: None,
            filters: BTreeMap::new(),
            limit: default_limit(),
        }
    }
}

/// Per-invocation options the resolver passes alongside the query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Hard upper bound for this peer's backend round-trip.
    pub timeout_ms: u64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

// ── Normalised result shape ───────────────────────────────────────────────────

/// One backend row, normalised. Backends without a native score yield 0.0;
/// rows without an extractable identifier yield `"unknown"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub source_store: String,
    pub hexad_id: String,
    pub score: f64,
    pub drifted: bool,
    pub data: serde_json::Value,
    pub response_time_ms: u64,
}

/// Fallback identifier for rows the adapter cannot attribute to a hexad.
pub const UNKNOWN_HEXAD_ID: &str = "unknown";

/// Successful health probe: backend status plus observed round-trip latency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub latency_ms: u64,
}

// ── The contract ──────────────────────────────────────────────────────────────

/// Implemented once per backend family.
#[async_trait]
pub trait FederationAdapter: Send + Sync {
    /// The registry tag this family dispatches under.
    fn adapter_type(&self) -> &'static str;

    /// The family capability intersected with this instance's declared
    /// extensions. Pure: must not perform I/O.
    fn supported_modalities(&self, adapter_config: &BTreeMap<String, String>) -> BTreeSet<Modality>;

    /// Verify the instance is reachable and speaks the expected dialect.
    /// Side-effect free beyond a single health probe.
    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError>;

    /// Probe the backend, returning its status string and round-trip latency.
    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError>;

    /// Translate the neutral query to backend-native form, issue it and
    /// normalise the response rows.
    async fn query(
        &self,
        peer: &PeerInfo,
        query: &NeutralQuery,
        opts: &QueryOptions,
    ) -> Result<Vec<NormalizedResult>, AdapterError>;

    /// Pure normalisation of backend-native rows. Identifier extraction is
    /// adapter-specific but deterministic.
    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult>;
}

// ── Adapter registry ──────────────────────────────────────────────────────────

/// Startup-time map of adapter tag → implementation.
///
/// The registry is identical on every orchestration node (it is built from
/// the same compiled-in set), which keeps modality clipping deterministic
/// across the cluster.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn FederationAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry holding every compiled-in backend family.
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::adapter_couchdb::CouchDbAdapter::new()));
        registry.register(Arc::new(
            crate::adapter_elasticsearch::ElasticsearchAdapter::new(),
        ));
        registry.register(Arc::new(crate::adapter_arangodb::ArangoDbAdapter::new()));
        registry.register(Arc::new(crate::adapter_neo4j::Neo4jAdapter::new()));
        registry.register(Arc::new(
            crate::adapter_postgresql::PostgresqlAdapter::new(),
        ));
        registry.register(Arc::new(crate::adapter_influxdb::InfluxDbAdapter::new()));
        registry.register(Arc::new(crate::adapter_qdrant::QdrantAdapter::new()));
        registry.register(Arc::new(
            crate::adapter_clickhouse::ClickHouseAdapter::new(),
        ));
        registry.register(Arc::new(
            crate::adapter_object_store::ObjectStoreAdapter::new(),
        ));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn FederationAdapter>) {
        self.adapters.insert(adapter.adapter_type(), adapter);
    }

    /// Look a family up by tag, rejecting unknown tags at the boundary.
    pub fn get(&self, adapter_type: &str) -> Result<Arc<dyn FederationAdapter>, RegistryError> {
        self.adapters
            .get(adapter_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAdapter(adapter_type.to_string()))
    }

    pub fn contains(&self, adapter_type: &str) -> bool {
        self.adapters.contains_key(adapter_type)
    }

    /// Registered tags in a stable order.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.adapters.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// A family's capability for a concrete instance config, or
    /// `unknown_adapter` when the tag is not registered. Pure.
    pub fn supported_modalities(
        &self,
        adapter_type: &str,
        adapter_config: &BTreeMap<String, String>,
    ) -> Result<BTreeSet<Modality>, RegistryError> {
        Ok(self.get(adapter_type)?.supported_modalities(adapter_config))
    }
}

// ── Shared backend plumbing ───────────────────────────────────────────────────

/// Reject a query that names a modality this instance cannot serve. The
/// resolver filters peers up front, but the contract requires each adapter
/// to fail deterministically when called directly.
pub fn ensure_modalities_supported(
    supported: &BTreeSet<Modality>,
    query: &NeutralQuery,
) -> Result<(), AdapterError> {
    for modality in &query.modalities {
        if !supported.contains(modality) {
            return Err(AdapterError::UnsupportedModality(
                modality.as_str().to_string(),
            ));
        }
    }
    Ok(())
}

/// GET a JSON document from a backend, returning the body and the observed
/// round-trip latency.
pub async fn get_json(
    client: &reqwest::Client,
    url: &str,
    timeout_ms: u64,
) -> Result<(serde_json::Value, u64), AdapterError> {
    let started = std::time::Instant::now();
    let response = client
        .get(url)
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .send()
        .await
        .map_err(AdapterError::from_reqwest)?;
    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    if status == 401 || status == 403 {
        return Err(AdapterError::AuthFailed);
    }
    if !(200..300).contains(&status) {
        return Err(AdapterError::BackendError(status));
    }
    let value = response
        .json()
        .await
        .map_err(|e| AdapterError::DecodeError(e.to_string()))?;
    Ok((value, latency_ms))
}

/// POST a JSON body to a backend and decode a JSON reply, with latency.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    timeout_ms: u64,
) -> Result<(serde_json::Value, u64), AdapterError> {
    let started = std::time::Instant::now();
    let response = client
        .post(url)
        .timeout(std::time::Duration::from_millis(timeout_ms))
        .json(body)
        .send()
        .await
        .map_err(AdapterError::from_reqwest)?;
    let latency_ms = started.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    if status == 401 || status == 403 {
        return Err(AdapterError::AuthFailed);
    }
    if !(200..300).contains(&status) {
        return Err(AdapterError::BackendError(status));
    }
    let value = response
        .json()
        .await
        .map_err(|e| AdapterError::DecodeError(e.to_string()))?;
    Ok((value, latency_ms))
}

/// Extract the hexad identifier from a backend row: an explicit `hexad_id`
/// field wins, then the named fallback key, then `"unknown"`.
pub fn extract_hexad_id(row: &serde_json::Value, fallback_key: &str) -> String {
    row.get("hexad_id")
        .and_then(|v| v.as_str())
        .or_else(|| row.get(fallback_key).and_then(|v| v.as_str()))
        .unwrap_or(UNKNOWN_HEXAD_ID)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_all_nine_families() {
        let registry = AdapterRegistry::with_builtin_adapters();
        for tag in [
            "couchdb",
            "elasticsearch",
            "arangodb",
            "neo4j",
            "postgresql",
            "influxdb",
            "qdrant",
            "clickhouse",
            "object_store",
        ] {
            assert!(registry.contains(tag), "missing adapter family: {}", tag);
        }
        assert_eq!(registry.tags().len(), 9);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = AdapterRegistry::with_builtin_adapters();
        let err = match registry.get("duckdb") {
            Err(e) => e,
            Ok(_) => panic!("expected unknown_adapter error"),
        };
        assert_eq!(err.kind(), "unknown_adapter");
    }

    #[test]
    fn extensions_parse_from_config() {
        let mut config = BTreeMap::new();
        config.insert("extensions".to_string(), "pgvector, PostGIS ,".to_string());
        let exts = parse_extensions(&config);
        assert!(exts.contains("pgvector"));
        assert!(exts.contains("postgis"));
        assert_eq!(exts.len(), 2);
    }

    #[test]
    fn neutral_query_defaults() {
        let q: NeutralQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.limit, 100);
        assert!(q.modalities.is_empty());
        assert!(q.text_query.is_none());
    }

    #[test]
    fn neutral_query_round_trips() {
        let q = NeutralQuery {
            modalities: vec![Modality::Vector, Modality::Document],
            text_query: Some("ocean currents".into()),
            vector_query: Some(vec![0.1, 0.2, 0.3]),
            temporal_range: Some(TemporalRange {
                start: 0,
                end: 1_000,
            }),
            ..Default::default()
        };
        let j = serde_json::to_string(&q).unwrap();
        assert_eq!(serde_json::from_str::<NeutralQuery>(&j).unwrap(), q);
    }

    #[test]
    fn unsupported_modality_is_a_deterministic_reject() {
        let supported = BTreeSet::from([Modality::Document]);
        let query = NeutralQuery {
            modalities: vec![Modality::Document, Modality::Vector],
            ..Default::default()
        };
        let err = ensure_modalities_supported(&supported, &query).unwrap_err();
        assert_eq!(err.kind(), "unsupported_modality");
    }

    #[test]
    fn hexad_id_extraction_prefers_explicit_field() {
        let row = serde_json::json!({"hexad_id": "hx-1", "_id": "doc-1"});
        assert_eq!(extract_hexad_id(&row, "_id"), "hx-1");

        let row = serde_json::json!({"_id": "doc-1"});
        assert_eq!(extract_hexad_id(&row, "_id"), "doc-1");

        let row = serde_json::json!({"payload": 1});
        assert_eq!(extract_hexad_id(&row, "_id"), UNKNOWN_HEXAD_ID);
    }
}
