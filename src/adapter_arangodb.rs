//! ArangoDB adapter: graph traversals and document lookups via the AQL
//! cursor API. The `search` extension (an ArangoSearch view over the
//! collection) unlocks the semantic modality.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;

use crate::adapter::{
    ensure_modalities_supported, extract_hexad_id, get_json, parse_extensions, post_json,
    FederationAdapter, HealthReport, NeutralQuery, NormalizedResult, PeerInfo, QueryOptions,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct ArangoDbAdapter {
    client: reqwest::Client,
}

impl ArangoDbAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn collection(peer: &PeerInfo) -> String {
        peer.adapter_config
            .get("collection")
            .cloned()
            .unwrap_or_else(|| "hexads".to_string())
    }

    /// Build the AQL text and its bind vars. A `graph_pattern` is taken as
    /// a named-graph traversal start vertex; otherwise this is a filtered
    /// collection scan.
    fn build_aql(peer: &PeerInfo, query: &NeutralQuery) -> (String, serde_json::Value) {
        let collection = Self::collection(peer);
        if let Some(pattern) = &query.graph_pattern {
            let graph = peer
                .adapter_config
                .get("graph")
                .cloned()
                .unwrap_or_else(|| "hexad_graph".to_string());
            let aql = format!(
                "FOR v IN 1..2 ANY @start GRAPH '{}' LIMIT @limit RETURN v",
                graph
            );
            return (aql, json!({"start": pattern, "limit": query.limit}));
        }

        let mut conditions = Vec::new();
        let mut bind = serde_json::Map::new();
        for (i, (field, value)) in query.filters.iter().enumerate() {
            conditions.push(format!("doc.{} == @v{}", field, i));
            bind.insert(format!("v{}", i), json!(value));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" FILTER {}", conditions.join(" && "))
        };
        let aql = format!(
            "FOR doc IN {}{} LIMIT @limit RETURN doc",
            collection, where_clause
        );
        bind.insert("limit".to_string(), json!(query.limit));
        (aql, serde_json::Value::Object(bind))
    }
}

#[async_trait]
impl FederationAdapter for ArangoDbAdapter {
    fn adapter_type(&self) -> &'static str {
        "arangodb"
    }

    fn supported_modalities(&self, adapter_config: &BTreeMap<String, String>) -> BTreeSet<Modality> {
        let mut set = BTreeSet::from([Modality::Graph, Modality::Document]);
        if parse_extensions(adapter_config).contains("search") {
            set.insert(Modality::Semantic);
        }
        set
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        let url = format!("{}/_api/version", peer.endpoint.trim_end_matches('/'));
        let (body, latency_ms) = get_json(&self.client, &url, 2_000).await?;
        match body.get("server").and_then(|s| s.as_str()) {
            Some("arango") => Ok(HealthReport {
                status: "ok".into(),
                latency_ms,
            }),
            other => Err(AdapterError::Unhealthy(format!(
                "unexpected server identity: {:?}",
                other
            ))),
        }
    }

    async fn query(
        &self,
        peer: &PeerInfo,
        query: &NeutralQuery,
        opts: &QueryOptions,
    ) -> Result<Vec<NormalizedResult>, AdapterError> {
        ensure_modalities_supported(&self.supported_modalities(&peer.adapter_config), query)?;
        let url = format!("{}/_api/cursor", peer.endpoint.trim_end_matches('/'));
        let (aql, bind_vars) = Self::build_aql(peer, query);
        let body = json!({"query": aql, "bindVars": bind_vars, "batchSize": query.limit});
        let (raw, latency_ms) = post_json(&self.client, &url, &body, opts.timeout_ms).await?;
        if raw.get("error").and_then(|e| e.as_bool()).unwrap_or(false) {
            let code = raw.get("code").and_then(|c| c.as_u64()).unwrap_or(500) as u16;
            return Err(AdapterError::BackendError(code));
        }
        let mut results = self.translate_results(&raw, peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        raw.get("result")
            .and_then(|rows| rows.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|row| NormalizedResult {
                        source_store: peer.store_id.clone(),
                        hexad_id: extract_hexad_id(row, "_key"),
                        score: 0.0,
                        drifted: false,
                        data: row.clone(),
                        response_time_ms: 0,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerInfo {
        PeerInfo {
            store_id: "arango-1".into(),
            endpoint: "http://arango-1:8529".into(),
            adapter_config: BTreeMap::new(),
        }
    }

    #[test]
    fn base_capability_is_graph_and_document() {
        let adapter = ArangoDbAdapter::new();
        let set = adapter.supported_modalities(&BTreeMap::new());
        assert_eq!(set, BTreeSet::from([Modality::Graph, Modality::Document]));
    }

    #[test]
    fn search_extension_unlocks_semantic() {
        let adapter = ArangoDbAdapter::new();
        let mut config = BTreeMap::new();
        config.insert("extensions".to_string(), "search".to_string());
        assert!(adapter
            .supported_modalities(&config)
            .contains(&Modality::Semantic));
    }

    #[test]
    fn graph_pattern_becomes_a_traversal() {
        let query = NeutralQuery {
            graph_pattern: Some("hexads/hx-1".into()),
            ..Default::default()
        };
        let (aql, bind) = ArangoDbAdapter::build_aql(&peer(), &query);
        assert!(aql.contains("GRAPH 'hexad_graph'"));
        assert_eq!(bind["start"], "hexads/hx-1");
    }

    #[test]
    fn filters_become_bound_conditions() {
        let mut query = NeutralQuery::default();
        query.filters.insert("kind".into(), "sensor".into());
        let (aql, bind) = ArangoDbAdapter::build_aql(&peer(), &query);
        assert!(aql.contains("doc.kind == @v0"));
        assert_eq!(bind["v0"], "sensor");
    }

    #[test]
    fn cursor_result_normalises() {
        let adapter = ArangoDbAdapter::new();
        let raw = serde_json::json!({
            "result": [{"_key": "k1", "hexad_id": "hx-4"}, {"_key": "k2"}],
            "error": false
        });
        let results = adapter.translate_results(&raw, &peer());
        assert_eq!(results[0].hexad_id, "hx-4");
        assert_eq!(results[1].hexad_id, "k2");
    }
}
