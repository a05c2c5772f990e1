//! Neo4j adapter: Cypher over the transactional HTTP endpoint. Spatial is
//! base capability (point types are built in); `vector` is gated on the
//! vector-index extension.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;

use crate::adapter::{
    ensure_modalities_supported, get_json, parse_extensions, post_json, FederationAdapter,
    HealthReport, NeutralQuery, NormalizedResult, PeerInfo, QueryOptions, UNKNOWN_HEXAD_ID,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct Neo4jAdapter {
    client: reqwest::Client,
}

impl Neo4jAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn database(peer: &PeerInfo) -> String {
        peer.adapter_config
            .get("database")
            .cloned()
            .unwrap_or_else(|| "neo4j".to_string())
    }

    fn build_statement(query: &NeutralQuery) -> (String, serde_json::Value) {
        // graph_pattern is a Cypher MATCH fragment; without one this is a
        // property-filtered node scan.
        if let Some(pattern) = &query.graph_pattern {
            let cypher = format!("MATCH {} RETURN n LIMIT $limit", pattern);
            return (cypher, json!({"limit": query.limit}));
        }
        let mut conditions = Vec::new();
        let mut params = serde_json::Map::new();
        for (i, (field, value)) in query.filters.iter().enumerate() {
            conditions.push(format!("n.{} = $v{}", field, i));
            params.insert(format!("v{}", i), json!(value));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        params.insert("limit".to_string(), json!(query.limit));
        (
            format!("MATCH (n:Hexad){} RETURN n LIMIT $limit", where_clause),
            serde_json::Value::Object(params),
        )
    }
}

#[async_trait]
impl FederationAdapter for Neo4jAdapter {
    fn adapter_type(&self) -> &'static str {
        "neo4j"
    }

    fn supported_modalities(&self, adapter_config: &BTreeMap<String, String>) -> BTreeSet<Modality> {
        let mut set = BTreeSet::from([Modality::Graph, Modality::Spatial]);
        if parse_extensions(adapter_config).contains("vector") {
            set.insert(Modality::Vector);
        }
        set
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        // The discovery document confirms dialect and reachability.
        let url = format!("{}/", peer.endpoint.trim_end_matches('/'));
        let (body, latency_ms) = get_json(&self.client, &url, 2_000).await?;
        if body.get("neo4j_version").is_none() && body.get("transaction").is_none() {
            return Err(AdapterError::Unhealthy("not a neo4j endpoint".into()));
        }
        Ok(HealthReport {
            status: "ok".into(),
            latency_ms,
        })
    }

    async fn query(
        &self,
        peer: &PeerInfo,
        query: &NeutralQuery,
        opts: &QueryOptions,
    ) -> Result<Vec<NormalizedResult>, AdapterError> {
        ensure_modalities_supported(&self.supported_modalities(&peer.adapter_config), query)?;
        let url = format!(
            "{}/db/{}/tx/commit",
            peer.endpoint.trim_end_matches('/'),
            Self::database(peer)
        );
        let (cypher, params) = Self::build_statement(query);
        let body = json!({"statements": [{"statement": cypher, "parameters": params}]});
        let (raw, latency_ms) = post_json(&self.client, &url, &body, opts.timeout_ms).await?;

        if let Some(errors) = raw.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                return Err(AdapterError::BackendError(400));
            }
        }
        let mut results = self.translate_results(&raw, peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        raw.pointer("/results/0/data")
            .and_then(|data| data.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|entry| {
                        let node = entry
                            .pointer("/row/0")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        let hexad_id = node
                            .get("hexad_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or(UNKNOWN_HEXAD_ID)
                            .to_string();
                        NormalizedResult {
                            source_store: peer.store_id.clone(),
                            hexad_id,
                            score: 0.0,
                            drifted: false,
                            data: node,
                            response_time_ms: 0,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_capability() {
        let adapter = Neo4jAdapter::new();
        assert_eq!(
            adapter.supported_modalities(&BTreeMap::new()),
            BTreeSet::from([Modality::Graph, Modality::Spatial])
        );
    }

    #[test]
    fn filters_build_parameterised_cypher() {
        let mut query = NeutralQuery::default();
        query.filters.insert("kind".into(), "vessel".into());
        let (cypher, params) = Neo4jAdapter::build_statement(&query);
        assert!(cypher.contains("n.kind = $v0"));
        assert_eq!(params["v0"], "vessel");
    }

    #[test]
    fn rows_normalise_from_tx_response() {
        let adapter = Neo4jAdapter::new();
        let peer = PeerInfo {
            store_id: "neo-1".into(),
            endpoint: "http://neo-1:7474".into(),
            adapter_config: BTreeMap::new(),
        };
        let raw = serde_json::json!({
            "results": [{"columns": ["n"], "data": [
                {"row": [{"hexad_id": "hx-2", "name": "a"}]},
                {"row": [{"name": "b"}]}
            ]}],
            "errors": []
        });
        let results = adapter.translate_results(&raw, &peer);
        assert_eq!(results[0].hexad_id, "hx-2");
        assert_eq!(results[1].hexad_id, UNKNOWN_HEXAD_ID);
    }
}
