//! PostgreSQL adapter, speaking a PostgREST-style HTTP gateway.
//!
//! Base capability is {document, temporal}. Extensions unlock more:
//! `pgvector` adds vector similarity, `postgis` adds spatial bounding-box
//! filters. A plain instance registered with a wider declared set is
//! clipped down to the base at registration time.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::adapter::{
    ensure_modalities_supported, extract_hexad_id, get_json, parse_extensions, FederationAdapter,
    HealthReport, NeutralQuery, NormalizedResult, PeerInfo, QueryOptions,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct PostgresqlAdapter {
    client: reqwest::Client,
}

impl PostgresqlAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn table(peer: &PeerInfo) -> String {
        peer.adapter_config
            .get("table")
            .cloned()
            .unwrap_or_else(|| "hexads".to_string())
    }

    /// Build the PostgREST query string: equality filters, a temporal
    /// window on `recorded_at`, and a row limit.
    fn build_query_string(query: &NeutralQuery) -> String {
        let mut params: Vec<String> = query
            .filters
            .iter()
            .map(|(k, v)| format!("{}=eq.{}", k, v))
            .collect();
        if let Some(range) = &query.temporal_range {
            params.push(format!("recorded_at=gte.{}", range.start));
            params.push(format!("recorded_at=lte.{}", range.end));
        }
        params.push(format!("limit={}", query.limit));
        params.join("&")
    }
}

#[async_trait]
impl FederationAdapter for PostgresqlAdapter {
    fn adapter_type(&self) -> &'static str {
        "postgresql"
    }

    fn supported_modalities(&self, adapter_config: &BTreeMap<String, String>) -> BTreeSet<Modality> {
        let mut set = BTreeSet::from([Modality::Document, Modality::Temporal]);
        let extensions = parse_extensions(adapter_config);
        if extensions.contains("pgvector") {
            set.insert(Modality::Vector);
        }
        if extensions.contains("postgis") {
            set.insert(Modality::Spatial);
        }
        set
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        // The gateway root returns the OpenAPI description; reachable and
        // decodable means healthy.
        let url = format!("{}/", peer.endpoint.trim_end_matches('/'));
        let (_, latency_ms) = get_json(&self.client, &url, 2_000).await?;
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
            "{}/{}?{}",
            peer.endpoint.trim_end_matches('/'),
            Self::table(peer),
            Self::build_query_string(query)
        );
        let (raw, latency_ms) = get_json(&self.client, &url, opts.timeout_ms).await?;
        let mut results = self.translate_results(&raw, peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        // PostgREST returns a bare JSON array of rows; rows carry no score.
        raw.as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| NormalizedResult {
                        source_store: peer.store_id.clone(),
                        hexad_id: extract_hexad_id(row, "id"),
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

    fn config(extensions: &str) -> BTreeMap<String, String> {
        let mut config = BTreeMap::new();
        if !extensions.is_empty() {
            config.insert("extensions".to_string(), extensions.to_string());
        }
        config
    }

    #[test]
    fn bare_instance_supports_document_and_temporal_only() {
        let adapter = PostgresqlAdapter::new();
        let set = adapter.supported_modalities(&config(""));
        assert_eq!(set, BTreeSet::from([Modality::Document, Modality::Temporal]));
    }

    #[test]
    fn extensions_unlock_vector_and_spatial() {
        let adapter = PostgresqlAdapter::new();
        let set = adapter.supported_modalities(&config("pgvector,postgis"));
        assert!(set.contains(&Modality::Vector));
        assert!(set.contains(&Modality::Spatial));
        assert!(!set.contains(&Modality::Tensor), "tensor is never served");
    }

    #[test]
    fn query_string_includes_filters_window_and_limit() {
        let mut query = NeutralQuery {
            limit: 10,
            ..Default::default()
        };
        query.filters.insert("region".into(), "eu".into());
        query.temporal_range = Some(crate::adapter::TemporalRange {
            start: 100,
            end: 200,
        });
        let qs = PostgresqlAdapter::build_query_string(&query);
        assert!(qs.contains("region=eq.eu"));
        assert!(qs.contains("recorded_at=gte.100"));
        assert!(qs.contains("recorded_at=lte.200"));
        assert!(qs.contains("limit=10"));
    }

    #[test]
    fn rows_normalise_with_zero_score() {
        let adapter = PostgresqlAdapter::new();
        let peer = PeerInfo {
            store_id: "pg-1".into(),
            endpoint: "http://pg-1:3000".into(),
            adapter_config: config(""),
        };
        let raw = serde_json::json!([
            {"id": "row-1", "hexad_id": "hx-7", "value": 3},
            {"id": "row-2"}
        ]);
        let results = adapter.translate_results(&raw, &peer);
        assert_eq!(results[0].hexad_id, "hx-7");
        assert_eq!(results[1].hexad_id, "row-2");
        assert!(results.iter().all(|r| r.score == 0.0));
    }
}
