//! Elasticsearch adapter: document, semantic and spatial search over the
//! `_search` API.
//!
//! Base capability is {document, semantic, spatial}; `vector` is gated on
//! the `vector` extension flag (a `dense_vector` mapping on the index).
//! The neutral query translates to a bool query: `text_query` becomes a
//! `multi_match`, `filters` become `term` clauses, `spatial_bounds` becomes
//! a `geo_bounding_box` filter and `vector_query` becomes a script-score
//! clause when the extension is declared.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;

use crate::adapter::{
    ensure_modalities_supported, extract_hexad_id, get_json, parse_extensions, post_json,
    FederationAdapter, HealthReport, NeutralQuery, NormalizedResult, PeerInfo, QueryOptions,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct ElasticsearchAdapter {
    client: reqwest::Client,
}

impl ElasticsearchAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn index(peer: &PeerInfo) -> String {
        peer.adapter_config
            .get("index")
            .cloned()
            .unwrap_or_else(|| "hexads".to_string())
    }

    fn build_search_body(&self, peer: &PeerInfo, query: &NeutralQuery) -> serde_json::Value {
        let mut must = Vec::new();
        let mut filter = Vec::new();

        if let Some(text) = &query.text_query {
            must.push(json!({"multi_match": {"query": text, "fields": ["*"]}}));
        }
        for (field, value) in &query.filters {
            filter.push(json!({"term": {field.clone(): value.clone()}}));
        }
        if let Some(bounds) = &query.spatial_bounds {
            filter.push(json!({
                "geo_bounding_box": {
                    "location": {
                        "top_left": {"lat": bounds.max_lat, "lon": bounds.min_lon},
                        "bottom_right": {"lat": bounds.min_lat, "lon": bounds.max_lon}
                    }
                }
            }));
        }
        if let Some(range) = &query.temporal_range {
            filter.push(json!({
                "range": {"timestamp": {"gte": range.start, "lte": range.end}}
            }));
        }

        let must = if must.is_empty() {
            vec![json!({"match_all": {}})]
        } else {
            must
        };
        let base_query = json!({"bool": {"must": must, "filter": filter}});

        match &query.vector_query {
            Some(vector) if peer.extensions().contains("vector") => json!({
                "size": query.limit,
                "query": {
                    "script_score": {
                        "query": base_query,
                        "script": {
                            "source": "cosineSimilarity(params.query_vector, 'embedding') + 1.0",
                            "params": {"query_vector": vector}
                        }
                    }
                }
            }),
            _ => json!({"size": query.limit, "query": base_query}),
        }
    }
}

#[async_trait]
impl FederationAdapter for ElasticsearchAdapter {
    fn adapter_type(&self) -> &'static str {
        "elasticsearch"
    }

    fn supported_modalities(&self, adapter_config: &BTreeMap<String, String>) -> BTreeSet<Modality> {
        let mut set = BTreeSet::from([Modality::Document, Modality::Semantic, Modality::Spatial]);
        if parse_extensions(adapter_config).contains("vector") {
            set.insert(Modality::Vector);
        }
        set
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        let url = format!("{}/_cluster/health", peer.endpoint.trim_end_matches('/'));
        let (body, latency_ms) = get_json(&self.client, &url, 2_000).await?;
        let status = body
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string();
        if status == "red" {
            return Err(AdapterError::Unhealthy(status));
        }
        Ok(HealthReport { status, latency_ms })
    }

    async fn query(
        &self,
        peer: &PeerInfo,
        query: &NeutralQuery,
        opts: &QueryOptions,
    ) -> Result<Vec<NormalizedResult>, AdapterError> {
        ensure_modalities_supported(&self.supported_modalities(&peer.adapter_config), query)?;
        let url = format!(
            "{}/{}/_search",
            peer.endpoint.trim_end_matches('/'),
            Self::index(peer)
        );
        let body = self.build_search_body(peer, query);
        let (raw, latency_ms) = post_json(&self.client, &url, &body, opts.timeout_ms).await?;
        let mut results = self.translate_results(&raw, peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        raw.pointer("/hits/hits")
            .and_then(|hits| hits.as_array())
            .map(|hits| {
                hits.iter()
                    .map(|hit| {
                        let source = hit.get("_source").cloned().unwrap_or(serde_json::Value::Null);
                        let hexad_id = source
                            .get("hexad_id")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| extract_hexad_id(hit, "_id"));
                        NormalizedResult {
                            source_store: peer.store_id.clone(),
                            hexad_id,
                            score: hit.get("_score").and_then(|s| s.as_f64()).unwrap_or(0.0),
                            drifted: false,
                            data: source,
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

    fn peer(extensions: &str) -> PeerInfo {
        let mut config = BTreeMap::new();
        if !extensions.is_empty() {
            config.insert("extensions".to_string(), extensions.to_string());
        }
        PeerInfo {
            store_id: "es-1".into(),
            endpoint: "http://es-1:9200".into(),
            adapter_config: config,
        }
    }

    #[test]
    fn base_capability_excludes_vector() {
        let adapter = ElasticsearchAdapter::new();
        let set = adapter.supported_modalities(&peer("").adapter_config);
        assert!(set.contains(&Modality::Document));
        assert!(set.contains(&Modality::Semantic));
        assert!(set.contains(&Modality::Spatial));
        assert!(!set.contains(&Modality::Vector));
    }

    #[test]
    fn vector_extension_unlocks_vector() {
        let adapter = ElasticsearchAdapter::new();
        let set = adapter.supported_modalities(&peer("vector").adapter_config);
        assert!(set.contains(&Modality::Vector));
    }

    #[test]
    fn translate_results_normalises_hits() {
        let adapter = ElasticsearchAdapter::new();
        let raw = serde_json::json!({
            "hits": {"hits": [
                {"_id": "doc-1", "_score": 2.5, "_source": {"hexad_id": "hx-1", "title": "a"}},
                {"_id": "doc-2", "_score": null, "_source": {"title": "b"}}
            ]}
        });
        let results = adapter.translate_results(&raw, &peer(""));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].hexad_id, "hx-1");
        assert_eq!(results[0].score, 2.5);
        assert_eq!(results[0].source_store, "es-1");
        // No _source hexad_id: fall back to the document id; no score: 0.0.
        assert_eq!(results[1].hexad_id, "doc-2");
        assert_eq!(results[1].score, 0.0);
    }

    #[test]
    fn translate_results_of_garbage_is_empty() {
        let adapter = ElasticsearchAdapter::new();
        let results = adapter.translate_results(&serde_json::json!({"took": 3}), &peer(""));
        assert!(results.is_empty());
    }

    #[test]
    fn search_body_carries_limit_and_filters() {
        let adapter = ElasticsearchAdapter::new();
        let mut query = NeutralQuery {
            text_query: Some("tides".into()),
            limit: 25,
            ..Default::default()
        };
        query.filters.insert("kind".into(), "buoy".into());
        let body = adapter.build_search_body(&peer(""), &query);
        assert_eq!(body["size"], 25);
        assert_eq!(
            body["query"]["bool"]["must"][0]["multi_match"]["query"],
            "tides"
        );
        assert_eq!(body["query"]["bool"]["filter"][0]["term"]["kind"], "buoy");
    }
}
