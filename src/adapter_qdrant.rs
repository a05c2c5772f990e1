//! Qdrant adapter: vector similarity over the points-search API, with an
//! optional `geo` extension for payload bounding-box filters.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;

use crate::adapter::{
    ensure_modalities_supported, get_json, parse_extensions, post_json, FederationAdapter,
    HealthReport, NeutralQuery, NormalizedResult, PeerInfo, QueryOptions, UNKNOWN_HEXAD_ID,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct QdrantAdapter {
    client: reqwest::Client,
}

impl QdrantAdapter {
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

    fn build_search_body(peer: &PeerInfo, query: &NeutralQuery) -> serde_json::Value {
        let mut must = Vec::new();
        for (field, value) in &query.filters {
            must.push(json!({"key": field, "match": {"value": value}}));
        }
        if let Some(bounds) = &query.spatial_bounds {
            if peer.extensions().contains("geo") {
                must.push(json!({
                    "key": "location",
                    "geo_bounding_box": {
                        "top_left": {"lat": bounds.max_lat, "lon": bounds.min_lon},
                        "bottom_right": {"lat": bounds.min_lat, "lon": bounds.max_lon}
                    }
                }));
            }
        }
        json!({
            "vector": query.vector_query.clone().unwrap_or_default(),
            "filter": {"must": must},
            "limit": query.limit,
            "with_payload": true
        })
    }
}

#[async_trait]
impl FederationAdapter for QdrantAdapter {
    fn adapter_type(&self) -> &'static str {
        "qdrant"
    }

    fn supported_modalities(&self, adapter_config: &BTreeMap<String, String>) -> BTreeSet<Modality> {
        let mut set = BTreeSet::from([Modality::Vector]);
        if parse_extensions(adapter_config).contains("geo") {
            set.insert(Modality::Spatial);
        }
        set
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        let url = format!("{}/", peer.endpoint.trim_end_matches('/'));
        let (body, latency_ms) = get_json(&self.client, &url, 2_000).await?;
        match body.get("title").and_then(|t| t.as_str()) {
            Some(title) if title.contains("qdrant") => Ok(HealthReport {
                status: "ok".into(),
                latency_ms,
            }),
            other => Err(AdapterError::Unhealthy(format!(
                "unexpected service identity: {:?}",
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
        if query.vector_query.is_none() {
            return Err(AdapterError::UnsupportedModality(
                "vector query payload is required".into(),
            ));
        }
        let url = format!(
            "{}/collections/{}/points/search",
            peer.endpoint.trim_end_matches('/'),
            Self::collection(peer)
        );
        let body = Self::build_search_body(peer, query);
        let (raw, latency_ms) = post_json(&self.client, &url, &body, opts.timeout_ms).await?;
        let mut results = self.translate_results(&raw, peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        raw.get("result")
            .and_then(|points| points.as_array())
            .map(|points| {
                points
                    .iter()
                    .map(|point| {
                        let payload = point
                            .get("payload")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        let hexad_id = payload
                            .get("hexad_id")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| {
                                // Point ids may be numeric; stringify them.
                                match point.get("id") {
                                    Some(serde_json::Value::String(s)) => s.clone(),
                                    Some(serde_json::Value::Number(n)) => n.to_string(),
                                    _ => UNKNOWN_HEXAD_ID.to_string(),
                                }
                            });
                        NormalizedResult {
                            source_store: peer.store_id.clone(),
                            hexad_id,
                            score: point.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
                            drifted: false,
                            data: payload,
                            response_time_ms: 0,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
