//! CouchDB adapter: document retrieval via Mango `_find`, with revision
//! history doubling as a provenance trail.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;

use crate::adapter::{
    ensure_modalities_supported, extract_hexad_id, get_json, post_json, FederationAdapter,
    HealthReport, NeutralQuery, NormalizedResult, PeerInfo, QueryOptions,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct CouchDbAdapter {
    client: reqwest::Client,
}

impl CouchDbAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn database(peer: &PeerInfo) -> String {
        peer.adapter_config
            .get("database")
            .cloned()
            .unwrap_or_else(|| "hexads".to_string())
    }

    fn build_find_body(query: &NeutralQuery) -> serde_json::Value {
        let mut selector = serde_json::Map::new();
        for (field, value) in &query.filters {
            selector.insert(field.clone(), json!({"$eq": value}));
        }
        json!({
            "selector": serde_json::Value::Object(selector),
            "limit": query.limit
        })
    }
}

#[async_trait]
impl FederationAdapter for CouchDbAdapter {
    fn adapter_type(&self) -> &'static str {
        "couchdb"
    }

    fn supported_modalities(
        &self,
        _adapter_config: &BTreeMap<String, String>,
    ) -> BTreeSet<Modality> {
        BTreeSet::from([Modality::Document, Modality::Provenance])
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        let url = format!("{}/_up", peer.endpoint.trim_end_matches('/'));
        let (body, latency_ms) = get_json(&self.client, &url, 2_000).await?;
        let status = body
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string();
        if status != "ok" {
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
            "{}/{}/_find",
            peer.endpoint.trim_end_matches('/'),
            Self::database(peer)
        );
        let body = Self::build_find_body(query);
        let (raw, latency_ms) = post_json(&self.client, &url, &body, opts.timeout_ms).await?;
        let mut results = self.translate_results(&raw, peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        // Mango has no relevance scoring; every doc normalises at 0.0.
        raw.get("docs")
            .and_then(|docs| docs.as_array())
            .map(|docs| {
                docs.iter()
                    .map(|doc| NormalizedResult {
                        source_store: peer.store_id.clone(),
                        hexad_id: extract_hexad_id(doc, "_id"),
                        score: 0.0,
                        drifted: false,
                        data: doc.clone(),
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

    #[test]
    fn capability_is_fixed() {
        let adapter = CouchDbAdapter::new();
        let set = adapter.supported_modalities(&BTreeMap::new());
        assert_eq!(
            set,
            BTreeSet::from([Modality::Document, Modality::Provenance])
        );
    }

    #[test]
    fn find_body_uses_eq_selectors() {
        let mut query = NeutralQuery {
            limit: 5,
            ..Default::default()
        };
        query.filters.insert("owner".into(), "ops".into());
        let body = CouchDbAdapter::build_find_body(&query);
        assert_eq!(body["selector"]["owner"]["$eq"], "ops");
        assert_eq!(body["limit"], 5);
    }

    #[test]
    fn docs_normalise_from_mango_response() {
        let adapter = CouchDbAdapter::new();
        let peer = PeerInfo {
            store_id: "cc-1".into(),
            endpoint: "http://cc-1:5984".into(),
            adapter_config: BTreeMap::new(),
        };
        let raw = serde_json::json!({
            "docs": [{"_id": "hx-3", "_rev": "2-abc", "body": "x"}]
        });
        let results = adapter.translate_results(&raw, &peer);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].hexad_id, "hx-3");
        assert_eq!(results[0].score, 0.0);
        assert_eq!(results[0].source_store, "cc-1");
    }
}
