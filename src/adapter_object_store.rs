//! S3-compatible object store adapter (MinIO and friends).
//!
//! Objects hold tensor blobs, raw documents and provenance bundles keyed by
//! hexad id. Queries are prefix listings: the bucket listing XML is scanned
//! for `<Key>` elements and each key's basename becomes the hexad id. No
//! scoring, no payload fetch — the resolver's caller follows up with a
//! direct object GET when it wants bytes.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;

use crate::adapter::{
    ensure_modalities_supported, FederationAdapter, HealthReport, NeutralQuery, NormalizedResult,
    PeerInfo, QueryOptions, UNKNOWN_HEXAD_ID,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct ObjectStoreAdapter {
    client: reqwest::Client,
}

impl ObjectStoreAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn bucket(peer: &PeerInfo) -> String {
        peer.adapter_config
            .get("bucket")
            .cloned()
            .unwrap_or_else(|| "hexads".to_string())
    }

    /// Pull every `<Key>` value out of a ListObjectsV2 response. A tolerant
    /// scan rather than a full XML parse: keys cannot contain the `<`
    /// delimiter, so this is unambiguous for well-formed listings.
    fn extract_keys(listing: &str) -> Vec<String> {
        let mut keys = Vec::new();
        let mut rest = listing;
        while let Some(start) = rest.find("<Key>") {
            rest = &rest[start + 5..];
            match rest.find("</Key>") {
                Some(end) => {
                    keys.push(rest[..end].to_string());
                    rest = &rest[end + 6..];
                }
                None => break,
            }
        }
        keys
    }

    /// `tensors/hx-42.bin` → `hx-42`
    fn hexad_id_from_key(key: &str) -> String {
        let basename = key.rsplit('/').next().unwrap_or(key);
        let stem = basename.split('.').next().unwrap_or(basename);
        if stem.is_empty() {
            UNKNOWN_HEXAD_ID.to_string()
        } else {
            stem.to_string()
        }
    }
}

#[async_trait]
impl FederationAdapter for ObjectStoreAdapter {
    fn adapter_type(&self) -> &'static str {
        "object_store"
    }

    fn supported_modalities(
        &self,
        _adapter_config: &BTreeMap<String, String>,
    ) -> BTreeSet<Modality> {
        BTreeSet::from([Modality::Document, Modality::Tensor, Modality::Provenance])
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        let url = format!(
            "{}/minio/health/live",
            peer.endpoint.trim_end_matches('/')
        );
        let started = std::time::Instant::now();
        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_millis(2_000))
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;
        let latency_ms = started.elapsed().as_millis() as u64;
        if !response.status().is_success() {
            return Err(AdapterError::Unhealthy(format!(
                "liveness returned {}",
                response.status().as_u16()
            )));
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
        let prefix = query.filters.get("prefix").cloned().unwrap_or_default();
        let url = format!(
            "{}/{}?list-type=2&prefix={}&max-keys={}",
            peer.endpoint.trim_end_matches('/'),
            Self::bucket(peer),
            prefix,
            query.limit
        );
        let started = std::time::Instant::now();
        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_millis(opts.timeout_ms))
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
        let listing = response
            .text()
            .await
            .map_err(|e| AdapterError::DecodeError(e.to_string()))?;

        let mut results = self.translate_results(&json!(listing), peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        let listing = match raw.as_str() {
            Some(listing) => listing,
            None => return Vec::new(),
        };
        Self::extract_keys(listing)
            .into_iter()
            .map(|key| NormalizedResult {
                source_store: peer.store_id.clone(),
                hexad_id: Self::hexad_id_from_key(&key),
                score: 0.0,
                drifted: false,
                data: json!({"key": key}),
                response_time_ms: 0,
            })
            .collect()
    }
}
