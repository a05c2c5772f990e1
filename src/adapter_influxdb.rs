//! InfluxDB adapter: temporal windows over the v1 JSON query API.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::adapter::{
    ensure_modalities_supported, get_json, FederationAdapter, HealthReport, NeutralQuery,
    NormalizedResult, PeerInfo, QueryOptions, UNKNOWN_HEXAD_ID,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct InfluxDbAdapter {
    client: reqwest::Client,
}

impl InfluxDbAdapter {
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

    fn measurement(peer: &PeerInfo) -> String {
        peer.adapter_config
            .get("measurement")
            .cloned()
            .unwrap_or_else(|| "observations".to_string())
    }

    fn build_influxql(peer: &PeerInfo, query: &NeutralQuery) -> String {
        let mut clauses = Vec::new();
        if let Some(range) = &query.temporal_range {
            clauses.push(format!(
                "time >= {}ms AND time <= {}ms",
                range.start, range.end
            ));
        }
        for (tag, value) in &query.filters {
            clauses.push(format!("\"{}\" = '{}'", tag, value.replace('\'', "\\'")));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        format!(
            "SELECT * FROM \"{}\"{} LIMIT {}",
            Self::measurement(peer),
            where_clause,
            query.limit
        )
    }
}

#[async_trait]
impl FederationAdapter for InfluxDbAdapter {
    fn adapter_type(&self) -> &'static str {
        "influxdb"
    }

    fn supported_modalities(
        &self,
        _adapter_config: &BTreeMap<String, String>,
    ) -> BTreeSet<Modality> {
        BTreeSet::from([Modality::Temporal])
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        let url = format!("{}/health", peer.endpoint.trim_end_matches('/'));
        let (body, latency_ms) = get_json(&self.client, &url, 2_000).await?;
        let status = body
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string();
        if status != "pass" && status != "ok" {
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
        let influxql = Self::build_influxql(peer, query);
        let url = format!(
            "{}/query?db={}&q={}",
            peer.endpoint.trim_end_matches('/'),
            Self::database(peer),
            urlencode(&influxql)
        );
        let (raw, latency_ms) = get_json(&self.client, &url, opts.timeout_ms).await?;
        let mut results = self.translate_results(&raw, peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    /// Series rows arrive as positional arrays; zip them with the column
    /// names into objects so downstream consumers see uniform shapes.
    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        let mut results = Vec::new();
        let series = match raw.pointer("/results/0/series").and_then(|s| s.as_array()) {
            Some(series) => series,
            None => return results,
        };
        for serie in series {
            let columns: Vec<&str> = serie
                .get("columns")
                .and_then(|c| c.as_array())
                .map(|cols| cols.iter().filter_map(|c| c.as_str()).collect())
                .unwrap_or_default();
            let values = match serie.get("values").and_then(|v| v.as_array()) {
                Some(values) => values,
                None => continue,
            };
            for row in values {
                let cells = match row.as_array() {
                    Some(cells) => cells,
                    None => continue,
                };
                let mut object = serde_json::Map::new();
                for (column, cell) in columns.iter().zip(cells) {
                    object.insert(column.to_string(), cell.clone());
                }
                let hexad_id = object
                    .get("hexad_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(UNKNOWN_HEXAD_ID)
                    .to_string();
                results.push(NormalizedResult {
                    source_store: peer.store_id.clone(),
                    hexad_id,
                    score: 0.0,
                    drifted: false,
                    data: serde_json::Value::Object(object),
                    response_time_ms: 0,
                });
            }
        }
        results
    }
}

/// Percent-encode the querystring characters InfluxQL actually produces.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            ' ' => out.push_str("%20"),
            '"' => out.push_str("%22"),
            '\'' => out.push_str("%27"),
            '=' => out.push_str("%3D"),
            '&' => out.push_str("%26"),
            '+' => out.push_str("%2B"),
            '#' => out.push_str("%23"),
            _ => out.push(ch),
        }
    }
    out
}
