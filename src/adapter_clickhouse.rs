//! ClickHouse adapter: columnar scans over the HTTP interface with
//! `FORMAT JSON` output. The `ann` extension (an approximate-nearest-
//! neighbour index on the embedding column) unlocks vector ranking.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::adapter::{
    ensure_modalities_supported, extract_hexad_id, parse_extensions, FederationAdapter,
    HealthReport, NeutralQuery, NormalizedResult, PeerInfo, QueryOptions,
};
use crate::errors::AdapterError;
use crate::modality::Modality;

pub struct ClickHouseAdapter {
    client: reqwest::Client,
}

impl ClickHouseAdapter {
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

    fn build_sql(peer: &PeerInfo, query: &NeutralQuery) -> String {
        let mut clauses = Vec::new();
        for (field, value) in &query.filters {
            clauses.push(format!("{} = '{}'", field, value.replace('\'', "''")));
        }
        if let Some(range) = &query.temporal_range {
            clauses.push(format!(
                "toUnixTimestamp64Milli(recorded_at) BETWEEN {} AND {}",
                range.start, range.end
            ));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let order_clause = match &query.vector_query {
            Some(vector) if peer.extensions().contains("ann") => {
                let literal = vector
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                format!(" ORDER BY cosineDistance(embedding, [{}]) ASC", literal)
            }
            _ => String::new(),
        };
        format!(
            "SELECT * FROM {}{}{} LIMIT {} FORMAT JSON",
            Self::table(peer),
            where_clause,
            order_clause,
            query.limit
        )
    }

    async fn execute(
        &self,
        peer: &PeerInfo,
        sql: String,
        timeout_ms: u64,
    ) -> Result<(serde_json::Value, u64), AdapterError> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .post(peer.endpoint.trim_end_matches('/'))
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .body(sql)
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
}

#[async_trait]
impl FederationAdapter for ClickHouseAdapter {
    fn adapter_type(&self) -> &'static str {
        "clickhouse"
    }

    fn supported_modalities(&self, adapter_config: &BTreeMap<String, String>) -> BTreeSet<Modality> {
        let mut set = BTreeSet::from([Modality::Document, Modality::Temporal]);
        if parse_extensions(adapter_config).contains("ann") {
            set.insert(Modality::Vector);
        }
        set
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), AdapterError> {
        self.health_check(peer).await.map(|_| ())
    }

    async fn health_check(&self, peer: &PeerInfo) -> Result<HealthReport, AdapterError> {
        let url = format!("{}/ping", peer.endpoint.trim_end_matches('/'));
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
                "ping returned {}",
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
        let sql = Self::build_sql(peer, query);
        let (raw, latency_ms) = self.execute(peer, sql, opts.timeout_ms).await?;
        let mut results = self.translate_results(&raw, peer);
        for r in &mut results {
            r.response_time_ms = latency_ms;
        }
        Ok(results)
    }

    fn translate_results(&self, raw: &serde_json::Value, peer: &PeerInfo) -> Vec<NormalizedResult> {
        raw.get("data")
            .and_then(|rows| rows.as_array())
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
