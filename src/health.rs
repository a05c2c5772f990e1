//! Background health probing of registered backends.
//!
//! Probes walk the applied registry on an interval and run each store's
//! adapter `health_check`. Results land in a per-node volatile signal map:
//! `last_seen` and `response_time_ms` are observation state, never
//! replicated and never snapshotted, and are rebuilt from live probes after
//! a recovery. Probe failures log a structured warning and leave the
//! replicated registry untouched — demoting an unhealthy store is an
//! operator decision made through `update_trust` or `unregister_store`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::adapter::AdapterRegistry;
use crate::command::now_ms;
use crate::metrics::HEALTH_PROBE_FAILURES_TOTAL;
use crate::registry::Registry;

/// Latest observation for one store.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSignal {
    pub healthy: bool,
    pub status: String,
    /// Wall-clock of the last successful probe (epoch ms).
    pub last_seen: Option<u64>,
    /// Rolling probe latency; the latest observation wins.
    pub response_time_ms: Option<u64>,
}

/// Shared, read-mostly signal map. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct HealthSignals {
    inner: Arc<RwLock<HashMap<String, HealthSignal>>>,
}

impl HealthSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, store_id: &str) -> Option<HealthSignal> {
        self.inner
            .read()
            .expect("health signal lock poisoned")
            .get(store_id)
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, HealthSignal> {
        self.inner
            .read()
            .expect("health signal lock poisoned")
            .clone()
    }

    fn record(&self, store_id: &str, signal: HealthSignal) {
        self.inner
            .write()
            .expect("health signal lock poisoned")
            .insert(store_id.to_string(), signal);
    }

    /// Drop signals for stores that left the registry.
    fn retain_known(&self, registry: &Registry) {
        self.inner
            .write()
            .expect("health signal lock poisoned")
            .retain(|store_id, _| registry.stores.contains_key(store_id));
    }
}

/// Probe loop for one node. Runs until the registry watch closes.
pub struct HealthMonitor {
    registry_rx: watch::Receiver<Registry>,
    adapters: Arc<AdapterRegistry>,
    signals: HealthSignals,
    interval_ms: u64,
}

impl HealthMonitor {
    pub fn new(
        registry_rx: watch::Receiver<Registry>,
        adapters: Arc<AdapterRegistry>,
        interval_ms: u64,
    ) -> Self {
        Self {
            registry_rx,
            adapters,
            signals: HealthSignals::new(),
            interval_ms,
        }
    }

    /// Handle to the signal map, for diagnostics surfaces.
    pub fn signals(&self) -> HealthSignals {
        self.signals.clone()
    }

    pub async fn run(self) {
        let mut ticker = time::interval(Duration::from_millis(self.interval_ms));
        // A slow probe round should not queue a burst of catch-up rounds.
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.registry_rx.has_changed().is_err() {
                // The node is gone; stop probing.
                return;
            }
            let registry = self.registry_rx.borrow().clone();
            self.signals.retain_known(&registry);
            self.probe_round(&registry).await;
        }
    }

    async fn probe_round(&self, registry: &Registry) {
        for store in registry.stores.values() {
            let adapter = match self.adapters.get(&store.adapter_type) {
                Ok(adapter) => adapter,
                Err(_) => continue,
            };
            let peer = store.peer_info();
            match adapter.health_check(&peer).await {
                Ok(report) => {
                    debug!(
                        store_id = %store.store_id,
                        status = %report.status,
                        latency_ms = report.latency_ms,
                        "Backend healthy"
                    );
                    self.signals.record(
                        &store.store_id,
                        HealthSignal {
                            healthy: true,
                            status: report.status,
                            last_seen: Some(now_ms()),
                            response_time_ms: Some(report.latency_ms),
                        },
                    );
                }
                Err(e) => {
                    HEALTH_PROBE_FAILURES_TOTAL
                        .with_label_values(&[store.adapter_type.as_str()])
                        .inc();
                    warn!(
                        store_id = %store.store_id,
                        adapter = %store.adapter_type,
                        error = %e,
                        "Backend probe failed"
                    );
                    let previous = self.signals.get(&store.store_id);
                    self.signals.record(
                        &store.store_id,
                        HealthSignal {
                            healthy: false,
                            status: e.kind().to_string(),
                            // Keep the last successful sighting.
                            last_seen: previous.and_then(|p| p.last_seen),
                            response_time_ms: None,
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_record_and_snapshot() {
        let signals = HealthSignals::new();
        signals.record(
            "es-1",
            HealthSignal {
                healthy: true,
                status: "green".into(),
                last_seen: Some(1_000),
                response_time_ms: Some(12),
            },
        );
        assert!(signals.get("es-1").unwrap().healthy);
        assert_eq!(signals.snapshot().len(), 1);
        assert!(signals.get("ghost").is_none());
    }

    #[test]
    fn retain_known_drops_departed_stores() {
        let signals = HealthSignals::new();
        signals.record(
            "gone-1",
            HealthSignal {
                healthy: true,
                status: "ok".into(),
                last_seen: None,
                response_time_ms: None,
            },
        );
        signals.retain_known(&Registry::new());
        assert!(signals.get("gone-1").is_none());
    }
}
