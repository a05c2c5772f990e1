//! The replicated registry: peer stores and hexad-to-store mappings.
//!
//! The registry is the state machine behind the Raft log. Mutations follow a
//! two-phase discipline:
//!
//! 1. **`validate`** runs synchronously on the proposing leader, against its
//!    current committed state. Invalid commands are rejected before anything
//!    reaches the log.
//! 2. **`apply`** runs on every node after commit, in index order. It is a
//!    total, deterministic function — a command whose referent disappeared
//!    between validation and apply (an interleaved `unregister_store`, say)
//!    degrades to a logged no-op rather than diverging or failing, so every
//!    node folds the same log into the same registry.
//!
//! Only replicated fields live here. Health signals (`last_seen`,
//! `response_time_ms`) are per-node volatile state owned by the health
//! prober and are neither replicated nor snapshotted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterRegistry, PeerInfo};
use crate::command::Command;
use crate::errors::RegistryError;
use crate::modality::Modality;

// ── Replicated records ────────────────────────────────────────────────────────

/// A registered peer store. `modalities` is the *effective* set: the
/// declared set clipped to what the adapter family supports given this
/// instance's config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub store_id: String,
    pub endpoint: String,
    pub adapter_type: String,
    #[serde(default)]
    pub adapter_config: BTreeMap<String, String>,
    pub modalities: BTreeSet<Modality>,
    pub trust_level: f64,
}

impl StoreInfo {
    /// The slice adapters need to reach this store's backend.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            store_id: self.store_id.clone(),
            endpoint: self.endpoint.clone(),
            adapter_config: self.adapter_config.clone(),
        }
    }
}

/// Where a hexad lives. Created by `map_hexad`, removed by `unmap_hexad`;
/// never silently overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HexadMapping {
    pub hexad_id: String,
    pub locations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_store: Option<String>,
    /// Entry timestamp of the creating command (epoch ms).
    pub created: u64,
    /// Entry timestamp of the last command that touched this mapping.
    pub modified: u64,
}

/// Outcome of applying one committed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The command validated when proposed but its referent no longer
    /// exists; state is unchanged.
    Skipped(&'static str),
}

// ── The registry ──────────────────────────────────────────────────────────────

/// Replicated view of the federation: which backends exist and which hexads
/// live where. `BTreeMap` keeps snapshot serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub stores: BTreeMap<String, StoreInfo>,
    pub hexads: BTreeMap<String, HexadMapping>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Validation (pre-append) ───────────────────────────────────────────────

    /// Check a command against current state and the adapter registry.
    /// Runs on the proposing leader before the entry is appended; invalid
    /// commands never reach the log.
    pub fn validate(
        &self,
        command: &Command,
        adapters: &AdapterRegistry,
    ) -> Result<(), RegistryError> {
        match command {
            Command::RegisterStore {
                store_id,
                adapter_type,
                ..
            } => {
                if !adapters.contains(adapter_type) {
                    return Err(RegistryError::UnknownAdapter(adapter_type.clone()));
                }
                // Overwrite is allowed for endpoint/config/modality refresh,
                // but a store cannot change family without unregistering.
                if let Some(existing) = self.stores.get(store_id) {
                    if existing.adapter_type != *adapter_type {
                        return Err(RegistryError::DuplicateStore(store_id.clone()));
                    }
                }
                Ok(())
            }
            Command::UnregisterStore { store_id } => {
                if !self.stores.contains_key(store_id) {
                    return Err(RegistryError::UnknownStore(store_id.clone()));
                }
                Ok(())
            }
            Command::MapHexad {
                hexad_id,
                locations,
                primary_store,
            } => {
                if locations.is_empty() {
                    return Err(RegistryError::EmptyLocations);
                }
                if self.hexads.contains_key(hexad_id) {
                    return Err(RegistryError::DuplicateHexad(hexad_id.clone()));
                }
                for store_id in locations {
                    if !self.stores.contains_key(store_id) {
                        return Err(RegistryError::UnknownStore(store_id.clone()));
                    }
                }
                if let Some(primary) = primary_store {
                    if !locations.contains(primary) {
                        return Err(RegistryError::UnknownStore(primary.clone()));
                    }
                }
                Ok(())
            }
            Command::UnmapHexad { hexad_id } => {
                if !self.hexads.contains_key(hexad_id) {
                    return Err(RegistryError::UnknownHexad(hexad_id.clone()));
                }
                Ok(())
            }
            Command::UpdateTrust {
                store_id,
                trust_level,
            } => {
                if !self.stores.contains_key(store_id) {
                    return Err(RegistryError::UnknownStore(store_id.clone()));
                }
                // Rejected rather than clamped: replicating a value the
                // proposer never asked for would hide caller bugs.
                if !trust_level.is_finite() || *trust_level < 0.0 || *trust_level > 1.0 {
                    return Err(RegistryError::TrustOutOfRange(*trust_level));
                }
                Ok(())
            }
            Command::Noop => Ok(()),
        }
    }

    // ── Apply (post-commit) ───────────────────────────────────────────────────

    /// Fold one committed command into the registry. Total and
    /// deterministic: the same log always produces the same registry on
    /// every node.
    pub fn apply(
        &mut self,
        command: &Command,
        timestamp_ms: u64,
        adapters: &AdapterRegistry,
    ) -> ApplyOutcome {
        match command {
            Command::RegisterStore {
                store_id,
                endpoint,
                adapter_type,
                adapter_config,
                modalities,
            } => {
                let supported = match adapters.supported_modalities(adapter_type, adapter_config) {
                    Ok(set) => set,
                    Err(_) => {
                        // A log written by a binary with more adapter
                        // families than this one; keep the fold total.
                        tracing::warn!(
                            store_id = %store_id,
                            adapter_type = %adapter_type,
                            "Adapter family not compiled in; skipping register_store"
                        );
                        return ApplyOutcome::Skipped("unknown_adapter");
                    }
                };
                let effective: BTreeSet<Modality> = modalities
                    .iter()
                    .copied()
                    .filter(|m| supported.contains(m))
                    .collect();
                let trust_level = self
                    .stores
                    .get(store_id)
                    .map(|existing| existing.trust_level)
                    .unwrap_or(1.0);
                self.stores.insert(
                    store_id.clone(),
                    StoreInfo {
                        store_id: store_id.clone(),
                        endpoint: endpoint.clone(),
                        adapter_type: adapter_type.clone(),
                        adapter_config: adapter_config.clone(),
                        modalities: effective,
                        trust_level,
                    },
                );
                ApplyOutcome::Applied
            }
            Command::UnregisterStore { store_id } => {
                if self.stores.remove(store_id).is_none() {
                    return ApplyOutcome::Skipped("unknown_store");
                }
                ApplyOutcome::Applied
            }
            Command::MapHexad {
                hexad_id,
                locations,
                primary_store,
            } => {
                if self.hexads.contains_key(hexad_id) {
                    return ApplyOutcome::Skipped("duplicate_hexad");
                }
                if locations.iter().any(|s| !self.stores.contains_key(s)) {
                    return ApplyOutcome::Skipped("unknown_store");
                }
                self.hexads.insert(
                    hexad_id.clone(),
                    HexadMapping {
                        hexad_id: hexad_id.clone(),
                        locations: locations.clone(),
                        primary_store: primary_store.clone(),
                        created: timestamp_ms,
                        modified: timestamp_ms,
                    },
                );
                ApplyOutcome::Applied
            }
            Command::UnmapHexad { hexad_id } => {
                if self.hexads.remove(hexad_id).is_none() {
                    return ApplyOutcome::Skipped("unknown_hexad");
                }
                ApplyOutcome::Applied
            }
            Command::UpdateTrust {
                store_id,
                trust_level,
            } => match self.stores.get_mut(store_id) {
                Some(store) => {
                    store.trust_level = *trust_level;
                    ApplyOutcome::Applied
                }
                None => ApplyOutcome::Skipped("unknown_store"),
            },
            Command::Noop => ApplyOutcome::Applied,
        }
    }

    // ── Read-side helpers ─────────────────────────────────────────────────────

    /// Stores that hold one or more modalities of the given hexad.
    pub fn locations_of(&self, hexad_id: &str) -> Option<&HexadMapping> {
        self.hexads.get(hexad_id)
    }

    pub fn store(&self, store_id: &str) -> Option<&StoreInfo> {
        self.stores.get(store_id)
    }
}
