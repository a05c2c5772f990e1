//! Replicated commands and log entry framing.
//!
//! A `Command` is the input alphabet of the registry state machine. Commands
//! are serialized with an explicit `type` tag so schema evolution stays
//! additive: a log written by a newer binary replays on an older one (and
//! vice versa) because unknown tags decode as `Noop` while still consuming
//! their index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::modality::Modality;

/// A registry mutation, replicated through the Raft log.
///
/// Field maps are `BTreeMap` so serialization is deterministic by key —
/// the round-trip `serialize → deserialize → serialize` is byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    RegisterStore {
        store_id: String,
        endpoint: String,
        adapter_type: String,
        #[serde(default)]
        adapter_config: BTreeMap<String, String>,
        modalities: Vec<Modality>,
    },
    UnregisterStore {
        store_id: String,
    },
    MapHexad {
        hexad_id: String,
        locations: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primary_store: Option<String>,
    },
    UnmapHexad {
        hexad_id: String,
    },
    UpdateTrust {
        store_id: String,
        trust_level: f64,
    },
    Noop,
}

impl Command {
    /// The wire tag, used in log fields and metrics labels.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::RegisterStore { .. } => "register_store",
            Command::UnregisterStore { .. } => "unregister_store",
            Command::MapHexad { .. } => "map_hexad",
            Command::UnmapHexad { .. } => "unmap_hexad",
            Command::UpdateTrust { .. } => "update_trust",
            Command::Noop => "noop",
        }
    }

    /// Decode a command from its JSON value, degrading unknown or malformed
    /// tags to `Noop`.
    ///
    /// Applied commands must be pure functions of the registry; `Noop`
    /// satisfies that trivially, so a log written by a different binary
    /// version replays safely — the entry keeps its index, it just stops
    /// mutating state.
    pub fn from_value_lenient(value: serde_json::Value) -> Command {
        match serde_json::from_value::<Command>(value.clone()) {
            Ok(cmd) => cmd,
            Err(e) => {
                let tag = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("<missing>");
                tracing::warn!(tag, error = %e, "Unknown command tag in log; treating as noop");
                Command::Noop
            }
        }
    }
}

/// One replicated log record. Indices are 1-based and dense; entries are
/// immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
    pub timestamp_ms: u64,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: Command) -> Self {
        Self {
            term,
            index,
            command,
            timestamp_ms: now_ms(),
        }
    }
}

/// Milliseconds since the Unix epoch, for entry and snapshot timestamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
