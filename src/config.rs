//! Node, server and resolver configuration.
//!
//! Settings come from environment variables, optionally seeded by a YAML
//! file named in `HEXAFED_CONFIG_FILE`. Environment variables always win
//! over file values, so a deployment can ship one file and override per
//! node.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `NODE_ID` | — (required) | stable node identity |
//! | `PEERS` | empty | comma list of `id` or `id=http://host:port` |
//! | `WAL_PATH` | none | persistence dir; unset = crashes discard state |
//! | `ELECTION_TIMEOUT_MIN_MS` | 150 | lower election jitter bound |
//! | `ELECTION_TIMEOUT_MAX_MS` | 300 | upper election jitter bound |
//! | `HEARTBEAT_INTERVAL_MS` | 50 | leader heartbeat period |
//! | `RPC_TIMEOUT_MS` | 1000 | hard per-RPC deadline |
//! | `SNAPSHOT_THRESHOLD` | 10000 | applied entries between snapshots |
//! | `BIND_ADDR` | 0.0.0.0:7400 | Raft RPC + diagnostics listener |
//! | `RESOLVER_TIMEOUT_MS` | 5000 | default federated query deadline |
//! | `STRICT_TRUST_THRESHOLD` | 0.7 | strict drift policy cutoff |
//! | `DRIFT_POLICY` | tolerate | default drift policy |
//! | `HEALTH_INTERVAL_MS` | 15000 | backend probe period |

use std::env;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::resolver::DriftPolicy;
use crate::transport::PeerRef;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Could not read config file {path}: {message}")]
    UnreadableFile { path: String, message: String },

    #[error("Election timeout bounds are inverted: min {min} > max {max}")]
    InvertedElectionBounds { min: u64, max: u64 },
}

// ── Typed structs ─────────────────────────────────────────────────────────────

/// Everything one consensus node needs at init. No global singletons:
/// composition is always through a passed-in config.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// Every *other* node of the cluster.
    pub peers: Vec<PeerRef>,
    /// `None` disables persistence entirely.
    pub wal_path: Option<PathBuf>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub snapshot_threshold: u64,
}

impl NodeConfig {
    /// A config with protocol defaults, in-memory persistence and no peers.
    /// Used by tests and embedded single-node deployments.
    pub fn single_node(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            peers: Vec::new(),
            wal_path: None,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 1_000,
            snapshot_threshold: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub default_timeout_ms: u64,
    pub strict_trust_threshold: f64,
    pub drift_policy_default: DriftPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            strict_trust_threshold: 0.7,
            drift_policy_default: DriftPolicy::Tolerate,
        }
    }
}

/// Whole-process settings bundle.
#[derive(Debug, Clone)]
pub struct Settings {
    pub node: NodeConfig,
    pub resolver: ResolverConfig,
    pub bind_addr: String,
    pub health_interval_ms: u64,
}

// ── YAML file shape ───────────────────────────────────────────────────────────

/// Optional file counterpart of the env variables; every field optional so
/// partial files are fine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSettings {
    #[serde(default)]
    node: FileNode,
    #[serde(default)]
    resolver: FileResolver,
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    health: FileHealth,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNode {
    node_id: Option<String>,
    peers: Option<Vec<String>>,
    wal_path: Option<String>,
    election_timeout_min_ms: Option<u64>,
    election_timeout_max_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    rpc_timeout_ms: Option<u64>,
    snapshot_threshold: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileResolver {
    default_timeout_ms: Option<u64>,
    strict_trust_threshold: Option<f64>,
    drift_policy_default: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServer {
    bind_addr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHealth {
    interval_ms: Option<u64>,
}

// ── Env helpers ───────────────────────────────────────────────────────────────

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                var: name.into(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl Settings {
    /// Load the full settings bundle: YAML file (when `HEXAFED_CONFIG_FILE`
    /// is set) overridden by environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match env::var("HEXAFED_CONFIG_FILE") {
            Ok(path) => Self::load_file(&path)?,
            Err(_) => FileSettings::default(),
        };
        Self::from_sources(file)
    }

    fn load_file(path: &str) -> Result<FileSettings, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::UnreadableFile {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::UnreadableFile {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    fn from_sources(file: FileSettings) -> Result<Self, ConfigError> {
        let node_id = match env::var("NODE_ID") {
            Ok(id) => id,
            Err(_) => file
                .node
                .node_id
                .clone()
                .ok_or_else(|| ConfigError::MissingEnvVar("NODE_ID".into()))?,
        };

        let peer_entries: Vec<String> = match env::var("PEERS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => file.node.peers.clone().unwrap_or_default(),
        };
        let mut peers = Vec::with_capacity(peer_entries.len());
        for entry in &peer_entries {
            let peer = PeerRef::parse(entry).map_err(|message| ConfigError::InvalidValue {
                var: "PEERS".into(),
                message,
            })?;
            // The node never peers with itself.
            if peer.node_id() != node_id {
                peers.push(peer);
            }
        }

        let wal_path = env::var("WAL_PATH")
            .ok()
            .or(file.node.wal_path.clone())
            .map(PathBuf::from);

        let election_timeout_min_ms = env_parse("ELECTION_TIMEOUT_MIN_MS")?
            .or(file.node.election_timeout_min_ms)
            .unwrap_or(150);
        let election_timeout_max_ms = env_parse("ELECTION_TIMEOUT_MAX_MS")?
            .or(file.node.election_timeout_max_ms)
            .unwrap_or(300);
        if election_timeout_min_ms > election_timeout_max_ms {
            return Err(ConfigError::InvertedElectionBounds {
                min: election_timeout_min_ms,
                max: election_timeout_max_ms,
            });
        }

        let node = NodeConfig {
            node_id,
            peers,
            wal_path,
            election_timeout_min_ms,
            election_timeout_max_ms,
            heartbeat_interval_ms: env_parse("HEARTBEAT_INTERVAL_MS")?
                .or(file.node.heartbeat_interval_ms)
                .unwrap_or(50),
            rpc_timeout_ms: env_parse("RPC_TIMEOUT_MS")?
                .or(file.node.rpc_timeout_ms)
                .unwrap_or(1_000),
            snapshot_threshold: env_parse("SNAPSHOT_THRESHOLD")?
                .or(file.node.snapshot_threshold)
                .unwrap_or(10_000),
        };

        let drift_raw = env::var("DRIFT_POLICY")
            .ok()
            .or(file.resolver.drift_policy_default.clone());
        let drift_policy_default = match drift_raw {
            Some(raw) => raw
                .parse::<DriftPolicy>()
                .map_err(|message| ConfigError::InvalidValue {
                    var: "DRIFT_POLICY".into(),
                    message,
                })?,
            None => DriftPolicy::Tolerate,
        };

        let resolver = ResolverConfig {
            default_timeout_ms: env_parse("RESOLVER_TIMEOUT_MS")?
                .or(file.resolver.default_timeout_ms)
                .unwrap_or(5_000),
            strict_trust_threshold: env_parse("STRICT_TRUST_THRESHOLD")?
                .or(file.resolver.strict_trust_threshold)
                .unwrap_or(0.7),
            drift_policy_default,
        };

        Ok(Settings {
            node,
            resolver,
            bind_addr: env::var("BIND_ADDR")
                .ok()
                .or(file.server.bind_addr)
                .unwrap_or_else(|| "0.0.0.0:7400".to_string()),
            health_interval_ms: env_parse("HEALTH_INTERVAL_MS")?
                .or(file.health.interval_ms)
                .unwrap_or(15_000),
        })
    }

}
