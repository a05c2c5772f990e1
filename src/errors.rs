//! Error taxonomy shared across the orchestrator.
//!
//! Five families, one enum each: transport, persistence, consensus protocol,
//! registry validation and adapter. Every variant carries a human-readable
//! message via `Display` and a stable machine-readable tag via `kind()` so
//! wire responses and log fields never depend on `Debug` formatting.
//!
//! Propagation policy: transport and adapter errors are recoverable at the
//! call site (the caller chooses whether to retry); persistence and
//! consensus errors propagate to the operation that triggered them — a
//! failed log append fails the proposal, a step-down fails every pending
//! proposal with `term_changed`.

use thiserror::Error;

// ── Transport ─────────────────────────────────────────────────────────────────

/// RPC delivery failures. The consensus layer treats every variant the same
/// way: as if no response arrived.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("RPC timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Unknown peer '{0}'")]
    UnknownPeer(String),
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::ConnectionRefused(_) => "connection_refused",
            TransportError::HttpStatus(_) => "http_status",
            TransportError::MalformedResponse(_) => "malformed_response",
            TransportError::UnknownPeer(_) => "unknown_peer",
        }
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

/// Durable-state failures. Fatal to the operation that caused them: a node
/// that cannot persist must not grant a vote, acknowledge entries or accept
/// a term bump.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record in {path} at line {line}")]
    CorruptRecord { path: String, line: usize },

    #[error("Disk full while writing {0}")]
    DiskFull(String),
}

impl PersistenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceError::Io { .. } => "io_error",
            PersistenceError::CorruptRecord { .. } => "corrupt_record",
            PersistenceError::DiskFull(_) => "disk_full",
        }
    }

    /// Wrap an `std::io::Error`, promoting ENOSPC to its own kind.
    pub fn from_io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.raw_os_error() == Some(28) {
            PersistenceError::DiskFull(path)
        } else {
            PersistenceError::Io { path, source }
        }
    }
}

// ── Consensus protocol ────────────────────────────────────────────────────────

/// Structured consensus outcomes returned to proposing clients and across
/// RPCs. Never panics, never an exception: always a value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("Not the leader{}", leader_hint(.0))]
    NotLeader(Option<String>),

    #[error("Term changed before the entry committed")]
    TermChanged,

    #[error("Log mismatch at index {0}")]
    LogMismatch(u64),

    #[error("Could not persist the entry: {0}")]
    Persistence(String),

    #[error("Proposal channel closed before a reply arrived")]
    Canceled,
}

fn leader_hint(leader: &Option<String>) -> String {
    match leader {
        Some(id) => format!(" (try '{}')", id),
        None => String::new(),
    }
}

impl ConsensusError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusError::NotLeader(_) => "not_leader",
            ConsensusError::TermChanged => "term_changed",
            ConsensusError::LogMismatch(_) => "log_mismatch",
            ConsensusError::Persistence(_) => "persistence",
            ConsensusError::Canceled => "canceled",
        }
    }
}

/// Everything a proposal can fail with: a consensus outcome or a synchronous
/// validation reject. Validation failures never reach the log.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProposeError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ProposeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProposeError::Consensus(e) => e.kind(),
            ProposeError::Registry(e) => e.kind(),
        }
    }

    /// The leader hint, when the failure is `not_leader`.
    pub fn leader_id(&self) -> Option<&str> {
        match self {
            ProposeError::Consensus(ConsensusError::NotLeader(leader)) => leader.as_deref(),
            _ => None,
        }
    }
}

// ── Registry validation ───────────────────────────────────────────────────────

/// Raised synchronously before an entry is appended. Invalid commands never
/// reach the log.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Unknown adapter type '{0}'")]
    UnknownAdapter(String),

    #[error("Unknown store '{0}'")]
    UnknownStore(String),

    #[error("Store '{0}' is already registered with a different adapter family")]
    DuplicateStore(String),

    #[error("Unknown hexad '{0}'")]
    UnknownHexad(String),

    #[error("Hexad '{0}' is already mapped; unmap it first")]
    DuplicateHexad(String),

    #[error("Store '{store_id}' does not support modality '{modality}'")]
    ModalityNotSupported { store_id: String, modality: String },

    #[error("Trust level {0} is outside [0.0, 1.0]")]
    TrustOutOfRange(f64),

    #[error("Hexad mapping must name at least one location")]
    EmptyLocations,
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::UnknownAdapter(_) => "unknown_adapter",
            RegistryError::UnknownStore(_) => "unknown_store",
            RegistryError::DuplicateStore(_) => "duplicate_store",
            RegistryError::UnknownHexad(_) => "unknown_hexad",
            RegistryError::DuplicateHexad(_) => "duplicate_hexad",
            RegistryError::ModalityNotSupported { .. } => "modality_not_supported",
            RegistryError::TrustOutOfRange(_) => "trust_out_of_range",
            RegistryError::EmptyLocations => "empty_locations",
        }
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

/// Per-peer adapter failures. They never fail the whole federated query.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Modality '{0}' is not supported by this store")]
    UnsupportedModality(String),

    #[error("Backend returned status {0}")]
    BackendError(u16),

    #[error("Backend reports unhealthy: {0}")]
    Unhealthy(String),

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Could not decode backend response: {0}")]
    DecodeError(String),
}

impl AdapterError {
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::UnsupportedModality(_) => "unsupported_modality",
            AdapterError::BackendError(_) => "backend_error",
            AdapterError::Unhealthy(_) => "unhealthy",
            AdapterError::Unreachable(_) => "unreachable",
            AdapterError::AuthFailed => "auth_failed",
            AdapterError::DecodeError(_) => "decode_error",
        }
    }

    /// Classify a reqwest error at the adapter boundary.
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            AdapterError::Unreachable(error.to_string())
        } else if error.is_decode() {
            AdapterError::DecodeError(error.to_string())
        } else if let Some(status) = error.status() {
            match status.as_u16() {
                401 | 403 => AdapterError::AuthFailed,
                code => AdapterError::BackendError(code),
            }
        } else {
            AdapterError::Unreachable(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kinds_are_stable() {
        assert_eq!(TransportError::Timeout(1000).kind(), "timeout");
        assert_eq!(TransportError::HttpStatus(503).kind(), "http_status");
        assert_eq!(
            TransportError::MalformedResponse("eof".into()).kind(),
            "malformed_response"
        );
    }

    #[test]
    fn consensus_not_leader_carries_hint() {
        let err = ConsensusError::NotLeader(Some("n2".into()));
        assert_eq!(err.kind(), "not_leader");
        assert!(err.to_string().contains("n2"));

        let bare = ConsensusError::NotLeader(None);
        assert!(!bare.to_string().contains("try"));
    }

    #[test]
    fn registry_kinds_match_wire_tags() {
        assert_eq!(
            RegistryError::UnknownAdapter("x".into()).kind(),
            "unknown_adapter"
        );
        assert_eq!(
            RegistryError::DuplicateStore("s".into()).kind(),
            "duplicate_store"
        );
        assert_eq!(
            RegistryError::ModalityNotSupported {
                store_id: "s".into(),
                modality: "vector".into()
            }
            .kind(),
            "modality_not_supported"
        );
    }

    #[test]
    fn adapter_kinds_are_stable() {
        assert_eq!(
            AdapterError::UnsupportedModality("tensor".into()).kind(),
            "unsupported_modality"
        );
        assert_eq!(AdapterError::BackendError(500).kind(), "backend_error");
        assert_eq!(AdapterError::AuthFailed.kind(), "auth_failed");
    }

    #[test]
    fn disk_full_is_promoted() {
        let enospc = std::io::Error::from_raw_os_error(28);
        assert_eq!(
            PersistenceError::from_io("wal/log.jsonl", enospc).kind(),
            "disk_full"
        );
    }
}
