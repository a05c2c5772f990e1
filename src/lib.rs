//! Orchestration core of a multi-modal database federation.
//!
//! Three coupled subsystems:
//!
//! - a **consensus layer** replicating the registry (peer backends and
//!   hexad-to-backend mappings) across orchestration nodes over Raft, with
//!   a write-ahead log, snapshotting and crash recovery;
//! - a **federation resolver** fanning a neutral query out to eligible
//!   backends concurrently under a deadline and merging the normalised
//!   results;
//! - an **adapter contract** each backend family implements, declaring
//!   per-instance modality capability and translating between the neutral
//!   query shape and backend-native requests.

pub mod adapter;
pub mod adapter_arangodb;
pub mod adapter_clickhouse;
pub mod adapter_couchdb;
pub mod adapter_elasticsearch;
pub mod adapter_influxdb;
pub mod adapter_neo4j;
pub mod adapter_object_store;
pub mod adapter_postgresql;
pub mod adapter_qdrant;
pub mod command;
pub mod config;
pub mod consensus;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod modality;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod transport;
pub mod wal;
