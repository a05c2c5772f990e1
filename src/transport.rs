//! RPC delivery to local and remote consensus peers.
//!
//! A peer is either a bare `store_id` resolved through the in-process
//! directory (same-process dispatch, used heavily by tests and embedded
//! deployments) or a `(store_id, endpoint)` pair that is always remote.
//! Remote dispatch is HTTP POST of JSON bodies to `/raft/vote`,
//! `/raft/append` and `/raft/propose`; any non-200 is a transport failure
//! and observationally identical to a timeout.
//!
//! Transport errors never alter Raft state directly. The issuing layer
//! proceeds as if no response arrived and lets the next heartbeat or
//! election timeout drive the protocol forward.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::command::{Command, LogEntry};
use crate::errors::{ConsensusError, ProposeError, TransportError};

// ── Wire bodies (§ HTTP/JSON protocol) ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

/// Success body of `/raft/propose`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeAccepted {
    pub ok: bool,
    pub index: u64,
}

/// Error body of `/raft/propose` (4xx/5xx).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeRejected {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Inbound dispatch ──────────────────────────────────────────────────────────

/// An RPC delivered into a node's mailbox. The oneshot carries the reply
/// back to whichever edge (local call or HTTP handler) accepted the RPC.
#[derive(Debug)]
pub enum InboundRpc {
    Vote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    Append {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    Propose {
        command: Command,
        reply: oneshot::Sender<Result<u64, ProposeError>>,
    },
}

/// Mailbox handle for one node, registered in the local directory.
pub type RpcHandle = mpsc::Sender<InboundRpc>;

// ── Peer resolution ───────────────────────────────────────────────────────────

/// How a configured peer is reached.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerRef {
    /// Same-process node, resolved through the directory.
    Local(String),
    /// Always remote, at the given base URL.
    Remote { node_id: String, endpoint: String },
}

impl PeerRef {
    pub fn node_id(&self) -> &str {
        match self {
            PeerRef::Local(id) => id,
            PeerRef::Remote { node_id, .. } => node_id,
        }
    }

    /// Parse the config form: `node2` (local) or `node2=http://host:7000`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("Peer entry cannot be empty".to_string());
        }
        match raw.split_once('=') {
            Some((id, endpoint)) if !id.trim().is_empty() && !endpoint.trim().is_empty() => {
                Ok(PeerRef::Remote {
                    node_id: id.trim().to_string(),
                    endpoint: endpoint.trim().trim_end_matches('/').to_string(),
                })
            }
            Some(_) => Err(format!("Invalid peer entry: '{}'", raw)),
            None => Ok(PeerRef::Local(raw.to_string())),
        }
    }
}

/// In-process peer directory: node_id → mailbox.
///
/// Read-mostly; writes happen only at node startup and shutdown. Shared by
/// handing an `Arc<LocalDirectory>` to every node — there is no global.
#[derive(Default)]
pub struct LocalDirectory {
    inner: RwLock<HashMap<String, RpcHandle>>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str, handle: RpcHandle) {
        self.inner
            .write()
            .expect("peer directory lock poisoned")
            .insert(node_id.to_string(), handle);
    }

    pub fn deregister(&self, node_id: &str) {
        self.inner
            .write()
            .expect("peer directory lock poisoned")
            .remove(node_id);
    }

    pub fn lookup(&self, node_id: &str) -> Option<RpcHandle> {
        self.inner
            .read()
            .expect("peer directory lock poisoned")
            .get(node_id)
            .cloned()
    }
}

// ── The transport ─────────────────────────────────────────────────────────────

/// Uniform RPC issuance across local and remote peers, with a hard per-RPC
/// deadline.
pub struct RaftTransport {
    directory: std::sync::Arc<LocalDirectory>,
    http: reqwest::Client,
    rpc_timeout_ms: u64,
}

impl RaftTransport {
    pub fn new(directory: std::sync::Arc<LocalDirectory>, rpc_timeout_ms: u64) -> Self {
        Self {
            directory,
            http: reqwest::Client::new(),
            rpc_timeout_ms,
        }
    }

    pub fn rpc_timeout_ms(&self) -> u64 {
        self.rpc_timeout_ms
    }

    // ── Vote ──────────────────────────────────────────────────────────────────

    pub async fn send_vote(
        &self,
        peer: &PeerRef,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        match peer {
            PeerRef::Local(node_id) => {
                self.local_roundtrip(node_id, |reply| InboundRpc::Vote { request, reply })
                    .await
            }
            PeerRef::Remote { endpoint, .. } => {
                self.post(&format!("{}/raft/vote", endpoint), &request).await
            }
        }
    }

    // ── AppendEntries ─────────────────────────────────────────────────────────

    pub async fn send_append(
        &self,
        peer: &PeerRef,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        match peer {
            PeerRef::Local(node_id) => {
                self.local_roundtrip(node_id, |reply| InboundRpc::Append { request, reply })
                    .await
            }
            PeerRef::Remote { endpoint, .. } => {
                self.post(&format!("{}/raft/append", endpoint), &request)
                    .await
            }
        }
    }

    // ── Client-side proposal forwarding ───────────────────────────────────────

    /// Propose a command against a remote node's `/raft/propose`. A non-2xx
    /// reply with a structured body becomes the matching `ConsensusError`
    /// (so callers can retry against the suggested leader); everything else
    /// is a transport failure.
    pub async fn propose_to(
        &self,
        endpoint: &str,
        command: &Command,
    ) -> Result<u64, ProposeFailure> {
        let url = format!("{}/raft/propose", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_millis(self.rpc_timeout_ms))
            .json(command)
            .send()
            .await
            .map_err(|e| ProposeFailure::Transport(classify_reqwest(e, self.rpc_timeout_ms)))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProposeFailure::Transport(TransportError::MalformedResponse(e.to_string())))?;

        if (200..300).contains(&status) {
            let accepted: ProposeAccepted = serde_json::from_slice(&body).map_err(|e| {
                ProposeFailure::Transport(TransportError::MalformedResponse(e.to_string()))
            })?;
            return Ok(accepted.index);
        }

        match serde_json::from_slice::<ProposeRejected>(&body) {
            Ok(rejected) => Err(ProposeFailure::from_rejected(rejected, status)),
            Err(_) => Err(ProposeFailure::Transport(TransportError::HttpStatus(status))),
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn local_roundtrip<T>(
        &self,
        node_id: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> InboundRpc,
    ) -> Result<T, TransportError> {
        let handle = self
            .directory
            .lookup(node_id)
            .ok_or_else(|| TransportError::UnknownPeer(node_id.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .send(build(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionRefused(node_id.to_string()))?;
        match tokio::time::timeout(Duration::from_millis(self.rpc_timeout_ms), reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionRefused(node_id.to_string())),
            Err(_) => Err(TransportError::Timeout(self.rpc_timeout_ms)),
        }
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        request: &Req,
    ) -> Result<Resp, TransportError> {
        let response = self
            .http
            .post(url)
            .timeout(Duration::from_millis(self.rpc_timeout_ms))
            .json(request)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, self.rpc_timeout_ms))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(TransportError::HttpStatus(status));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))
    }
}

/// Why a forwarded proposal failed: a structured consensus answer worth
/// acting on, a validation reject, or a transport failure worth retrying
/// blindly.
#[derive(Debug)]
pub enum ProposeFailure {
    Consensus(ConsensusError),
    /// Validation reject with its wire tag and optional message.
    Rejected { error: String, message: Option<String> },
    Transport(TransportError),
}

impl ProposeFailure {
    fn from_rejected(rejected: ProposeRejected, status: u16) -> Self {
        match rejected.error.as_str() {
            "not_leader" => ProposeFailure::Consensus(ConsensusError::NotLeader(rejected.leader_id)),
            "term_changed" => ProposeFailure::Consensus(ConsensusError::TermChanged),
            "persistence" => ProposeFailure::Consensus(ConsensusError::Persistence(
                rejected.message.unwrap_or_default(),
            )),
            error if status >= 400 => ProposeFailure::Rejected {
                error: error.to_string(),
                message: rejected.message,
            },
            _ => ProposeFailure::Transport(TransportError::HttpStatus(status)),
        }
    }
}

fn classify_reqwest(error: reqwest::Error, timeout_ms: u64) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout_ms)
    } else if error.is_connect() {
        TransportError::ConnectionRefused(error.to_string())
    } else {
        TransportError::MalformedResponse(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ref_parses_both_forms() {
        assert_eq!(PeerRef::parse("n2").unwrap(), PeerRef::Local("n2".into()));
        assert_eq!(
            PeerRef::parse("n2=http://h:7000/").unwrap(),
            PeerRef::Remote {
                node_id: "n2".into(),
                endpoint: "http://h:7000".into()
            }
        );
        assert!(PeerRef::parse("").is_err());
        assert!(PeerRef::parse("=http://h:7000").is_err());
    }

    #[test]
    fn wire_bodies_round_trip() {
        let req = AppendEntriesRequest {
            term: 2,
            leader_id: "n1".into(),
            prev_log_index: 4,
            prev_log_term: 1,
            entries: vec![LogEntry {
                term: 2,
                index: 5,
                command: Command::Noop,
                timestamp_ms: 9,
            }],
            leader_commit: 4,
        };
        let j = serde_json::to_string(&req).unwrap();
        assert_eq!(
            serde_json::from_str::<AppendEntriesRequest>(&j).unwrap(),
            req
        );
    }

    #[test]
    fn directory_registration_lifecycle() {
        let directory = LocalDirectory::new();
        let (tx, _rx) = mpsc::channel(1);
        directory.register("n1", tx);
        assert!(directory.lookup("n1").is_some());
        directory.deregister("n1");
        assert!(directory.lookup("n1").is_none());
    }

    #[tokio::test]
    async fn local_vote_roundtrip() {
        let directory = std::sync::Arc::new(LocalDirectory::new());
        let (tx, mut rx) = mpsc::channel(8);
        directory.register("n2", tx);

        // A stand-in node that grants every vote.
        tokio::spawn(async move {
            while let Some(rpc) = rx.recv().await {
                if let InboundRpc::Vote { request, reply } = rpc {
                    let _ = reply.send(VoteResponse {
                        term: request.term,
                        vote_granted: true,
                    });
                }
            }
        });

        let transport = RaftTransport::new(directory, 1_000);
        let response = transport
            .send_vote(
                &PeerRef::Local("n2".into()),
                VoteRequest {
                    term: 3,
                    candidate_id: "n1".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap();
        assert!(response.vote_granted);
        assert_eq!(response.term, 3);
    }

    #[tokio::test]
    async fn unknown_local_peer_is_an_error() {
        let transport = RaftTransport::new(std::sync::Arc::new(LocalDirectory::new()), 100);
        let err = transport
            .send_vote(
                &PeerRef::Local("ghost".into()),
                VoteRequest {
                    term: 1,
                    candidate_id: "n1".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_peer");
    }

    #[tokio::test]
    async fn local_timeout_when_node_never_replies() {
        let directory = std::sync::Arc::new(LocalDirectory::new());
        let (tx, mut rx) = mpsc::channel(8);
        directory.register("slow", tx);
        tokio::spawn(async move {
            // Receive and drop nothing: hold the mailbox open but never reply.
            let mut held = Vec::new();
            while let Some(rpc) = rx.recv().await {
                held.push(rpc);
            }
        });

        let transport = RaftTransport::new(directory, 50);
        let err = transport
            .send_vote(
                &PeerRef::Local("slow".into()),
                VoteRequest {
                    term: 1,
                    candidate_id: "n1".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
}
