//! The Raft consensus node: leader election, log replication and state
//! machine execution for registry commands.
//!
//! Each node is a single logical actor. It drains one mailbox — RPCs from
//! the transport edge, replies posted back by RPC worker tasks, timer fires
//! — and processes each event to completion before the next, so every state
//! transition is serialised without per-field locking. Outbound RPCs are
//! issued from short-lived worker tasks that never touch node state; their
//! replies come back through the mailbox as tagged events.
//!
//! ## State transitions
//!
//! ```text
//! Follower  → Candidate   election timeout with no heartbeat
//! Candidate → Leader      votes from a strict majority (self included)
//! Candidate → Follower    RPC with term ≥ own, or a valid AppendEntries
//! Leader    → Follower    RPC with term > own
//! ```
//!
//! On winning an election the leader appends a `noop` entry in its new term:
//! prior-term entries are only ever committed transitively, once a
//! current-term entry above them commits. Omitting the noop is unsafe even
//! when tests pass in the common case.
//!
//! Durability discipline: `(current_term, voted_for)` is persisted before
//! any RPC response that could influence election safety, and a node that
//! cannot persist refuses the triggering RPC — the peer sees a no-response.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterRegistry;
use crate::command::{Command, LogEntry};
use crate::config::NodeConfig;
use crate::errors::{ConsensusError, PersistenceError, ProposeError};
use crate::metrics::{
    RAFT_APPLIED_INDEX, RAFT_COMMIT_INDEX, RAFT_CURRENT_TERM, RAFT_ELECTIONS_TOTAL,
    RAFT_PROPOSALS_TOTAL, RAFT_RPC_FAILURES_TOTAL,
};
use crate::registry::Registry;
use crate::transport::{
    AppendEntriesRequest, AppendEntriesResponse, InboundRpc, LocalDirectory, PeerRef,
    RaftTransport, RpcHandle, VoteRequest, VoteResponse,
};
use crate::wal::Wal;

// ── Role ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Everything the actor reacts to besides inbound RPCs.
#[derive(Debug)]
pub enum NodeEvent {
    VoteReply {
        peer_id: String,
        response: VoteResponse,
    },
    AppendReply {
        peer_id: String,
        response: AppendEntriesResponse,
        /// Highest index included in the request this reply answers.
        sent_up_to: u64,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Diagnostics snapshot served by `/health/cluster`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub role: String,
    pub current_term: u64,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_length: u64,
    pub snapshot_index: u64,
    pub peers: usize,
    pub stores: usize,
    pub hexads: usize,
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to a running node.
#[derive(Clone)]
pub struct ConsensusNode {
    node_id: String,
    rpc_tx: RpcHandle,
    events_tx: mpsc::Sender<NodeEvent>,
    registry_rx: watch::Receiver<Registry>,
}

impl ConsensusNode {
    /// Recover state from the WAL (when configured), register the node in
    /// the in-process directory and start its actor.
    pub fn spawn(
        config: NodeConfig,
        adapters: Arc<AdapterRegistry>,
        directory: Arc<LocalDirectory>,
    ) -> Result<ConsensusNode, PersistenceError> {
        let (wal, recovered) = match &config.wal_path {
            Some(path) => {
                let wal = Wal::open(path)?;
                let recovered = wal.recover()?;
                (Some(wal), recovered)
            }
            // No persistence configured: a crash discards state.
            None => (None, Default::default()),
        };

        // The snapshot image is both commit and apply floor. The recovered
        // log suffix re-applies only as it re-commits: under the next
        // leader's noop on real clusters, immediately on self-election for
        // a singleton.
        let registry = recovered.registry;
        let snapshot_index = recovered.snapshot_index;
        let last_applied = snapshot_index;
        if snapshot_index > 0 {
            info!(
                node_id = %config.node_id,
                snapshot_index,
                suffix = recovered.entries.len(),
                "Recovered registry snapshot"
            );
        }

        let (rpc_tx, rpc_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (registry_tx, registry_rx) = watch::channel(registry.clone());

        directory.register(&config.node_id, rpc_tx.clone());

        let transport = Arc::new(RaftTransport::new(directory.clone(), config.rpc_timeout_ms));
        let node_id = config.node_id.clone();

        let actor = NodeActor {
            config,
            adapters,
            directory,
            transport,
            wal,
            current_term: recovered.current_term,
            voted_for: recovered.voted_for,
            log: recovered.entries,
            snapshot_index,
            snapshot_term: recovered.snapshot_term,
            role: Role::Follower,
            leader_id: None,
            commit_index: snapshot_index,
            last_applied,
            registry,
            registry_tx,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            pending: BTreeMap::new(),
            events_tx: events_tx.clone(),
        };
        tokio::spawn(actor.run(rpc_rx, events_rx));

        Ok(ConsensusNode {
            node_id,
            rpc_tx,
            events_tx,
            registry_rx,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Mailbox handle for the HTTP server edge.
    pub fn rpc_handle(&self) -> RpcHandle {
        self.rpc_tx.clone()
    }

    /// Watch channel publishing the applied registry. Readers see committed
    /// and applied state only; `borrow().clone()` is the local snapshot the
    /// resolver uses.
    pub fn registry(&self) -> watch::Receiver<Registry> {
        self.registry_rx.clone()
    }

    /// Propose a command. Resolves once the entry commits *and* applies on
    /// this node, with the entry's log index.
    pub async fn propose(&self, command: Command) -> Result<u64, ProposeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.rpc_tx
            .send(InboundRpc::Propose {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProposeError::Consensus(ConsensusError::Canceled))?;
        reply_rx
            .await
            .map_err(|_| ProposeError::Consensus(ConsensusError::Canceled))?
    }

    /// Diagnostics snapshot; `None` if the actor is gone.
    pub async fn status(&self) -> Option<NodeStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events_tx
            .send(NodeEvent::Status { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    /// Stop the actor and deregister from the in-process directory.
    pub async fn shutdown(&self) {
        let _ = self.events_tx.send(NodeEvent::Shutdown).await;
    }
}

// ── The actor ─────────────────────────────────────────────────────────────────

struct PendingProposal {
    term: u64,
    reply: oneshot::Sender<Result<u64, ProposeError>>,
}

struct NodeActor {
    config: NodeConfig,
    adapters: Arc<AdapterRegistry>,
    directory: Arc<LocalDirectory>,
    transport: Arc<RaftTransport>,
    wal: Option<Wal>,

    // Persistent state (mirrored to the WAL when configured)
    current_term: u64,
    voted_for: Option<String>,
    /// Log suffix after the snapshot, index `snapshot_index + 1` onwards.
    log: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,

    // Volatile state
    role: Role,
    leader_id: Option<String>,
    commit_index: u64,
    last_applied: u64,
    registry: Registry,
    registry_tx: watch::Sender<Registry>,

    // Leader-only volatile state
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    votes_received: HashSet<String>,
    pending: BTreeMap<u64, PendingProposal>,

    events_tx: mpsc::Sender<NodeEvent>,
}

impl NodeActor {
    async fn run(
        mut self,
        mut rpc_rx: mpsc::Receiver<InboundRpc>,
        mut events_rx: mpsc::Receiver<NodeEvent>,
    ) {
        info!(
            node_id = %self.config.node_id,
            term = self.current_term,
            log_length = self.log.len(),
            snapshot_index = self.snapshot_index,
            peers = self.config.peers.len(),
            "Consensus node started"
        );

        let mut election_deadline = Instant::now() + self.random_election_timeout();
        let mut heartbeat_deadline = Instant::now();

        loop {
            let deadline = match self.role {
                Role::Leader => heartbeat_deadline,
                _ => election_deadline,
            };

            tokio::select! {
                maybe_rpc = rpc_rx.recv() => match maybe_rpc {
                    Some(InboundRpc::Vote { request, reply }) => {
                        let response = self.handle_vote_request(request, &mut election_deadline);
                        let _ = reply.send(response);
                    }
                    Some(InboundRpc::Append { request, reply }) => {
                        let response = self.handle_append_entries(request, &mut election_deadline);
                        let _ = reply.send(response);
                    }
                    Some(InboundRpc::Propose { command, reply }) => {
                        self.handle_propose(command, reply);
                    }
                    None => break,
                },
                maybe_event = events_rx.recv() => match maybe_event {
                    Some(NodeEvent::VoteReply { peer_id, response }) => {
                        self.handle_vote_reply(peer_id, response, &mut election_deadline, &mut heartbeat_deadline);
                    }
                    Some(NodeEvent::AppendReply { peer_id, response, sent_up_to }) => {
                        self.handle_append_reply(peer_id, response, sent_up_to, &mut election_deadline);
                    }
                    Some(NodeEvent::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(NodeEvent::Shutdown) | None => break,
                },
                _ = time::sleep_until(deadline) => {
                    match self.role {
                        Role::Leader => {
                            self.broadcast_appends();
                            heartbeat_deadline = Instant::now()
                                + Duration::from_millis(self.config.heartbeat_interval_ms);
                        }
                        _ => {
                            self.start_election(&mut election_deadline, &mut heartbeat_deadline);
                        }
                    }
                }
            }
        }

        self.fail_pending(ConsensusError::Canceled);
        self.directory.deregister(&self.config.node_id);
        info!(node_id = %self.config.node_id, "Consensus node stopped");
    }

    // ── Log coordinates ───────────────────────────────────────────────────────

    fn last_log_index(&self) -> u64 {
        self.snapshot_index + self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Term of the entry at `index`; `Some(0)` at index 0, the snapshot term
    /// at the boundary, `None` for compacted or nonexistent indices.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        if index < self.snapshot_index {
            return None;
        }
        self.log
            .get((index - self.snapshot_index - 1) as usize)
            .map(|e| e.term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    fn majority(&self) -> usize {
        (self.config.peers.len() + 1) / 2 + 1
    }

    fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(
            self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms,
        );
        Duration::from_millis(ms)
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.config.node_id.clone(),
            role: self.role.as_str().to_string(),
            current_term: self.current_term,
            leader_id: self.leader_id.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            log_length: self.last_log_index(),
            snapshot_index: self.snapshot_index,
            peers: self.config.peers.len(),
            stores: self.registry.stores.len(),
            hexads: self.registry.hexads.len(),
        }
    }

    // ── Durability ────────────────────────────────────────────────────────────

    /// Persist `(term, voted_for)`; `true` when durable (or when the node
    /// runs without a WAL). A `false` return means the caller must refuse
    /// the action that required the persist.
    fn persist_term_and_vote(&self, term: u64, voted_for: Option<&str>) -> bool {
        match &self.wal {
            Some(wal) => match wal.persist_durable_state(term, voted_for) {
                Ok(()) => true,
                Err(e) => {
                    error!(node_id = %self.config.node_id, error = %e,
                        "Failed to persist durable state; refusing the triggering RPC");
                    false
                }
            },
            None => true,
        }
    }

    // ── Role transitions ──────────────────────────────────────────────────────

    /// Observe a higher term: step down to follower at `new_term`. Returns
    /// false (and leaves state untouched) when the bump cannot be persisted.
    fn step_down(&mut self, new_term: u64, election_deadline: &mut Instant) -> bool {
        if !self.persist_term_and_vote(new_term, None) {
            return false;
        }
        let was_leader = self.role == Role::Leader;
        self.role = Role::Follower;
        self.current_term = new_term;
        self.voted_for = None;
        self.leader_id = None;
        self.votes_received.clear();
        *election_deadline = Instant::now() + self.random_election_timeout();
        RAFT_CURRENT_TERM.set(self.current_term as i64);
        if was_leader {
            info!(node_id = %self.config.node_id, term = new_term, "Stepping down from leader");
            self.fail_pending(ConsensusError::TermChanged);
        }
        true
    }

    /// A candidate observed a valid leader at its own term.
    fn become_follower_same_term(&mut self) {
        self.role = Role::Follower;
        self.votes_received.clear();
    }

    fn start_election(
        &mut self,
        election_deadline: &mut Instant,
        heartbeat_deadline: &mut Instant,
    ) {
        let new_term = self.current_term + 1;
        if !self.persist_term_and_vote(new_term, Some(&self.config.node_id)) {
            // Cannot vote for ourselves durably — sit out this round.
            *election_deadline = Instant::now() + self.random_election_timeout();
            return;
        }
        self.role = Role::Candidate;
        self.current_term = new_term;
        self.voted_for = Some(self.config.node_id.clone());
        self.leader_id = None;
        self.votes_received = HashSet::from([self.config.node_id.clone()]);
        *election_deadline = Instant::now() + self.random_election_timeout();
        RAFT_ELECTIONS_TOTAL.inc();
        RAFT_CURRENT_TERM.set(self.current_term as i64);

        debug!(
            node_id = %self.config.node_id,
            term = self.current_term,
            "Election timeout; starting election"
        );

        if self.votes_received.len() >= self.majority() {
            // Single-node cluster: immediately leader.
            self.become_leader(heartbeat_deadline, election_deadline);
            return;
        }

        let request = VoteRequest {
            term: self.current_term,
            candidate_id: self.config.node_id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        for peer in &self.config.peers {
            let transport = self.transport.clone();
            let events = self.events_tx.clone();
            let peer = peer.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let peer_id = peer.node_id().to_string();
                match transport.send_vote(&peer, request).await {
                    Ok(response) => {
                        let _ = events.send(NodeEvent::VoteReply { peer_id, response }).await;
                    }
                    Err(e) => {
                        RAFT_RPC_FAILURES_TOTAL.with_label_values(&[e.kind()]).inc();
                        debug!(peer_id = %peer_id, error = %e, "Vote RPC failed");
                    }
                }
            });
        }
    }

    fn become_leader(&mut self, heartbeat_deadline: &mut Instant, election_deadline: &mut Instant) {
        info!(
            node_id = %self.config.node_id,
            term = self.current_term,
            "Won election; becoming leader"
        );
        self.role = Role::Leader;
        self.leader_id = Some(self.config.node_id.clone());
        let next = self.last_log_index() + 1;
        for peer in &self.config.peers {
            self.next_index.insert(peer.node_id().to_string(), next);
            self.match_index.insert(peer.node_id().to_string(), 0);
        }

        // Commit-safety noop: prior-term entries commit transitively once
        // this entry replicates to a majority.
        let entry = LogEntry::new(self.current_term, next, Command::Noop);
        if let Some(wal) = &mut self.wal {
            if let Err(e) = wal.append_entry(&entry) {
                error!(node_id = %self.config.node_id, error = %e,
                    "Cannot append leadership noop; abandoning leadership");
                self.role = Role::Follower;
                self.leader_id = None;
                *election_deadline = Instant::now() + self.random_election_timeout();
                return;
            }
        }
        self.log.push(entry);

        self.maybe_advance_commit();
        self.broadcast_appends();
        *heartbeat_deadline =
            Instant::now() + Duration::from_millis(self.config.heartbeat_interval_ms);
    }

    // ── RequestVote ───────────────────────────────────────────────────────────

    fn handle_vote_request(
        &mut self,
        request: VoteRequest,
        election_deadline: &mut Instant,
    ) -> VoteResponse {
        if request.term < self.current_term {
            return VoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
        }
        if request.term > self.current_term && !self.step_down(request.term, election_deadline) {
            // Could not persist the term bump; refuse.
            return VoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
        }

        let log_up_to_date = request.last_log_term > self.last_log_term()
            || (request.last_log_term == self.last_log_term()
                && request.last_log_index >= self.last_log_index());
        let can_vote = self.voted_for.is_none()
            || self.voted_for.as_deref() == Some(request.candidate_id.as_str());

        if log_up_to_date && can_vote {
            // The vote must be durable before the reply leaves this node.
            if self.persist_term_and_vote(self.current_term, Some(&request.candidate_id)) {
                self.voted_for = Some(request.candidate_id.clone());
                *election_deadline = Instant::now() + self.random_election_timeout();
                debug!(
                    node_id = %self.config.node_id,
                    candidate = %request.candidate_id,
                    term = self.current_term,
                    "Granted vote"
                );
                return VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                };
            }
        }
        VoteResponse {
            term: self.current_term,
            vote_granted: false,
        }
    }

    fn handle_vote_reply(
        &mut self,
        peer_id: String,
        response: VoteResponse,
        election_deadline: &mut Instant,
        heartbeat_deadline: &mut Instant,
    ) {
        if response.term > self.current_term {
            self.step_down(response.term, election_deadline);
            return;
        }
        if self.role != Role::Candidate || response.term < self.current_term {
            return; // stale reply from an earlier election
        }
        if response.vote_granted {
            self.votes_received.insert(peer_id);
            if self.votes_received.len() >= self.majority() {
                self.become_leader(heartbeat_deadline, election_deadline);
            }
        }
    }

    // ── AppendEntries ─────────────────────────────────────────────────────────

    fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
        election_deadline: &mut Instant,
    ) -> AppendEntriesResponse {
        let reject = |term| AppendEntriesResponse {
            term,
            success: false,
            match_index: 0,
        };

        if request.term < self.current_term {
            return reject(self.current_term);
        }
        if request.term > self.current_term {
            if !self.step_down(request.term, election_deadline) {
                return reject(self.current_term);
            }
        } else if self.role != Role::Follower {
            // A valid leader exists at our term.
            self.become_follower_same_term();
        }

        self.leader_id = Some(request.leader_id.clone());
        *election_deadline = Instant::now() + self.random_election_timeout();

        // Consistency check: prev_log_index 0 trivially succeeds.
        if request.prev_log_index > 0 {
            match self.term_at(request.prev_log_index) {
                Some(term) if term == request.prev_log_term => {}
                _ => {
                    debug!(
                        node_id = %self.config.node_id,
                        prev_log_index = request.prev_log_index,
                        "AppendEntries consistency check failed"
                    );
                    return reject(self.current_term);
                }
            }
        }

        // Skip entries we already hold with matching terms; truncate at the
        // first conflict; append the rest durably.
        let mut entries = request.entries;
        let mut keep = 0;
        for entry in &entries {
            if entry.index <= self.snapshot_index {
                keep += 1; // compacted behind the snapshot, already applied
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => keep += 1,
                Some(_) => {
                    if !self.truncate_suffix_from(entry.index) {
                        return reject(self.current_term);
                    }
                    break;
                }
                None => break,
            }
        }
        let new_entries: Vec<LogEntry> = entries.split_off(keep);
        if !new_entries.is_empty() {
            if let Some(wal) = &mut self.wal {
                if let Err(e) = wal.append_entries(&new_entries) {
                    // Must not claim to have matched entries we did not
                    // persist.
                    error!(node_id = %self.config.node_id, error = %e,
                        "Failed to append replicated entries");
                    return reject(self.current_term);
                }
            }
            self.log.extend(new_entries);
        }

        let last = self.last_log_index();
        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(last);
            self.apply_committed();
        }

        AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: last,
        }
    }

    /// Drop local entries from `from_index` on, durably. Only ever runs on
    /// followers — a leader never overwrites or deletes its own entries.
    fn truncate_suffix_from(&mut self, from_index: u64) -> bool {
        if let Some(wal) = &mut self.wal {
            if let Err(e) = wal.truncate_after(from_index - 1) {
                error!(node_id = %self.config.node_id, error = %e, "Log truncation failed");
                return false;
            }
        }
        let keep = (from_index - self.snapshot_index - 1) as usize;
        warn!(
            node_id = %self.config.node_id,
            from_index,
            dropped = self.log.len() - keep,
            "Truncating conflicting log suffix"
        );
        self.log.truncate(keep);
        true
    }

    fn handle_append_reply(
        &mut self,
        peer_id: String,
        response: AppendEntriesResponse,
        sent_up_to: u64,
        election_deadline: &mut Instant,
    ) {
        if response.term > self.current_term {
            self.step_down(response.term, election_deadline);
            return;
        }
        if self.role != Role::Leader || response.term < self.current_term {
            return;
        }
        if response.success {
            // Trust the reply only up to what we actually sent: the
            // follower's own tail beyond that is unverified.
            let matched = response.match_index.min(sent_up_to);
            let entry = self.match_index.entry(peer_id.clone()).or_insert(0);
            if matched > *entry {
                *entry = matched;
            }
            self.next_index.insert(peer_id.clone(), matched + 1);
            self.maybe_advance_commit();
            // Keep streaming if the follower is still behind.
            if matched < self.last_log_index() {
                self.send_append_to(&peer_id);
            }
        } else {
            // Back off one step and retry immediately instead of waiting a
            // heartbeat, so a far-behind follower converges in one burst.
            // The floor is the snapshot boundary — entries behind it are
            // gone. Once pinned at the floor, stop retrying eagerly or the
            // exchange degenerates into a reject/resend spin.
            let next = self.next_index.entry(peer_id.clone()).or_insert(1);
            let backed_off = next.saturating_sub(1).max(self.snapshot_index + 1);
            let moved = backed_off != *next;
            *next = backed_off;
            debug!(
                node_id = %self.config.node_id,
                peer_id = %peer_id,
                next_index = backed_off,
                "Follower log mismatch; backing off next_index"
            );
            if moved {
                self.send_append_to(&peer_id);
            }
        }
    }

    /// Leader commit rule: advance to the highest N replicated on a strict
    /// majority where the entry at N belongs to the current term. Prior-term
    /// entries commit only transitively.
    fn maybe_advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut n = self.last_log_index();
        while n > self.commit_index {
            if self.term_at(n) == Some(self.current_term) {
                let replicated = 1 + self
                    .config
                    .peers
                    .iter()
                    .filter(|p| self.match_index.get(p.node_id()).copied().unwrap_or(0) >= n)
                    .count();
                if replicated >= self.majority() {
                    self.commit_index = n;
                    self.apply_committed();
                    return;
                }
            }
            n -= 1;
        }
    }

    // ── Replication fan-out ───────────────────────────────────────────────────

    /// Send `AppendEntries` to every peer from its `next_index`. Empty
    /// entry lists double as heartbeats and still propagate `leader_commit`.
    fn broadcast_appends(&mut self) {
        let peer_ids: Vec<String> = self
            .config
            .peers
            .iter()
            .map(|p| p.node_id().to_string())
            .collect();
        for peer_id in peer_ids {
            self.send_append_to(&peer_id);
        }
    }

    /// Send one `AppendEntries` to `peer_id` from its `next_index`.
    fn send_append_to(&mut self, peer_id: &str) {
        let Some(peer) = self
            .config
            .peers
            .iter()
            .find(|p| p.node_id() == peer_id)
            .cloned()
        else {
            return;
        };
        let sent_up_to = self.last_log_index();
        let next = self
            .next_index
            .get(peer_id)
            .copied()
            .unwrap_or(sent_up_to + 1)
            .max(self.snapshot_index + 1);
        let prev_log_index = next - 1;
        let prev_log_term = match self.term_at(prev_log_index) {
            Some(term) => term,
            None => {
                // The peer is behind our snapshot boundary; it cannot be
                // caught up over this protocol surface.
                warn!(
                    node_id = %self.config.node_id,
                    peer_id = %peer_id,
                    prev_log_index,
                    "Peer lags behind the snapshot boundary; skipping"
                );
                return;
            }
        };
        let entries: Vec<LogEntry> = if next > sent_up_to {
            Vec::new()
        } else {
            self.log[(next - self.snapshot_index - 1) as usize..].to_vec()
        };

        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.config.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let peer_id = peer.node_id().to_string();
            match transport.send_append(&peer, request).await {
                Ok(response) => {
                    let _ = events
                        .send(NodeEvent::AppendReply {
                            peer_id,
                            response,
                            sent_up_to,
                        })
                        .await;
                }
                Err(e) => {
                    RAFT_RPC_FAILURES_TOTAL.with_label_values(&[e.kind()]).inc();
                    debug!(peer_id = %peer_id, error = %e, "AppendEntries RPC failed");
                }
            }
        });
    }

    // ── Proposals ─────────────────────────────────────────────────────────────

    fn handle_propose(
        &mut self,
        command: Command,
        reply: oneshot::Sender<Result<u64, ProposeError>>,
    ) {
        if self.role != Role::Leader {
            RAFT_PROPOSALS_TOTAL.with_label_values(&["not_leader"]).inc();
            let _ = reply.send(Err(ProposeError::Consensus(ConsensusError::NotLeader(
                self.leader_id.clone(),
            ))));
            return;
        }
        // Synchronous validation against committed + applied state; invalid
        // commands never reach the log.
        if let Err(e) = self.registry.validate(&command, &self.adapters) {
            RAFT_PROPOSALS_TOTAL.with_label_values(&["rejected"]).inc();
            let _ = reply.send(Err(ProposeError::Registry(e)));
            return;
        }

        let index = self.last_log_index() + 1;
        let entry = LogEntry::new(self.current_term, index, command);
        if let Some(wal) = &mut self.wal {
            if let Err(e) = wal.append_entry(&entry) {
                RAFT_PROPOSALS_TOTAL.with_label_values(&["persistence"]).inc();
                let _ = reply.send(Err(ProposeError::Consensus(ConsensusError::Persistence(
                    e.to_string(),
                ))));
                return;
            }
        }
        self.log.push(entry);
        self.pending.insert(
            index,
            PendingProposal {
                term: self.current_term,
                reply,
            },
        );
        RAFT_PROPOSALS_TOTAL.with_label_values(&["accepted"]).inc();

        // Replicate immediately rather than waiting for the heartbeat; this
        // also commits single-node clusters synchronously.
        self.maybe_advance_commit();
        self.broadcast_appends();
    }

    fn fail_pending(&mut self, error: ConsensusError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending
                .reply
                .send(Err(ProposeError::Consensus(error.clone())));
        }
    }

    // ── Apply ─────────────────────────────────────────────────────────────────

    /// Apply entries in `(last_applied, commit_index]` in index order, then
    /// publish the registry and complete pending proposals.
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let (command, timestamp_ms, term) = match self.entry_at(next) {
                Some(entry) => (entry.command.clone(), entry.timestamp_ms, entry.term),
                None => {
                    // Dense indexing makes this unreachable; guard anyway so
                    // a bug surfaces as a log line, not a wedged actor.
                    error!(node_id = %self.config.node_id, index = next, "Missing committed entry");
                    return;
                }
            };
            let outcome = self.registry.apply(&command, timestamp_ms, &self.adapters);
            self.last_applied = next;
            debug!(
                node_id = %self.config.node_id,
                index = next,
                term,
                command = command.tag(),
                outcome = ?outcome,
                "Applied committed entry"
            );
        }
        RAFT_COMMIT_INDEX.set(self.commit_index as i64);
        RAFT_APPLIED_INDEX.set(self.last_applied as i64);
        self.registry_tx.send_replace(self.registry.clone());

        // A proposal resolves only after its entry commits and applies.
        let completed: Vec<u64> = self
            .pending
            .range(..=self.commit_index)
            .map(|(index, _)| *index)
            .collect();
        for index in completed {
            if let Some(pending) = self.pending.remove(&index) {
                let result = if self.term_at(index) == Some(pending.term) {
                    Ok(index)
                } else {
                    Err(ProposeError::Consensus(ConsensusError::TermChanged))
                };
                let _ = pending.reply.send(result);
            }
        }

        self.maybe_snapshot();
    }

    /// Compact once the applied suffix outgrows the threshold. Failure is
    /// recoverable: the prior snapshot and full log remain.
    fn maybe_snapshot(&mut self) {
        if self.wal.is_none() {
            return;
        }
        if self.last_applied - self.snapshot_index < self.config.snapshot_threshold {
            return;
        }
        let last_included_index = self.last_applied;
        let last_included_term = match self.term_at(last_included_index) {
            Some(term) => term,
            None => return,
        };
        let wal = self.wal.as_mut().unwrap();
        match wal.snapshot(&self.registry, last_included_index, last_included_term) {
            Ok(()) => {
                let drop_count = (last_included_index - self.snapshot_index) as usize;
                self.log.drain(..drop_count);
                self.snapshot_index = last_included_index;
                self.snapshot_term = last_included_term;
                info!(
                    node_id = %self.config.node_id,
                    snapshot_index = last_included_index,
                    "Snapshot taken; log compacted"
                );
            }
            Err(e) => {
                warn!(node_id = %self.config.node_id, error = %e,
                    "Snapshot failed; keeping prior snapshot and log");
            }
        }
    }
}
