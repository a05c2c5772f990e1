//! Multi-node consensus scenarios over the in-process transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hexafed::adapter::AdapterRegistry;
use hexafed::command::Command;
use hexafed::config::NodeConfig;
use hexafed::consensus::{ConsensusNode, NodeStatus};
use hexafed::modality::Modality;
use hexafed::transport::{LocalDirectory, PeerRef};

fn node_config(node_id: &str, all_ids: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::single_node(node_id);
    config.peers = all_ids
        .iter()
        .filter(|id| **id != node_id)
        .map(|id| PeerRef::Local(id.to_string()))
        .collect();
    config
}

fn spawn_cluster(
    ids: &[&str],
    directory: &Arc<LocalDirectory>,
) -> Vec<ConsensusNode> {
    let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
    ids.iter()
        .map(|id| {
            ConsensusNode::spawn(node_config(id, ids), adapters.clone(), directory.clone())
                .expect("node spawn failed")
        })
        .collect()
}

async fn wait_for_leader(nodes: &[ConsensusNode], timeout: Duration) -> (usize, NodeStatus) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for (i, node) in nodes.iter().enumerate() {
            if let Some(status) = node.status().await {
                if status.role == "leader" {
                    return (i, status);
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no leader elected within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn register_store_cmd(store_id: &str, modalities: Vec<Modality>) -> Command {
    Command::RegisterStore {
        store_id: store_id.into(),
        endpoint: format!("http://{}:9200", store_id),
        adapter_type: "elasticsearch".into(),
        adapter_config: BTreeMap::new(),
        modalities,
    }
}

// --- Leader election ---

#[tokio::test]
async fn three_node_cluster_elects_exactly_one_leader() {
    let directory = Arc::new(LocalDirectory::new());
    let nodes = spawn_cluster(&["n1", "n2", "n3"], &directory);

    let (_, leader_status) = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    assert!(leader_status.current_term >= 1);

    // Give heartbeats a moment to settle, then every node must agree on
    // the same leader and term.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut leaders = Vec::new();
    let mut leader_ids = Vec::new();
    let mut terms = Vec::new();
    for node in &nodes {
        let status = node.status().await.unwrap();
        if status.role == "leader" {
            leaders.push(status.node_id.clone());
        }
        leader_ids.push(status.leader_id.clone());
        terms.push(status.current_term);
    }
    assert_eq!(leaders.len(), 1, "exactly one leader, saw {:?}", leaders);
    assert!(
        leader_ids.iter().all(|id| id.as_deref() == Some(leaders[0].as_str())),
        "all nodes must point at the same leader: {:?}",
        leader_ids
    );
    assert!(terms.iter().all(|t| *t == terms[0]), "terms agree: {:?}", terms);

    for node in &nodes {
        node.shutdown().await;
    }
}

// --- Proposal and apply ---

#[tokio::test]
async fn committed_proposal_applies_on_every_node() {
    let directory = Arc::new(LocalDirectory::new());
    let nodes = spawn_cluster(&["n1", "n2", "n3"], &directory);
    let (leader_idx, _) = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    // neo4j with the vector-index extension supports both declared
    // modalities, so nothing is clipped.
    let mut adapter_config = BTreeMap::new();
    adapter_config.insert("extensions".to_string(), "vector".to_string());
    let index = nodes[leader_idx]
        .propose(Command::RegisterStore {
            store_id: "s1".into(),
            endpoint: "http://s1:7474".into(),
            adapter_type: "neo4j".into(),
            adapter_config,
            modalities: vec![Modality::Graph, Modality::Vector],
        })
        .await
        .expect("proposal should commit");
    assert!(index >= 1, "index should be positive, got {}", index);

    // Heartbeats propagate leader_commit; all three registries converge.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    'outer: loop {
        let mut ready = 0;
        for node in &nodes {
            let registry = node.registry().borrow().clone();
            if let Some(store) = registry.store("s1") {
                assert_eq!(store.trust_level, 1.0);
                assert!(store.modalities.contains(&Modality::Graph));
                assert!(store.modalities.contains(&Modality::Vector));
                ready += 1;
            }
        }
        if ready == nodes.len() {
            break 'outer;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry did not converge on all nodes"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn proposal_to_follower_returns_not_leader_with_hint() {
    let directory = Arc::new(LocalDirectory::new());
    let nodes = spawn_cluster(&["n1", "n2", "n3"], &directory);
    let (leader_idx, leader_status) = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let follower_idx = (leader_idx + 1) % nodes.len();
    let err = nodes[follower_idx]
        .propose(Command::Noop)
        .await
        .expect_err("follower must reject proposals");
    assert_eq!(err.kind(), "not_leader");
    assert_eq!(err.leader_id(), Some(leader_status.node_id.as_str()));

    for node in &nodes {
        node.shutdown().await;
    }
}

// --- Validation gate ---

#[tokio::test]
async fn invalid_commands_never_reach_the_log() {
    let directory = Arc::new(LocalDirectory::new());
    let nodes = spawn_cluster(&["solo"], &directory);
    let (leader_idx, _) = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let before = nodes[leader_idx].status().await.unwrap().log_length;

    let err = nodes[leader_idx]
        .propose(Command::RegisterStore {
            store_id: "s1".into(),
            endpoint: "http://s1:1".into(),
            adapter_type: "duckdb".into(),
            adapter_config: BTreeMap::new(),
            modalities: vec![],
        })
        .await
        .expect_err("unknown adapter must be rejected");
    assert_eq!(err.kind(), "unknown_adapter");

    let err = nodes[leader_idx]
        .propose(Command::UpdateTrust {
            store_id: "nope".into(),
            trust_level: 0.5,
        })
        .await
        .expect_err("unknown store must be rejected");
    assert_eq!(err.kind(), "unknown_store");

    let after = nodes[leader_idx].status().await.unwrap().log_length;
    assert_eq!(before, after, "rejected proposals must not append entries");

    nodes[0].shutdown().await;
}

// --- Follower catch-up ---

#[tokio::test]
async fn late_joining_follower_catches_up() {
    let directory = Arc::new(LocalDirectory::new());
    // n3 is configured everywhere but not started yet: RPCs to it simply
    // fail until it registers, like a stopped process.
    let ids = ["n1", "n2", "n3"];
    let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
    let n1 = ConsensusNode::spawn(node_config("n1", &ids), adapters.clone(), directory.clone())
        .unwrap();
    let n2 = ConsensusNode::spawn(node_config("n2", &ids), adapters.clone(), directory.clone())
        .unwrap();
    let running = vec![n1, n2];
    let (leader_idx, _) = wait_for_leader(&running, Duration::from_secs(2)).await;

    // Commit under the two-node majority while n3 is down.
    running[leader_idx]
        .propose(register_store_cmd("s1", vec![Modality::Document]))
        .await
        .expect("two of three is a majority");
    for i in 0..50 {
        running[leader_idx]
            .propose(Command::MapHexad {
                hexad_id: format!("hx-{}", i),
                locations: vec!["s1".into()],
                primary_store: None,
            })
            .await
            .expect("mapping should commit");
    }

    // n3 arrives late and must replicate the whole history.
    let n3 = ConsensusNode::spawn(node_config("n3", &ids), adapters, directory.clone()).unwrap();
    let leader_applied = running[leader_idx].status().await.unwrap().last_applied;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        let status = n3.status().await.unwrap();
        let registry = n3.registry().borrow().clone();
        if status.last_applied >= leader_applied && registry.hexads.len() == 50 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "n3 did not catch up: applied {} of {}, hexads {}",
            status.last_applied,
            leader_applied,
            registry.hexads.len()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for node in running.iter().chain(std::iter::once(&n3)) {
        node.shutdown().await;
    }
}

// --- Leader crash ---

#[tokio::test]
async fn surviving_nodes_elect_a_new_leader_after_crash() {
    let directory = Arc::new(LocalDirectory::new());
    let nodes = spawn_cluster(&["n1", "n2", "n3"], &directory);
    let (leader_idx, old_status) = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    nodes[leader_idx].shutdown().await;

    let survivors: Vec<ConsensusNode> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader_idx)
        .map(|(_, n)| n.clone())
        .collect();
    let (_, new_status) = wait_for_leader(&survivors, Duration::from_secs(2)).await;
    assert!(
        new_status.current_term > old_status.current_term,
        "new leader must hold a later term"
    );
    assert_ne!(new_status.node_id, old_status.node_id);

    for node in &survivors {
        node.shutdown().await;
    }
}

// --- Single-node semantics ---

#[tokio::test]
async fn single_node_cluster_commits_synchronously() {
    let directory = Arc::new(LocalDirectory::new());
    let nodes = spawn_cluster(&["solo"], &directory);
    wait_for_leader(&nodes, Duration::from_secs(2)).await;

    let index = nodes[0]
        .propose(register_store_cmd("s1", vec![Modality::Document]))
        .await
        .unwrap();
    // The leadership noop consumed an index before us.
    assert!(index >= 2);

    let registry = nodes[0].registry().borrow().clone();
    assert!(registry.store("s1").is_some(), "read-your-writes after ok");

    let status = nodes[0].status().await.unwrap();
    assert_eq!(status.commit_index, status.last_applied);
    assert_eq!(status.commit_index, index);

    nodes[0].shutdown().await;
}
