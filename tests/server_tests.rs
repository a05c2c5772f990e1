//! End-to-end HTTP surface: a real node behind a real listener, driven
//! through the wire protocol.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use hexafed::adapter::AdapterRegistry;
use hexafed::command::Command;
use hexafed::config::NodeConfig;
use hexafed::consensus::ConsensusNode;
use hexafed::modality::Modality;
use hexafed::server;
use hexafed::transport::{LocalDirectory, RaftTransport};

/// Pick a free port by binding to 0 and releasing it just before serving.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("could not find a free port")
}

async fn start_single_node_server() -> (ConsensusNode, String) {
    let directory = Arc::new(LocalDirectory::new());
    let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
    let node = ConsensusNode::spawn(NodeConfig::single_node("solo"), adapters, directory).unwrap();

    let port = free_port();
    let bind_addr = format!("127.0.0.1:{}", port);
    tokio::spawn(server::serve(bind_addr.clone(), node.clone()));
    let base = format!("http://{}", bind_addr);

    // Wait for the listener and for the node's self-election.
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(resp) = client.get(format!("{}/health/cluster", base)).send().await {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                if body["role"] == "leader" {
                    break;
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "server never became ready"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    (node, base)
}

#[tokio::test]
async fn health_endpoint_reports_node_diagnostics() {
    let (node, base) = start_single_node_server().await;

    let body: serde_json::Value = reqwest::get(format!("{}/health/cluster", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["node_id"], "solo");
    assert_eq!(body["role"], "leader");
    assert_eq!(body["leader_id"], "solo");
    assert!(body["current_term"].as_u64().unwrap() >= 1);

    node.shutdown().await;
}

#[tokio::test]
async fn propose_over_the_wire_commits_and_is_visible() {
    let (node, base) = start_single_node_server().await;
    let transport = RaftTransport::new(Arc::new(LocalDirectory::new()), 1_000);

    let command = Command::RegisterStore {
        store_id: "es-1".into(),
        endpoint: "http://es-1:9200".into(),
        adapter_type: "elasticsearch".into(),
        adapter_config: BTreeMap::new(),
        modalities: vec![Modality::Document, Modality::Semantic],
    };
    let index = transport.propose_to(&base, &command).await.unwrap();
    assert!(index >= 1);

    // The proposal only resolves after apply, so the store is visible at
    // once through the diagnostics surface.
    let body: serde_json::Value = reqwest::get(format!("{}/health/cluster", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["stores"], 1);

    node.shutdown().await;
}

#[tokio::test]
async fn propose_rejects_carry_wire_tags() {
    let (node, base) = start_single_node_server().await;
    let transport = RaftTransport::new(Arc::new(LocalDirectory::new()), 1_000);

    let command = Command::UnregisterStore {
        store_id: "ghost".into(),
    };
    let failure = transport.propose_to(&base, &command).await.unwrap_err();
    match failure {
        hexafed::transport::ProposeFailure::Rejected { error, .. } => {
            assert_eq!(error, "unknown_store");
        }
        other => panic!("expected a validation reject, got {:?}", other),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn stale_vote_requests_are_refused() {
    let (node, base) = start_single_node_server().await;

    // The node is a leader at term ≥ 1; a term-0 candidate is stale.
    let client = reqwest::Client::new();
    let body: serde_json::Value = client
        .post(format!("{}/raft/vote", base))
        .json(&serde_json::json!({
            "term": 0,
            "candidate_id": "intruder",
            "last_log_index": 0,
            "last_log_term": 0
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["vote_granted"], false);

    node.shutdown().await;
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let (node, base) = start_single_node_server().await;
    let status = reqwest::get(format!("{}/raft/unknown", base))
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 404);
    node.shutdown().await;
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let (node, base) = start_single_node_server().await;
    let response = reqwest::get(format!("{}/metrics", base)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let content_type = response
        .headers()
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    node.shutdown().await;
}
