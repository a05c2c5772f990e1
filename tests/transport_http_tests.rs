//! Remote transport behaviour against a mocked HTTP peer.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hexafed::command::Command;
use hexafed::transport::{
    LocalDirectory, PeerRef, ProposeFailure, RaftTransport, VoteRequest,
};

fn remote_peer(server: &MockServer) -> PeerRef {
    PeerRef::Remote {
        node_id: "r1".into(),
        endpoint: server.uri(),
    }
}

fn vote_request() -> VoteRequest {
    VoteRequest {
        term: 3,
        candidate_id: "n1".into(),
        last_log_index: 7,
        last_log_term: 2,
    }
}

fn transport(timeout_ms: u64) -> RaftTransport {
    RaftTransport::new(Arc::new(LocalDirectory::new()), timeout_ms)
}

#[tokio::test]
async fn remote_vote_round_trips_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/raft/vote"))
        .and(body_partial_json(
            serde_json::json!({"term": 3, "candidate_id": "n1"}),
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"term": 3, "vote_granted": true})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = transport(1_000)
        .send_vote(&remote_peer(&server), vote_request())
        .await
        .unwrap();
    assert!(response.vote_granted);
    assert_eq!(response.term, 3);
}

#[tokio::test]
async fn non_200_is_a_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/raft/vote"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = transport(1_000)
        .send_vote(&remote_peer(&server), vote_request())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "http_status");
}

#[tokio::test]
async fn slow_peer_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/raft/vote"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"term": 3, "vote_granted": true}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let err = transport(100)
        .send_vote(&remote_peer(&server), vote_request())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn garbage_body_is_malformed_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/raft/vote"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = transport(1_000)
        .send_vote(&remote_peer(&server), vote_request())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "malformed_response");
}

#[tokio::test]
async fn propose_to_returns_the_committed_index() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/raft/propose"))
        .and(body_partial_json(serde_json::json!({"type": "noop"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true, "index": 12})),
        )
        .mount(&server)
        .await;

    let index = transport(1_000)
        .propose_to(&server.uri(), &Command::Noop)
        .await
        .unwrap();
    assert_eq!(index, 12);
}

#[tokio::test]
async fn propose_to_surfaces_the_leader_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/raft/propose"))
        .respond_with(ResponseTemplate::new(409).set_body_json(
            serde_json::json!({"error": "not_leader", "leader_id": "n2"}),
        ))
        .mount(&server)
        .await;

    let failure = transport(1_000)
        .propose_to(&server.uri(), &Command::Noop)
        .await
        .unwrap_err();
    match failure {
        ProposeFailure::Consensus(e) => {
            assert_eq!(e.kind(), "not_leader");
            assert!(e.to_string().contains("n2"));
        }
        other => panic!("expected a consensus failure, got {:?}", other),
    }
}

#[tokio::test]
async fn propose_to_surfaces_validation_rejects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/raft/propose"))
        .respond_with(ResponseTemplate::new(400).set_body_json(
            serde_json::json!({"error": "unknown_adapter", "message": "no such family"}),
        ))
        .mount(&server)
        .await;

    let failure = transport(1_000)
        .propose_to(&server.uri(), &Command::Noop)
        .await
        .unwrap_err();
    match failure {
        ProposeFailure::Rejected { error, message } => {
            assert_eq!(error, "unknown_adapter");
            assert_eq!(message.as_deref(), Some("no such family"));
        }
        other => panic!("expected a validation reject, got {:?}", other),
    }
}
