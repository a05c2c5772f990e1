//! HTTP surface of one orchestration node.
//!
//! | Route | Method | Body |
//! |---|---|---|
//! | `/raft/vote` | POST | `VoteRequest` → `VoteResponse` |
//! | `/raft/append` | POST | `AppendEntriesRequest` → `AppendEntriesResponse` |
//! | `/raft/propose` | POST | `Command` → `{ok, index}` or `{error, leader_id?}` |
//! | `/health/cluster` | GET | node diagnostics JSON |
//! | `/metrics` | GET | Prometheus text |
//!
//! Every non-200 reply is treated as a transport failure by Raft callers;
//! proposal rejections carry a machine-readable `error` tag plus an
//! optional `leader_id` hint so clients can retry against the leader.

use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::command::Command;
use crate::consensus::ConsensusNode;
use crate::errors::ProposeError;
use crate::metrics::encode_metrics;
use crate::transport::{AppendEntriesRequest, InboundRpc, VoteRequest};

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn bad_request(message: &str) -> Response<Body> {
    json_response(
        StatusCode::BAD_REQUEST,
        json!({"error": "malformed_request", "message": message}),
    )
}

fn unavailable() -> Response<Body> {
    json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": "node_unavailable"}),
    )
}

async fn handle(req: Request<Body>, node: ConsensusNode) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (method, path.as_str()) {
        (Method::POST, "/raft/vote") => {
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let request: VoteRequest = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(e) => return Ok(bad_request(&e.to_string())),
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if node
                .rpc_handle()
                .send(InboundRpc::Vote {
                    request,
                    reply: reply_tx,
                })
                .await
                .is_err()
            {
                return Ok(unavailable());
            }
            match reply_rx.await {
                Ok(response) => Ok(json_response(
                    StatusCode::OK,
                    serde_json::to_value(response).unwrap_or_default(),
                )),
                Err(_) => Ok(unavailable()),
            }
        }

        (Method::POST, "/raft/append") => {
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let request: AppendEntriesRequest = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(e) => return Ok(bad_request(&e.to_string())),
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if node
                .rpc_handle()
                .send(InboundRpc::Append {
                    request,
                    reply: reply_tx,
                })
                .await
                .is_err()
            {
                return Ok(unavailable());
            }
            match reply_rx.await {
                Ok(response) => Ok(json_response(
                    StatusCode::OK,
                    serde_json::to_value(response).unwrap_or_default(),
                )),
                Err(_) => Ok(unavailable()),
            }
        }

        (Method::POST, "/raft/propose") => {
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let command: Command = match serde_json::from_slice(&bytes) {
                Ok(c) => c,
                Err(e) => return Ok(bad_request(&e.to_string())),
            };
            match node.propose(command).await {
                Ok(index) => Ok(json_response(
                    StatusCode::OK,
                    json!({"ok": true, "index": index}),
                )),
                Err(e) => Ok(propose_error_response(e)),
            }
        }

        (Method::GET, "/health/cluster") => match node.status().await {
            Some(status) => Ok(json_response(
                StatusCode::OK,
                serde_json::to_value(status).unwrap_or_default(),
            )),
            None => Ok(unavailable()),
        },

        (Method::GET, "/metrics") => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Body::from(encode_metrics()))
            .unwrap_or_else(|_| Response::new(Body::empty()))),

        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            json!({"error": "not_found"}),
        )),
    }
}

/// Map a proposal failure to its wire shape: consensus outcomes are 409
/// (retryable against another node), validation rejects are 400 and
/// persistence trouble is 500.
fn propose_error_response(error: ProposeError) -> Response<Body> {
    use crate::errors::ConsensusError;

    let mut body = json!({"error": error.kind(), "message": error.to_string()});
    if let Some(leader_id) = error.leader_id() {
        body["leader_id"] = json!(leader_id);
    }
    let status = match &error {
        ProposeError::Consensus(ConsensusError::NotLeader(_))
        | ProposeError::Consensus(ConsensusError::TermChanged) => StatusCode::CONFLICT,
        ProposeError::Consensus(ConsensusError::Persistence(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ProposeError::Consensus(_) => StatusCode::SERVICE_UNAVAILABLE,
        ProposeError::Registry(_) => StatusCode::BAD_REQUEST,
    };
    json_response(status, body)
}

/// Serve the node's HTTP surface until the process exits.
pub async fn serve(bind_addr: String, node: ConsensusNode) {
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(bind_addr = %bind_addr, error = %e, "Invalid bind address");
            return;
        }
    };

    let make_svc = make_service_fn(move |_conn| {
        let node = node.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let node = node.clone();
                async move { handle(req, node).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(addr = %addr, "Raft RPC + diagnostics endpoint started");
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ConsensusError, RegistryError};

    #[test]
    fn propose_errors_map_to_statuses() {
        let resp = propose_error_response(ProposeError::Consensus(ConsensusError::NotLeader(
            Some("n2".into()),
        )));
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = propose_error_response(ProposeError::Registry(RegistryError::UnknownAdapter(
            "x".into(),
        )));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = propose_error_response(ProposeError::Consensus(ConsensusError::Persistence(
            "disk".into(),
        )));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
