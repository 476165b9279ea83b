use crate::{NodeHandle, NodeHandles};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use syncpoint_core::block::BlockHash;
use syncpoint_core::checkpoint::{CheckpointError, CheckpointRelay, SendOutcome};
use warp::Filter;
use warp::{http::StatusCode, reply::with_status};

#[derive(Debug, Deserialize)]
pub struct SendCheckpointRequest {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckpointKeyRequest {
    pub key: String,
}

fn error_status(e: &CheckpointError) -> StatusCode {
    match e {
        CheckpointError::NoMasterKey
        | CheckpointError::InvalidKey(_)
        | CheckpointError::BadSignature
        | CheckpointError::MalformedMessage(_)
        | CheckpointError::NotApplied { .. } => StatusCode::BAD_REQUEST,
        CheckpointError::MissingIndex(_) => StatusCode::NOT_FOUND,
        CheckpointError::CorruptIndex(_)
        | CheckpointError::InactiveCheckpoint(_)
        | CheckpointError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(e: &CheckpointError) -> (StatusCode, Value) {
    (
        error_status(e),
        json!({ "status": "error", "message": e.to_string() }),
    )
}

/// `getcheckpoint`
pub fn checkpoint_status(node: &NodeHandles) -> Value {
    let index = node.index.read();
    let status = node.sync.status(&*index);
    serde_json::to_value(&status).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

/// `sendcheckpoint`
pub fn send_checkpoint(node: &NodeHandles, req: &SendCheckpointRequest) -> (StatusCode, Value) {
    let hash: BlockHash = match req.hash.trim().parse() {
        Ok(h) => h,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                json!({ "status": "error", "message": format!("invalid block hash: {}", e) }),
            );
        }
    };

    let result = {
        let index = node.index.read();
        node.sync.send_checkpoint(hash, &*index, node.p2p.as_ref())
    };
    match result {
        Ok(SendOutcome::Sent(hash)) => {
            log::info!("Checkpoint {} sent by operator", hash);
            (StatusCode::OK, json!({ "status": "sent", "hash": hash }))
        }
        Ok(SendOutcome::NoPeers) => (StatusCode::OK, json!({ "status": "no_peers" })),
        Ok(SendOutcome::NullCheckpoint) => (StatusCode::OK, json!({ "status": "null_checkpoint" })),
        Ok(SendOutcome::Manual | SendOutcome::Unchanged) => {
            (StatusCode::OK, json!({ "status": "unchanged" }))
        }
        Err(e) => {
            log::warn!("sendcheckpoint {} failed: {}", hash, e);
            error_body(&e)
        }
    }
}

/// `setcheckpointkey`
pub fn set_checkpoint_key(node: &NodeHandles, req: &CheckpointKeyRequest) -> (StatusCode, Value) {
    match node.sync.set_master_key(&req.key) {
        Ok(()) => (
            StatusCode::OK,
            json!({ "status": "ok", "master": node.sync.is_master() }),
        ),
        Err(e) => error_body(&e),
    }
}

pub fn health(node: &NodeHandles) -> Value {
    json!({
        "status": "ok",
        "height": node.height(),
        "peers": node.p2p.peer_count(),
        "uptime_seconds": node.node_start_time.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().timestamp()
    })
}

/// run_server expects NodeHandle (Arc<NodeHandles>)
pub async fn run_server(node: NodeHandle, addr: SocketAddr) {
    let node_filter = {
        let node = node.clone();
        warp::any().map(move || node.clone())
    };

    // GET /checkpoint
    let get_checkpoint = warp::path!("checkpoint")
        .and(warp::get())
        .and(node_filter.clone())
        .map(|node: NodeHandle| warp::reply::json(&checkpoint_status(&node)));

    // POST /checkpoint/send {"hash": "..."}
    let post_send = warp::path!("checkpoint" / "send")
        .and(warp::post())
        .and(warp::body::json())
        .and(node_filter.clone())
        .map(|req: SendCheckpointRequest, node: NodeHandle| {
            let (code, body) = send_checkpoint(&node, &req);
            with_status(warp::reply::json(&body), code)
        });

    // POST /checkpoint/key {"key": "..."}
    let post_key = warp::path!("checkpoint" / "key")
        .and(warp::post())
        .and(warp::body::json())
        .and(node_filter.clone())
        .map(|req: CheckpointKeyRequest, node: NodeHandle| {
            let (code, body) = set_checkpoint_key(&node, &req);
            with_status(warp::reply::json(&body), code)
        });

    // GET /health
    let health_check = warp::path!("health")
        .and(warp::get())
        .and(node_filter.clone())
        .map(|node: NodeHandle| warp::reply::json(&health(&node)));

    let routes = get_checkpoint
        .or(post_send)
        .or(post_key)
        .or(health_check)
        .with(warp::log("syncpoint::http"))
        .boxed();

    log::info!("HTTP server running at http://{}", addr);
    warp::serve(routes).run(addr).await;
}
