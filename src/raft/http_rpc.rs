use axum::{Json, Router, extract::State, routing::post};
use openraft::{
    error::{InstallSnapshotError, RaftError},
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, VoteRequest, VoteResponse,
    },
};
use tracing::debug;

use crate::raft::{
    network_http::{APPEND_PATH, SNAPSHOT_PATH, VOTE_PATH},
    types::{NodeId, TypeConfig},
};

#[derive(Clone)]
pub struct RaftRpcState {
    pub raft: openraft::Raft<TypeConfig>,
}

/// Peer-facing routes consumed by [`crate::raft::network_http::HttpNetwork`].
pub fn build_raft_rpc_router(state: RaftRpcState) -> Router {
    Router::new()
        .route(APPEND_PATH, post(append_entries))
        .route(VOTE_PATH, post(vote))
        .route(SNAPSHOT_PATH, post(install_snapshot))
        .with_state(state)
}

async fn append_entries(
    State(state): State<RaftRpcState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    traced("append_entries", state.raft.append_entries(req).await)
}

async fn vote(
    State(state): State<RaftRpcState>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    traced("vote", state.raft.vote(req).await)
}

async fn install_snapshot(
    State(state): State<RaftRpcState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    traced("install_snapshot", state.raft.install_snapshot(req).await)
}

fn traced<T, E: std::fmt::Display>(rpc: &'static str, res: Result<T, E>) -> Json<Result<T, E>> {
    if let Err(err) = &res {
        debug!(rpc, %err, "raft rpc failed locally");
    }
    Json(res)
}
