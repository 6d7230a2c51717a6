//! Follower-to-leader request forwarding over HTTP.
//!
//! Only the leader may propose log entries or change membership. Any other node resolves the
//! leader's service address from raft metrics and replays the request there, once; callers decide
//! whether to retry.

use std::{sync::Arc, time::Duration};

use reqwest::{Method, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::raft::{
    app::{RaftFacade, is_leader, leader_node},
    types::{NodeId, NodeMeta},
};

pub const INTERNAL_APPLY_PATH: &str = "/api/internal/apply";
pub const CLUSTER_JOIN_PATH: &str = "/api/cluster/join";
pub const CLUSTER_LEAVE_PATH: &str = "/api/cluster/leave";

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
/// Joining waits for the learner to catch up before promotion.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub node: NodeMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    NoLeaderAvailable,
    Timeout { leader: String },
    Transport { leader: String, message: String },
    /// The leader answered with a non-2xx status.
    Rejected { status: u16, body: String },
    /// A membership change executed on this node (as leader) failed.
    Membership(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoLeaderAvailable => write!(f, "no leader available"),
            Self::Timeout { leader } => write!(f, "forward to leader {leader} timed out"),
            Self::Transport { leader, message } => {
                write!(f, "forward to leader {leader} failed: {message}")
            }
            Self::Rejected { status, body } => {
                write!(f, "leader rejected forwarded request with status {status}: {body}")
            }
            Self::Membership(message) => write!(f, "membership change failed: {message}"),
        }
    }
}

impl std::error::Error for ForwardError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forwarded {
    /// This node is the leader; nothing was sent.
    HandleLocally,
    Response(ForwardedResponse),
}

/// Maps a node's membership metadata to the base URL of its client-facing HTTP service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressMapping {
    /// Added to the raft endpoint's port when a node advertises no `api_base_url`.
    pub port_offset: Option<i32>,
}

impl AddressMapping {
    pub fn service_address(&self, node: &NodeMeta) -> Option<String> {
        let explicit = node.api_base_url.trim();
        if !explicit.is_empty() {
            return Some(explicit.trim_end_matches('/').to_string());
        }

        let offset = self.port_offset?;
        let raw = node.raft_endpoint.trim();
        let mut url = if raw.contains("://") {
            reqwest::Url::parse(raw).ok()?
        } else {
            reqwest::Url::parse(&format!("http://{raw}")).ok()?
        };
        let port = i32::from(url.port_or_known_default()?);
        let mapped = u16::try_from(port + offset).ok()?;
        url.set_port(Some(mapped)).ok()?;
        Some(url.origin().ascii_serialization())
    }
}

#[derive(Clone)]
pub struct LeaderForwarder {
    raft: Arc<dyn RaftFacade>,
    client: reqwest::Client,
    timeout: Duration,
    mapping: AddressMapping,
}

impl LeaderForwarder {
    pub fn try_new(
        raft: Arc<dyn RaftFacade>,
        timeout: Duration,
        mapping: AddressMapping,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            raft,
            client,
            timeout,
            mapping,
        })
    }

    pub fn is_leader(&self) -> bool {
        is_leader(&self.raft.metrics().borrow())
    }

    /// Service address of the current leader (this node's own when it leads).
    pub fn leader_address(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        leader_node(&metrics).and_then(|(_, node)| self.mapping.service_address(&node))
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    pub async fn forward_to_leader(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Forwarded, ForwardError> {
        self.forward_with_timeout(method, path, body, self.timeout)
            .await
    }

    async fn forward_with_timeout(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Forwarded, ForwardError> {
        if self.is_leader() {
            return Ok(Forwarded::HandleLocally);
        }
        let leader = self
            .leader_address()
            .ok_or(ForwardError::NoLeaderAvailable)?;
        debug!(%method, path, %leader, "forwarding request to leader");
        let resp = self.send(&leader, method, path, body, timeout).await?;
        Ok(Forwarded::Response(resp))
    }

    async fn send(
        &self,
        base_url: &str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ForwardedResponse, ForwardError> {
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut req = self.client.request(method, url).timeout(timeout);
        if let Some(body) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(body);
        }

        let classify = |err: reqwest::Error| {
            if err.is_timeout() {
                ForwardError::Timeout {
                    leader: base_url.to_string(),
                }
            } else {
                ForwardError::Transport {
                    leader: base_url.to_string(),
                    message: err.to_string(),
                }
            }
        };
        let resp = req.send().await.map_err(classify)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(classify)?;
        if !status.is_success() {
            return Err(ForwardError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(ForwardedResponse {
            status: status.as_u16(),
            body: bytes.to_vec(),
        })
    }

    /// Adds `node_id` as a voter, locally when leading, otherwise through the leader.
    pub async fn join_cluster(&self, node_id: NodeId, node: NodeMeta) -> Result<(), ForwardError> {
        let body = encode(&JoinRequest {
            node_id,
            node: node.clone(),
        })?;
        match self
            .forward_with_timeout(Method::POST, CLUSTER_JOIN_PATH, Some(body), MEMBERSHIP_TIMEOUT)
            .await?
        {
            Forwarded::HandleLocally => {
                info!(node_id, "adding voter");
                self.raft
                    .add_voter(node_id, node)
                    .await
                    .map_err(|e| ForwardError::Membership(format!("{e:#}")))
            }
            Forwarded::Response(_) => Ok(()),
        }
    }

    pub async fn leave_cluster(&self, node_id: NodeId) -> Result<(), ForwardError> {
        let body = encode(&LeaveRequest { node_id })?;
        match self
            .forward_with_timeout(Method::POST, CLUSTER_LEAVE_PATH, Some(body), MEMBERSHIP_TIMEOUT)
            .await?
        {
            Forwarded::HandleLocally => {
                info!(node_id, "removing node");
                self.raft
                    .remove_node(node_id)
                    .await
                    .map_err(|e| ForwardError::Membership(format!("{e:#}")))
            }
            Forwarded::Response(_) => Ok(()),
        }
    }

    /// Asks the node at `seed` to add this node. Used before this node knows any leader; a seed
    /// that is not the leader answers 409 with the leader's address, which is tried once.
    pub async fn join_via(
        &self,
        seed: &str,
        node_id: NodeId,
        node: NodeMeta,
    ) -> Result<(), ForwardError> {
        let body = encode(&JoinRequest { node_id, node })?;
        match self
            .send(seed, Method::POST, CLUSTER_JOIN_PATH, Some(body.clone()), MEMBERSHIP_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(ForwardError::Rejected { status: 409, body: reply }) => {
                let Some(leader) = leader_hint(&reply).filter(|l| l.as_str() != seed) else {
                    return Err(ForwardError::Rejected {
                        status: 409,
                        body: reply,
                    });
                };
                debug!(%leader, "seed is not the leader, retrying join there");
                self.send(&leader, Method::POST, CLUSTER_JOIN_PATH, Some(body), MEMBERSHIP_TIMEOUT)
                    .await
                    .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ForwardError> {
    serde_json::to_vec(value).map_err(|e| ForwardError::Membership(e.to_string()))
}

/// Reads `error.details.leader` from a `not_leader` error body.
fn leader_hint(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/details/leader")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
