use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::Arc,
};

use anyhow::Context;
use openraft::{ChangeMembers, RaftMetrics, ServerState, error::ClientWriteError};
use tokio::sync::watch;
use tracing::info;

use crate::{
    raft::types::{ClientResponse, NodeId, NodeMeta, TypeConfig},
    state::{Command, FleetStateMachine},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftWriteError {
    /// This node cannot accept writes; `leader_id` is openraft's best guess at who can.
    ForwardToLeader { leader_id: Option<NodeId> },
    Fatal(String),
}

impl std::fmt::Display for RaftWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForwardToLeader {
                leader_id: Some(id),
            } => write!(f, "not leader (leader is node {id})"),
            Self::ForwardToLeader { leader_id: None } => write!(f, "not leader (leader unknown)"),
            Self::Fatal(message) => write!(f, "raft client_write: {message}"),
        }
    }
}

impl std::error::Error for RaftWriteError {}

/// The slice of openraft the rest of the crate talks to.
pub trait RaftFacade: Send + Sync + 'static {
    fn metrics(&self) -> watch::Receiver<RaftMetrics<NodeId, NodeMeta>>;

    fn client_write(&self, cmd: Command) -> BoxFuture<'_, Result<ClientResponse, RaftWriteError>>;

    /// Adds `node_id` as a learner, waits for it to catch up, then promotes it to voter.
    fn add_voter(&self, node_id: NodeId, node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>>;

    fn remove_node(&self, node_id: NodeId) -> BoxFuture<'_, anyhow::Result<()>>;
}

pub fn is_leader(metrics: &RaftMetrics<NodeId, NodeMeta>) -> bool {
    matches!(metrics.state, ServerState::Leader)
}

/// The current leader and its membership metadata, when both are known.
pub fn leader_node(metrics: &RaftMetrics<NodeId, NodeMeta>) -> Option<(NodeId, NodeMeta)> {
    let leader_id = metrics.current_leader?;
    metrics
        .membership_config
        .nodes()
        .find(|(id, _node)| **id == leader_id)
        .map(|(id, node)| (*id, node.clone()))
}

#[derive(Clone)]
pub struct RealRaft {
    raft: openraft::Raft<TypeConfig>,
    metrics: watch::Receiver<RaftMetrics<NodeId, NodeMeta>>,
}

impl RealRaft {
    pub fn new(raft: openraft::Raft<TypeConfig>) -> Self {
        let metrics = raft.metrics();
        Self { raft, metrics }
    }

    pub fn raft(&self) -> openraft::Raft<TypeConfig> {
        self.raft.clone()
    }

    pub async fn initialize_single_node_if_needed(
        &self,
        node_id: NodeId,
        node_meta: NodeMeta,
    ) -> anyhow::Result<()> {
        let initialized = self
            .raft
            .is_initialized()
            .await
            .context("raft is_initialized")?;
        if initialized {
            return Ok(());
        }
        info!(node_id, "bootstrapping single-node cluster");
        self.raft
            .initialize(BTreeMap::from([(node_id, node_meta)]))
            .await
            .map_err(|e| anyhow::anyhow!("raft initialize: {e}"))?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("raft shutdown: {e}"))
    }
}

impl RaftFacade for RealRaft {
    fn metrics(&self) -> watch::Receiver<RaftMetrics<NodeId, NodeMeta>> {
        self.metrics.clone()
    }

    fn client_write(&self, cmd: Command) -> BoxFuture<'_, Result<ClientResponse, RaftWriteError>> {
        Box::pin(async move {
            match self.raft.client_write(cmd).await {
                Ok(resp) => Ok(resp.data),
                Err(err) => match err.api_error() {
                    Some(ClientWriteError::ForwardToLeader(forward)) => {
                        Err(RaftWriteError::ForwardToLeader {
                            leader_id: forward.leader_id,
                        })
                    }
                    _ => Err(RaftWriteError::Fatal(err.to_string())),
                },
            }
        })
    }

    fn add_voter(&self, node_id: NodeId, node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.raft
                .add_learner(node_id, node, true)
                .await
                .map_err(|e| anyhow::anyhow!("raft add_learner: {e}"))?;
            self.raft
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([node_id])), true)
                .await
                .map_err(|e| anyhow::anyhow!("raft change_membership(add_voter): {e}"))?;
            info!(node_id, "node joined as voter");
            Ok(())
        })
    }

    fn remove_node(&self, node_id: NodeId) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let metrics = self.metrics.borrow().clone();
            let is_voter = metrics
                .membership_config
                .membership()
                .voter_ids()
                .any(|id| id == node_id);
            if is_voter {
                self.raft
                    .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([node_id])), true)
                    .await
                    .map_err(|e| anyhow::anyhow!("raft change_membership(remove_voter): {e}"))?;
            }
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(BTreeSet::from([node_id])), false)
                .await
                .map_err(|e| anyhow::anyhow!("raft change_membership(remove_node): {e}"))?;
            info!(node_id, "node left the cluster");
            Ok(())
        })
    }
}

/// A raft stand-in that applies commands straight to a local state machine.
///
/// Its metrics are fixed at construction, which lets tests pose as a leader or a follower.
#[derive(Clone)]
pub struct LocalRaft {
    fsm: Arc<FleetStateMachine>,
    metrics: watch::Receiver<RaftMetrics<NodeId, NodeMeta>>,
}

impl LocalRaft {
    pub fn new(
        fsm: Arc<FleetStateMachine>,
        metrics: watch::Receiver<RaftMetrics<NodeId, NodeMeta>>,
    ) -> Self {
        Self { fsm, metrics }
    }

    pub fn leader(fsm: Arc<FleetStateMachine>, node_id: NodeId, meta: NodeMeta) -> Self {
        let metrics = static_metrics(
            node_id,
            ServerState::Leader,
            Some(node_id),
            BTreeMap::from([(node_id, meta)]),
        );
        Self::new(fsm, metrics)
    }

    /// A follower that believes `leader` leads (or that no leader exists).
    pub fn follower(
        fsm: Arc<FleetStateMachine>,
        node_id: NodeId,
        meta: NodeMeta,
        leader: Option<(NodeId, NodeMeta)>,
    ) -> Self {
        let mut nodes = BTreeMap::from([(node_id, meta)]);
        let leader_id = leader.map(|(id, meta)| {
            nodes.insert(id, meta);
            id
        });
        let metrics = static_metrics(node_id, ServerState::Follower, leader_id, nodes);
        Self::new(fsm, metrics)
    }
}

impl RaftFacade for LocalRaft {
    fn metrics(&self) -> watch::Receiver<RaftMetrics<NodeId, NodeMeta>> {
        self.metrics.clone()
    }

    fn client_write(&self, cmd: Command) -> BoxFuture<'_, Result<ClientResponse, RaftWriteError>> {
        Box::pin(async move {
            let metrics = self.metrics.borrow().clone();
            if !is_leader(&metrics) {
                return Err(RaftWriteError::ForwardToLeader {
                    leader_id: metrics.current_leader,
                });
            }
            Ok(ClientResponse::from(self.fsm.apply(cmd).await))
        })
    }

    fn add_voter(&self, _node_id: NodeId, _node: NodeMeta) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn remove_node(&self, _node_id: NodeId) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}

/// Builds a metrics channel frozen at the given leadership view, with every node a voter.
pub fn static_metrics(
    node_id: NodeId,
    state: ServerState,
    current_leader: Option<NodeId>,
    nodes: BTreeMap<NodeId, NodeMeta>,
) -> watch::Receiver<RaftMetrics<NodeId, NodeMeta>> {
    let mut metrics = RaftMetrics::new_initial(node_id);
    metrics.current_term = 1;
    metrics.state = state;
    metrics.current_leader = current_leader;
    let voters: BTreeSet<NodeId> = nodes.keys().copied().collect();
    let membership = openraft::Membership::new(vec![voters], nodes);
    metrics.membership_config = Arc::new(openraft::StoredMembership::new(None, membership));
    let (_tx, rx) = watch::channel(metrics);
    rx
}
