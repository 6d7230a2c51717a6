use std::{sync::Arc, time::Duration};

use reqwest::Method;
use tracing::debug;

use crate::{
    domain::DomainError,
    raft::{
        app::{RaftFacade, RaftWriteError},
        forward::{
            AddressMapping, DEFAULT_FORWARD_TIMEOUT, ForwardError, Forwarded, INTERNAL_APPLY_PATH,
            LeaderForwarder,
        },
        types::{ClientResponse, NodeId, NodeMeta},
    },
    state::{ApplyOutcome, Command, FleetStateMachine},
};

pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSettings {
    pub apply_timeout: Duration,
    pub forward_timeout: Duration,
    pub address_mapping: AddressMapping,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            address_mapping: AddressMapping::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The command was committed and the state machine refused it.
    Rejected(DomainError),
    /// Lost leadership between the check and the proposal.
    NotLeader { leader_id: Option<NodeId> },
    Forward(ForwardError),
    /// The outcome is unknown: the entry may still commit.
    Timeout,
    Raft(String),
    /// The leader's reply could not be decoded.
    InvalidResponse(String),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "{e}"),
            Self::NotLeader {
                leader_id: Some(id),
            } => write!(f, "not leader (leader is node {id})"),
            Self::NotLeader { leader_id: None } => write!(f, "not leader"),
            Self::Forward(e) => write!(f, "{e}"),
            Self::Timeout => write!(f, "apply timed out; outcome unknown"),
            Self::Raft(message) => write!(f, "raft error: {message}"),
            Self::InvalidResponse(message) => write!(f, "invalid leader response: {message}"),
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::Forward(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ForwardError> for ApplyError {
    fn from(value: ForwardError) -> Self {
        Self::Forward(value)
    }
}

/// One cluster member: the local state machine, its raft handle, and the path to the leader.
///
/// Writes may be submitted on any node; reads are served from the local state machine.
#[derive(Clone)]
pub struct FleetNode {
    node_id: NodeId,
    raft: Arc<dyn RaftFacade>,
    fsm: Arc<FleetStateMachine>,
    forwarder: LeaderForwarder,
    apply_timeout: Duration,
}

impl FleetNode {
    pub fn new(
        node_id: NodeId,
        raft: Arc<dyn RaftFacade>,
        fsm: Arc<FleetStateMachine>,
        settings: NodeSettings,
    ) -> anyhow::Result<Self> {
        let forwarder = LeaderForwarder::try_new(
            raft.clone(),
            settings.forward_timeout,
            settings.address_mapping,
        )?;
        Ok(Self {
            node_id,
            raft,
            fsm,
            forwarder,
            apply_timeout: settings.apply_timeout,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn raft(&self) -> &Arc<dyn RaftFacade> {
        &self.raft
    }

    pub fn state(&self) -> &Arc<FleetStateMachine> {
        &self.fsm
    }

    pub fn is_leader(&self) -> bool {
        self.forwarder.is_leader()
    }

    pub fn leader_address(&self) -> Option<String> {
        self.forwarder.leader_address()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.forwarder.leader_id()
    }

    /// Replicates `command` and returns its committed outcome, forwarding to the leader when
    /// this node does not lead.
    pub async fn apply(&self, command: Command) -> Result<ApplyOutcome, ApplyError> {
        let body = serde_json::to_vec(&command)
            .map_err(|e| ApplyError::InvalidResponse(e.to_string()))?;
        match self
            .forwarder
            .forward_to_leader(Method::POST, INTERNAL_APPLY_PATH, Some(body))
            .await?
        {
            Forwarded::HandleLocally => self.apply_local(command).await,
            Forwarded::Response(resp) => {
                let resp: ClientResponse = serde_json::from_slice(&resp.body)
                    .map_err(|e| ApplyError::InvalidResponse(e.to_string()))?;
                resp.into_result().map_err(ApplyError::Rejected)
            }
        }
    }

    pub async fn apply_local(&self, command: Command) -> Result<ApplyOutcome, ApplyError> {
        self.propose(command)
            .await?
            .into_result()
            .map_err(ApplyError::Rejected)
    }

    /// Proposes to the local raft instance without forwarding. Domain rejections are part of
    /// the returned response.
    pub async fn propose(&self, command: Command) -> Result<ClientResponse, ApplyError> {
        let kind = command.kind;
        match tokio::time::timeout(self.apply_timeout, self.raft.client_write(command)).await {
            Err(_) => {
                debug!(?kind, "apply timed out");
                Err(ApplyError::Timeout)
            }
            Ok(Err(RaftWriteError::ForwardToLeader { leader_id })) => {
                Err(ApplyError::NotLeader { leader_id })
            }
            Ok(Err(RaftWriteError::Fatal(message))) => Err(ApplyError::Raft(message)),
            Ok(Ok(resp)) => Ok(resp),
        }
    }

    pub async fn join_cluster(&self, node_id: NodeId, node: NodeMeta) -> Result<(), ForwardError> {
        self.forwarder.join_cluster(node_id, node).await
    }

    pub async fn leave_cluster(&self, node_id: NodeId) -> Result<(), ForwardError> {
        self.forwarder.leave_cluster(node_id).await
    }

    pub async fn join_via(&self, seed: &str, node: NodeMeta) -> Result<(), ForwardError> {
        self.forwarder.join_via(seed, self.node_id, node).await
    }
}
