use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::{
    domain::DomainError,
    state::{ApplyOutcome, Command},
};

pub type NodeId = u64;

/// Node metadata carried in the raft membership config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default)]
    pub name: String,

    /// Client-facing HTTP base URL. Followers forward writes here when this node leads.
    #[serde(default)]
    pub api_base_url: String,

    /// Base URL serving `/raft/*` RPCs.
    pub raft_endpoint: String,
}

/// Result of a committed command, identical on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientResponse {
    Ok { result: ApplyOutcome },
    Err { error: DomainError },
}

impl ClientResponse {
    pub fn into_result(self) -> Result<ApplyOutcome, DomainError> {
        match self {
            Self::Ok { result } => Ok(result),
            Self::Err { error } => Err(error),
        }
    }
}

impl From<Result<ApplyOutcome, DomainError>> for ClientResponse {
    fn from(value: Result<ApplyOutcome, DomainError>) -> Self {
        match value {
            Ok(result) => Self::Ok { result },
            Err(error) => Self::Err { error },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeConfig;

impl openraft::RaftTypeConfig for TypeConfig {
    type D = Command;
    type R = ClientResponse;

    type NodeId = NodeId;
    type Node = NodeMeta;

    type Entry = openraft::impls::Entry<TypeConfig>;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
    type AsyncRuntime = openraft::impls::TokioRuntime;

    // Requires tokio `io-util` feature for AsyncRead/Write/Seek impls on Cursor.
    type SnapshotData = Cursor<Vec<u8>>;
}
