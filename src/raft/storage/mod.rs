//! OpenRaft storage-v2 adapters over [`crate::kv::KvStore`].
//!
//! - [`KvLogStore`] keeps the log, vote and commit marker under well-known keys.
//! - [`KvStateMachine`] applies entries to the in-memory fleet state and persists snapshots
//!   through the store's snapshot slot.

pub mod log_store;
pub mod state_machine;

pub use log_store::KvLogStore;
pub use state_machine::{KvSnapshotBuilder, KvStateMachine};

use openraft::{ErrorSubject, ErrorVerb};

use crate::{kv::KvError, raft::types::NodeId};

pub(crate) fn io_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: std::io::Error,
) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(subject, verb, err)
}

pub(crate) fn kv_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: KvError,
) -> openraft::StorageError<NodeId> {
    let io = match err {
        KvError::Io(e) => e,
        other => std::io::Error::other(other.to_string()),
    };
    io_err(subject, verb, io)
}

pub(crate) fn json_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: serde_json::Error,
) -> openraft::StorageError<NodeId> {
    io_err(subject, verb, std::io::Error::other(err))
}
