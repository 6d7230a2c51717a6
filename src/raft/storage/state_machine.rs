use std::{io::Cursor, sync::Arc};

use openraft::{
    EntryPayload, ErrorSubject, ErrorVerb, LogId, RaftSnapshotBuilder, Snapshot, SnapshotMeta,
    StoredMembership, entry::RaftPayload as _, storage::RaftStateMachine,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{io_err, json_err, kv_err};
use crate::{
    kv::KvStore,
    raft::types::{ClientResponse, NodeId, NodeMeta, TypeConfig},
    state::{ApplyOutcome, FleetState, FleetStateMachine, decode_snapshot, encode_snapshot},
};

/// What the KV snapshot slot holds: the raft metadata next to the copied state.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, NodeMeta>,
    state: FleetState,
}

#[derive(Debug, Default)]
struct AppliedState {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, NodeMeta>,
}

/// Drives [`FleetStateMachine`] from committed raft entries.
///
/// Applied metadata is not persisted per entry: on restart the state comes back from the latest
/// snapshot and openraft re-applies the committed log tail.
#[derive(Debug, Clone)]
pub struct KvStateMachine {
    fsm: Arc<FleetStateMachine>,
    kv: Arc<KvStore>,
    applied: Arc<Mutex<AppliedState>>,
}

impl KvStateMachine {
    pub async fn open(
        kv: Arc<KvStore>,
        fsm: Arc<FleetStateMachine>,
    ) -> Result<Self, openraft::StorageError<NodeId>> {
        let mut applied = AppliedState::default();
        if let Some(stored) = load_stored_snapshot(&kv).await? {
            info!(
                snapshot_id = %stored.meta.snapshot_id,
                "restoring state machine from snapshot"
            );
            fsm.replace(stored.state).await;
            applied.last_applied = stored.meta.last_log_id;
            applied.last_membership = stored.meta.last_membership;
        }
        Ok(Self {
            fsm,
            kv,
            applied: Arc::new(Mutex::new(applied)),
        })
    }

    pub fn fleet(&self) -> &Arc<FleetStateMachine> {
        &self.fsm
    }
}

async fn load_stored_snapshot(
    kv: &KvStore,
) -> Result<Option<StoredSnapshot>, openraft::StorageError<NodeId>> {
    let bytes = match kv.load_latest_snapshot().await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(kv_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| json_err(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))
}

async fn persist_snapshot(
    kv: &KvStore,
    meta: &SnapshotMeta<NodeId, NodeMeta>,
    state: FleetState,
) -> Result<(), openraft::StorageError<NodeId>> {
    let stored = StoredSnapshot {
        meta: meta.clone(),
        state,
    };
    let bytes = serde_json::to_vec(&stored)
        .map_err(|e| json_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
    kv.store_snapshot(&bytes)
        .await
        .map_err(|e| kv_err(ErrorSubject::Snapshot(None), ErrorVerb::Write, e))?;
    Ok(())
}

fn snapshot_data_err(err: crate::state::SnapshotError, verb: ErrorVerb) -> openraft::StorageError<NodeId> {
    io_err(
        ErrorSubject::Snapshot(None),
        verb,
        std::io::Error::other(err.to_string()),
    )
}

#[derive(Debug)]
pub struct KvSnapshotBuilder {
    fsm: Arc<FleetStateMachine>,
    kv: Arc<KvStore>,
    applied: Arc<Mutex<AppliedState>>,
}

impl RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(
        &mut self,
    ) -> Result<Snapshot<TypeConfig>, openraft::StorageError<NodeId>> {
        // Holding `applied` keeps the copy consistent with `last_applied`.
        let (last_applied, last_membership, state) = {
            let applied = self.applied.lock().await;
            (
                applied.last_applied,
                applied.last_membership.clone(),
                self.fsm.state().await,
            )
        };

        let bytes =
            encode_snapshot(&state).map_err(|e| snapshot_data_err(e, ErrorVerb::Write))?;
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id: format!(
                "snapshot-{}",
                last_applied.as_ref().map(|l| l.index).unwrap_or(0)
            ),
        };
        persist_snapshot(&self.kv, &meta, state).await?;
        debug!(snapshot_id = %meta.snapshot_id, bytes = bytes.len(), "snapshot built");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for KvStateMachine {
    type SnapshotBuilder = KvSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<NodeId>>, StoredMembership<NodeId, NodeMeta>),
        openraft::StorageError<NodeId>,
    > {
        let applied = self.applied.lock().await;
        Ok((applied.last_applied, applied.last_membership.clone()))
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> Result<Vec<ClientResponse>, openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::impls::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();
        let mut applied = self.applied.lock().await;

        for entry in entries {
            let log_id = entry.log_id;
            if let Some(membership) = entry.get_membership() {
                applied.last_membership = StoredMembership::new(Some(log_id), membership.clone());
            }

            let resp = match entry.payload {
                EntryPayload::Normal(command) => {
                    let kind = command.kind;
                    let result = self.fsm.apply(command).await;
                    if let Err(err) = &result {
                        debug!(index = log_id.index, ?kind, code = err.code(), %err, "command rejected");
                    }
                    ClientResponse::from(result)
                }
                EntryPayload::Membership(_) | EntryPayload::Blank => ClientResponse::Ok {
                    result: ApplyOutcome::Applied,
                },
            };

            applied.last_applied = Some(log_id);
            responses.push(resp);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        KvSnapshotBuilder {
            fsm: self.fsm.clone(),
            kv: self.kv.clone(),
            applied: self.applied.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<
        Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
        openraft::StorageError<NodeId>,
    > {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, NodeMeta>,
        snapshot: Box<<TypeConfig as openraft::RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let bytes = snapshot.into_inner();
        let state = decode_snapshot(&bytes).map_err(|e| snapshot_data_err(e, ErrorVerb::Read))?;

        {
            let mut applied = self.applied.lock().await;
            self.fsm.replace(state.clone()).await;
            applied.last_applied = meta.last_log_id;
            applied.last_membership = meta.last_membership.clone();
        }
        info!(snapshot_id = %meta.snapshot_id, "installed snapshot from leader");

        persist_snapshot(&self.kv, meta, state).await
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, openraft::StorageError<NodeId>> {
        let Some(stored) = load_stored_snapshot(&self.kv).await? else {
            return Ok(None);
        };
        let bytes =
            encode_snapshot(&stored.state).map_err(|e| snapshot_data_err(e, ErrorVerb::Read))?;
        Ok(Some(Snapshot {
            meta: stored.meta,
            snapshot: Box::new(Cursor::new(bytes)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use openraft::CommittedLeaderId;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        domain::{Device, DomainError},
        state::Command,
    };

    fn build_entry(command: Command, index: u64) -> openraft::impls::Entry<TypeConfig> {
        openraft::impls::Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(command),
        }
    }

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            manufacturer: "Bambu".to_string(),
            model: "X1C".to_string(),
            attributes: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn apply_returns_domain_errors_as_responses() {
        let kv = Arc::new(KvStore::in_memory());
        let fsm = Arc::new(FleetStateMachine::new());
        let mut sm = KvStateMachine::open(kv, fsm.clone()).await.unwrap();

        let responses = sm
            .apply(vec![
                build_entry(Command::add_device(device("d1")), 1),
                build_entry(
                    Command::update_job_status("missing", crate::domain::JobStatus::Running),
                    2,
                ),
            ])
            .await
            .unwrap();

        assert_eq!(
            responses[0],
            ClientResponse::Ok {
                result: ApplyOutcome::DeviceAdded {
                    device: device("d1")
                }
            }
        );
        assert_eq!(
            responses[1],
            ClientResponse::Err {
                error: DomainError::JobNotFound {
                    job_id: "missing".to_string()
                }
            }
        );
        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.map(|l| l.index), Some(2));
        assert_eq!(fsm.list_devices().await, vec![device("d1")]);
    }

    #[tokio::test]
    async fn built_snapshot_restores_on_reopen_and_installs_elsewhere() {
        let tmp = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open_dir(tmp.path()).await.unwrap());
        let fsm = Arc::new(FleetStateMachine::new());
        let mut sm = KvStateMachine::open(kv, fsm.clone()).await.unwrap();
        assert!(sm.get_current_snapshot().await.unwrap().is_none());

        sm.apply(vec![build_entry(Command::add_device(device("d1")), 1)])
            .await
            .unwrap();
        let snapshot = sm.get_snapshot_builder().await.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.map(|l| l.index), Some(1));

        // Reopen from disk: state comes back without replaying the log.
        let kv = Arc::new(KvStore::open_dir(tmp.path()).await.unwrap());
        let reopened_fsm = Arc::new(FleetStateMachine::new());
        let mut reopened = KvStateMachine::open(kv, reopened_fsm.clone())
            .await
            .unwrap();
        assert_eq!(reopened_fsm.state().await, fsm.state().await);
        let (last_applied, _) = reopened.applied_state().await.unwrap();
        assert_eq!(last_applied, snapshot.meta.last_log_id);

        let current = reopened.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta, snapshot.meta);

        let follower_fsm = Arc::new(FleetStateMachine::new());
        let mut follower = KvStateMachine::open(Arc::new(KvStore::in_memory()), follower_fsm.clone())
            .await
            .unwrap();
        follower
            .install_snapshot(&current.meta, current.snapshot)
            .await
            .unwrap();
        assert_eq!(follower_fsm.list_devices().await, vec![device("d1")]);
        assert_eq!(follower.fleet().list_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_snapshot_install_keeps_state() {
        let fsm = Arc::new(FleetStateMachine::new());
        fsm.apply(Command::add_device(device("d1"))).await.unwrap();
        let mut sm = KvStateMachine::open(Arc::new(KvStore::in_memory()), fsm.clone())
            .await
            .unwrap();

        let meta = SnapshotMeta::default();
        let err = sm
            .install_snapshot(&meta, Box::new(Cursor::new(b"garbage".to_vec())))
            .await;
        assert!(err.is_err());
        assert_eq!(fsm.list_devices().await, vec![device("d1")]);
    }
}
