use std::sync::Arc;

use anyhow::Context;
use openraft::SnapshotPolicy;

use crate::{
    kv::KvStore,
    raft::{
        app::RealRaft,
        network_http::HttpNetworkFactory,
        storage::{KvLogStore, KvStateMachine},
        types::{NodeId, TypeConfig},
    },
    state::FleetStateMachine,
};

pub const CLUSTER_NAME: &str = "fleetq";
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1024;

/// Timing and compaction knobs handed to openraft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftSettings {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Build a snapshot after this many applied entries.
    pub snapshot_threshold: u64,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            election_timeout_min_ms: 1_500,
            election_timeout_max_ms: 3_000,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
        }
    }
}

impl RaftSettings {
    /// Loopback timings for tests.
    pub fn fast() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            ..Self::default()
        }
    }
}

pub async fn start_raft(
    node_id: NodeId,
    kv: Arc<KvStore>,
    fsm: Arc<FleetStateMachine>,
    network: HttpNetworkFactory,
    settings: RaftSettings,
) -> anyhow::Result<RealRaft> {
    let config = openraft::Config {
        cluster_name: CLUSTER_NAME.to_string(),
        heartbeat_interval: settings.heartbeat_interval_ms,
        election_timeout_min: settings.election_timeout_min_ms,
        election_timeout_max: settings.election_timeout_max_ms,
        install_snapshot_timeout: 30_000,
        snapshot_policy: SnapshotPolicy::LogsSinceLast(settings.snapshot_threshold),
        ..Default::default()
    }
    .validate()
    .map_err(|e| anyhow::anyhow!("raft config validate: {e}"))?;

    let log_store = KvLogStore::open(kv.clone())
        .await
        .map_err(|e| anyhow::anyhow!("open log store: {e}"))?;
    let state_machine = KvStateMachine::open(kv, fsm)
        .await
        .map_err(|e| anyhow::anyhow!("open state machine: {e}"))?;

    let raft = openraft::Raft::<TypeConfig>::new(
        node_id,
        Arc::new(config),
        network,
        log_store,
        state_machine,
    )
    .await
    .context("start raft")?;

    // Initialization is the caller's choice: bootstrap a new cluster or wait to be joined.
    Ok(RealRaft::new(raft))
}
