use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::domain::{Device, DomainError, Job, JobStatus, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    AddDevice,
    AddResource,
    AddJob,
    UpdateJobStatus,
    #[serde(other)]
    Unknown,
}

/// A replicated log entry. Only the payload field matching `kind` is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<JobStatus>,
}

impl Command {
    fn empty(kind: CommandKind) -> Self {
        Self {
            kind,
            device: None,
            resource: None,
            job: None,
            job_id: None,
            new_status: None,
        }
    }

    pub fn add_device(device: Device) -> Self {
        Self {
            device: Some(device),
            ..Self::empty(CommandKind::AddDevice)
        }
    }

    pub fn add_resource(resource: Resource) -> Self {
        Self {
            resource: Some(resource),
            ..Self::empty(CommandKind::AddResource)
        }
    }

    pub fn add_job(job: Job) -> Self {
        Self {
            job: Some(job),
            ..Self::empty(CommandKind::AddJob)
        }
    }

    pub fn update_job_status(job_id: impl Into<String>, new_status: JobStatus) -> Self {
        Self {
            job_id: Some(job_id.into()),
            new_status: Some(new_status),
            ..Self::empty(CommandKind::UpdateJobStatus)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Entries with no domain payload (blank or membership entries).
    Applied,
    DeviceAdded { device: Device },
    ResourceAdded { resource: Resource },
    JobAdded { job: Job },
    JobStatusUpdated { job: Job, previous: JobStatus },
}

#[derive(Debug)]
pub enum SnapshotError {
    Encode(serde_json::Error),
    Decode(serde_json::Error),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "snapshot encode error: {e}"),
            Self::Decode(e) => write!(f, "snapshot decode error: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) | Self::Decode(e) => Some(e),
        }
    }
}

/// The three entity maps. Serialized as-is for snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetState {
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
    #[serde(default)]
    pub resources: BTreeMap<String, Resource>,
    #[serde(default)]
    pub jobs: BTreeMap<String, Job>,
}

impl FleetState {
    /// Applies one command. Every branch validates before it mutates, so an `Err` leaves the
    /// state exactly as it was.
    pub fn apply(&mut self, command: Command) -> Result<ApplyOutcome, DomainError> {
        match command.kind {
            CommandKind::AddDevice => {
                let device = command.device.ok_or_else(|| DomainError::missing("device"))?;
                self.devices.insert(device.id.clone(), device.clone());
                Ok(ApplyOutcome::DeviceAdded { device })
            }
            CommandKind::AddResource => {
                let resource = command
                    .resource
                    .ok_or_else(|| DomainError::missing("resource"))?;
                self.resources
                    .insert(resource.id.clone(), resource.clone());
                Ok(ApplyOutcome::ResourceAdded { resource })
            }
            CommandKind::AddJob => {
                let job = command.job.ok_or_else(|| DomainError::missing("job"))?;
                self.add_job(job)
            }
            CommandKind::UpdateJobStatus => {
                let job_id = command.job_id.ok_or_else(|| DomainError::missing("job_id"))?;
                let new_status = command
                    .new_status
                    .ok_or_else(|| DomainError::missing("new_status"))?;
                self.update_job_status(&job_id, new_status)
            }
            CommandKind::Unknown => Err(DomainError::InvalidCommand {
                reason: "unknown command kind".to_string(),
            }),
        }
    }

    /// Capacity still free on `resource_id` once every reserving job is accounted for.
    pub fn available_capacity(&self, resource_id: &str) -> Option<u64> {
        let resource = self.resources.get(resource_id)?;
        let reserved = self
            .jobs
            .values()
            .filter(|job| job.resource_id == resource_id && job.status.reserves_capacity())
            .fold(0u64, |acc, job| acc.saturating_add(job.requested_capacity));
        Some(resource.remaining_capacity.saturating_sub(reserved))
    }

    /// A job id that already exists is a replay: the stored job comes back untouched, whatever
    /// its status, so a job's lifecycle only moves through status updates.
    fn add_job(&mut self, mut job: Job) -> Result<ApplyOutcome, DomainError> {
        if let Some(existing) = self.jobs.get(&job.id) {
            return Ok(ApplyOutcome::JobAdded {
                job: existing.clone(),
            });
        }
        if !self.devices.contains_key(&job.device_id) {
            return Err(DomainError::UnknownDevice {
                device_id: job.device_id,
            });
        }
        let available = self
            .available_capacity(&job.resource_id)
            .ok_or_else(|| DomainError::UnknownResource {
                resource_id: job.resource_id.clone(),
            })?;
        if job.requested_capacity > available {
            return Err(DomainError::InsufficientCapacity {
                resource_id: job.resource_id,
                available,
                requested: job.requested_capacity,
            });
        }

        job.status = JobStatus::Queued;
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(ApplyOutcome::JobAdded { job })
    }

    fn update_job_status(
        &mut self,
        job_id: &str,
        new_status: JobStatus,
    ) -> Result<ApplyOutcome, DomainError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| DomainError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        let previous = job.status;
        if !previous.can_transition_to(new_status) {
            return Err(DomainError::IllegalTransition {
                job_id: job_id.to_string(),
                from: previous,
                to: new_status,
            });
        }

        if previous == JobStatus::Running && new_status == JobStatus::Done {
            let requested = job.requested_capacity;
            let resource_id = job.resource_id.clone();
            let resource = self.resources.get_mut(&resource_id).ok_or(
                DomainError::UnknownResource {
                    resource_id: resource_id.clone(),
                },
            )?;
            resource.remaining_capacity = resource.remaining_capacity.saturating_sub(requested);
        }

        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| DomainError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        job.status = new_status;
        Ok(ApplyOutcome::JobStatusUpdated {
            job: job.clone(),
            previous,
        })
    }
}

pub fn encode_snapshot(state: &FleetState) -> Result<Vec<u8>, SnapshotError> {
    serde_json::to_vec(state).map_err(SnapshotError::Encode)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<FleetState, SnapshotError> {
    serde_json::from_slice(bytes).map_err(SnapshotError::Decode)
}

/// Owns the authoritative fleet state behind a single lock.
///
/// Writers (command application, restore) take the write lock for the whole operation; readers
/// only ever observe the state before or after a command.
#[derive(Debug, Default)]
pub struct FleetStateMachine {
    state: RwLock<FleetState>,
}

impl FleetStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: FleetState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub async fn apply(&self, command: Command) -> Result<ApplyOutcome, DomainError> {
        let mut state = self.state.write().await;
        state.apply(command)
    }

    /// Point-in-time copy of the whole state.
    pub async fn state(&self) -> FleetState {
        self.state.read().await.clone()
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let copy = self.state().await;
        encode_snapshot(&copy)
    }

    pub async fn restore(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let decoded = decode_snapshot(bytes)?;
        self.replace(decoded).await;
        Ok(())
    }

    pub async fn replace(&self, state: FleetState) {
        *self.state.write().await = state;
    }

    pub async fn list_devices(&self) -> Vec<Device> {
        self.state.read().await.devices.values().cloned().collect()
    }

    pub async fn list_resources(&self) -> Vec<Resource> {
        self.state.read().await.resources.values().cloned().collect()
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.state
            .read()
            .await
            .jobs
            .values()
            .filter(|job| status.is_none_or(|status| job.status == status))
            .cloned()
            .collect()
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.state.read().await.jobs.get(job_id).cloned()
    }

    pub async fn get_resource(&self, resource_id: &str) -> Option<Resource> {
        self.state.read().await.resources.get(resource_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::domain::ResourceCategory;

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            manufacturer: "Prusa".to_string(),
            model: "MK4".to_string(),
            attributes: BTreeMap::new(),
        }
    }

    fn resource(id: &str, total: u64, remaining: u64) -> Resource {
        Resource {
            id: id.to_string(),
            category: ResourceCategory::Pla,
            color: "black".to_string(),
            total_capacity: total,
            remaining_capacity: remaining,
        }
    }

    fn job(id: &str, resource_id: &str, requested: u64) -> Job {
        Job {
            id: id.to_string(),
            device_id: "d1".to_string(),
            resource_id: resource_id.to_string(),
            payload_ref: format!("/models/{id}.gcode"),
            requested_capacity: requested,
            status: JobStatus::Queued,
        }
    }

    fn seeded(remaining: u64) -> FleetState {
        let mut state = FleetState::default();
        state.apply(Command::add_device(device("d1"))).unwrap();
        state
            .apply(Command::add_resource(resource("r1", 1000, remaining)))
            .unwrap();
        state
    }

    #[test]
    fn add_job_rejects_oversubscription() {
        let mut state = seeded(1000);
        state.apply(Command::add_job(job("j1", "r1", 600))).unwrap();
        let before = state.clone();

        let err = state
            .apply(Command::add_job(job("j2", "r1", 500)))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientCapacity {
                resource_id: "r1".to_string(),
                available: 400,
                requested: 500,
            }
        );
        assert_eq!(state, before);
    }

    #[test]
    fn finished_and_canceled_jobs_release_their_reservation() {
        let mut state = seeded(1000);
        state.apply(Command::add_job(job("j1", "r1", 600))).unwrap();
        state
            .apply(Command::update_job_status("j1", JobStatus::Canceled))
            .unwrap();

        state.apply(Command::add_job(job("j2", "r1", 1000))).unwrap();
        assert_eq!(state.available_capacity("r1"), Some(0));
    }

    #[test]
    fn capacity_accounting_follows_job_lifecycle() {
        let mut state = seeded(1000);
        state.apply(Command::add_job(job("j1", "r1", 400))).unwrap();
        let err = state
            .apply(Command::add_job(job("j2", "r1", 700)))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientCapacity {
                resource_id: "r1".to_string(),
                available: 600,
                requested: 700,
            }
        );
        assert!(!state.jobs.contains_key("j2"));

        state
            .apply(Command::update_job_status("j1", JobStatus::Running))
            .unwrap();
        assert_eq!(state.resources["r1"].remaining_capacity, 1000);
        state
            .apply(Command::update_job_status("j1", JobStatus::Done))
            .unwrap();
        assert_eq!(state.resources["r1"].remaining_capacity, 600);

        let err = state
            .apply(Command::add_job(job("j2", "r1", 700)))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientCapacity {
                resource_id: "r1".to_string(),
                available: 600,
                requested: 700,
            }
        );
        assert!(err.to_string().contains("available 600, requested 700"));
    }

    #[test]
    fn done_clamps_remaining_capacity_at_zero() {
        let mut state = seeded(100);
        state.apply(Command::add_job(job("j1", "r1", 100))).unwrap();
        state
            .apply(Command::update_job_status("j1", JobStatus::Running))
            .unwrap();
        state
            .resources
            .get_mut("r1")
            .unwrap()
            .remaining_capacity = 30;
        state
            .apply(Command::update_job_status("j1", JobStatus::Done))
            .unwrap();
        assert_eq!(state.resources["r1"].remaining_capacity, 0);
    }

    #[test]
    fn add_job_forces_queued_status() {
        let mut state = seeded(1000);
        let mut running = job("j1", "r1", 10);
        running.status = JobStatus::Running;
        let outcome = state.apply(Command::add_job(running)).unwrap();
        let ApplyOutcome::JobAdded { job } = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(state.jobs["j1"].status, JobStatus::Queued);
    }

    #[test]
    fn add_job_checks_parents() {
        let mut state = seeded(1000);
        let mut orphan = job("j1", "r1", 10);
        orphan.device_id = "missing".to_string();
        assert_eq!(
            state.apply(Command::add_job(orphan)).unwrap_err(),
            DomainError::UnknownDevice {
                device_id: "missing".to_string()
            }
        );
        assert_eq!(
            state
                .apply(Command::add_job(job("j1", "missing", 10)))
                .unwrap_err(),
            DomainError::UnknownResource {
                resource_id: "missing".to_string()
            }
        );
        assert!(state.jobs.is_empty());
    }

    #[test]
    fn illegal_transitions_leave_state_unchanged() {
        let mut state = seeded(1000);
        state.apply(Command::add_job(job("j1", "r1", 10))).unwrap();
        state
            .apply(Command::update_job_status("j1", JobStatus::Canceled))
            .unwrap();
        let before = state.clone();

        for to in JobStatus::ALL {
            let err = state
                .apply(Command::update_job_status("j1", to))
                .unwrap_err();
            assert_eq!(
                err,
                DomainError::IllegalTransition {
                    job_id: "j1".to_string(),
                    from: JobStatus::Canceled,
                    to,
                }
            );
        }
        assert_eq!(state, before);
    }

    #[test]
    fn done_with_vanished_resource_is_rejected_before_mutation() {
        let mut state = seeded(1000);
        state.apply(Command::add_job(job("j1", "r1", 10))).unwrap();
        state
            .apply(Command::update_job_status("j1", JobStatus::Running))
            .unwrap();
        state.resources.clear();
        let before = state.clone();

        let err = state
            .apply(Command::update_job_status("j1", JobStatus::Done))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::UnknownResource {
                resource_id: "r1".to_string()
            }
        );
        assert_eq!(state, before);
    }

    #[test]
    fn missing_payloads_and_unknown_kinds_are_rejected() {
        let mut state = FleetState::default();
        for kind in [
            CommandKind::AddDevice,
            CommandKind::AddResource,
            CommandKind::AddJob,
            CommandKind::UpdateJobStatus,
        ] {
            let err = state.apply(Command::empty(kind)).unwrap_err();
            assert_eq!(err.code(), "invalid_payload", "{kind:?}");
        }

        let mut missing_status = Command::update_job_status("j1", JobStatus::Done);
        missing_status.new_status = None;
        assert_eq!(
            state.apply(missing_status).unwrap_err().code(),
            "invalid_payload"
        );
        assert_eq!(
            state
                .apply(Command::update_job_status("nope", JobStatus::Running))
                .unwrap_err(),
            DomainError::JobNotFound {
                job_id: "nope".to_string()
            }
        );

        let unknown: Command =
            serde_json::from_value(serde_json::json!({"kind": "DELETE_EVERYTHING"})).unwrap();
        assert_eq!(unknown.kind, CommandKind::Unknown);
        assert_eq!(state.apply(unknown).unwrap_err().code(), "invalid_command");
        assert_eq!(state, FleetState::default());
    }

    #[test]
    fn add_device_is_idempotent() {
        let mut once = FleetState::default();
        once.apply(Command::add_device(device("d1"))).unwrap();

        let mut twice = once.clone();
        twice.apply(Command::add_device(device("d1"))).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn re_adding_a_job_does_not_reset_its_lifecycle() {
        let mut state = seeded(1000);
        state.apply(Command::add_job(job("j1", "r1", 400))).unwrap();
        state
            .apply(Command::update_job_status("j1", JobStatus::Running))
            .unwrap();
        state
            .apply(Command::update_job_status("j1", JobStatus::Done))
            .unwrap();
        let before = state.clone();

        let outcome = state.apply(Command::add_job(job("j1", "r1", 400))).unwrap();
        let ApplyOutcome::JobAdded { job: replayed } = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(replayed.status, JobStatus::Done);
        assert_eq!(state, before);

        assert_eq!(
            state
                .apply(Command::update_job_status("j1", JobStatus::Running))
                .unwrap_err(),
            DomainError::IllegalTransition {
                job_id: "j1".to_string(),
                from: JobStatus::Done,
                to: JobStatus::Running,
            }
        );
        assert_eq!(state.resources["r1"].remaining_capacity, 600);
    }

    #[test]
    fn re_adding_a_queued_job_keeps_a_single_reservation() {
        let mut state = seeded(1000);
        state.apply(Command::add_job(job("j1", "r1", 400))).unwrap();
        state.apply(Command::add_job(job("j1", "r1", 900))).unwrap();
        assert_eq!(state.jobs["j1"].requested_capacity, 400);
        assert_eq!(state.available_capacity("r1"), Some(600));
    }

    #[test]
    fn command_wire_format_uses_screaming_kind_and_ignores_unknown_fields() {
        let command = Command::update_job_status("j1", JobStatus::Running);
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "kind": "UPDATE_JOB_STATUS",
                "job_id": "j1",
                "new_status": "Running",
            })
        );

        let decoded: Command = serde_json::from_value(serde_json::json!({
            "kind": "ADD_DEVICE",
            "device": {"id": "d1", "manufacturer": "Prusa", "model": "MK4"},
            "trace_id": "abc",
        }))
        .unwrap();
        assert_eq!(decoded, Command::add_device(device("d1")));
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_identical_state() {
        let fsm = FleetStateMachine::new();
        fsm.apply(Command::add_device(device("d1"))).await.unwrap();
        fsm.apply(Command::add_resource(resource("r1", 1000, 1000)))
            .await
            .unwrap();
        fsm.apply(Command::add_job(job("j1", "r1", 250)))
            .await
            .unwrap();
        let bytes = fsm.snapshot().await.unwrap();

        let restored = FleetStateMachine::new();
        restored.restore(&bytes).await.unwrap();
        assert_eq!(restored.state().await, fsm.state().await);
        assert_eq!(restored.list_jobs(Some(JobStatus::Queued)).await.len(), 1);
        assert!(restored.list_jobs(Some(JobStatus::Done)).await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_round_trip_covers_empty_and_mixed_states() {
        let empty = FleetStateMachine::new();
        let bytes = empty.snapshot().await.unwrap();
        let restored = FleetStateMachine::from_state(seeded(1000));
        restored.restore(&bytes).await.unwrap();
        assert_eq!(restored.state().await, FleetState::default());

        let mut state = FleetState::default();
        for id in ["d1", "d2", "d3"] {
            state.apply(Command::add_device(device(id))).unwrap();
        }
        state
            .apply(Command::add_resource(resource("r1", 1000, 1000)))
            .unwrap();
        state
            .apply(Command::add_resource(resource("r2", 500, 200)))
            .unwrap();
        for (id, resource_id, requested) in
            [("j1", "r1", 100), ("j2", "r1", 200), ("j3", "r2", 50), ("j4", "r2", 100)]
        {
            state
                .apply(Command::add_job(job(id, resource_id, requested)))
                .unwrap();
        }
        for (id, status) in [
            ("j2", JobStatus::Running),
            ("j3", JobStatus::Running),
            ("j3", JobStatus::Done),
            ("j4", JobStatus::Canceled),
        ] {
            state
                .apply(Command::update_job_status(id, status))
                .unwrap();
        }
        let fsm = FleetStateMachine::from_state(state.clone());
        let bytes = fsm.snapshot().await.unwrap();

        let restored = FleetStateMachine::new();
        restored.restore(&bytes).await.unwrap();
        assert_eq!(restored.state().await, state);
        for (status, count) in [
            (JobStatus::Queued, 1),
            (JobStatus::Running, 1),
            (JobStatus::Done, 1),
            (JobStatus::Canceled, 1),
        ] {
            assert_eq!(restored.list_jobs(Some(status)).await.len(), count, "{status}");
        }
        assert_eq!(restored.list_devices().await.len(), 3);
        assert_eq!(
            restored.get_resource("r2").await.unwrap().remaining_capacity,
            150
        );
    }

    #[tokio::test]
    async fn restore_with_garbage_keeps_existing_state() {
        let fsm = FleetStateMachine::from_state(seeded(1000));
        let err = fsm.restore(b"{not json").await.unwrap_err();
        assert!(matches!(err, SnapshotError::Decode(_)));
        assert_eq!(fsm.state().await, seeded(1000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_partial_writes() {
        let mut initial = seeded(1000);
        initial.apply(Command::add_job(job("j1", "r1", 400))).unwrap();
        initial
            .apply(Command::update_job_status("j1", JobStatus::Running))
            .unwrap();
        let fsm = Arc::new(FleetStateMachine::from_state(initial));

        let mut readers = Vec::new();
        for _ in 0..8 {
            let fsm = fsm.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let state = fsm.state().await;
                    let done = state.jobs["j1"].status == JobStatus::Done;
                    let remaining = state.resources["r1"].remaining_capacity;
                    assert_eq!(remaining, if done { 600 } else { 1000 });
                    tokio::task::yield_now().await;
                }
            }));
        }
        fsm.apply(Command::update_job_status("j1", JobStatus::Done))
            .await
            .unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(fsm.get_resource("r1").await.unwrap().remaining_capacity, 600);
    }
}
