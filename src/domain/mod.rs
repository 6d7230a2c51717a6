use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Errors produced while applying a command to the fleet state.
///
/// These are the committed *result* of a log entry, not storage failures: they travel back to the
/// caller inside the raft response and are identical on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainError {
    InvalidCommand {
        reason: String,
    },
    InvalidPayload {
        reason: String,
    },
    UnknownDevice {
        device_id: String,
    },
    UnknownResource {
        resource_id: String,
    },
    InsufficientCapacity {
        resource_id: String,
        available: u64,
        requested: u64,
    },
    JobNotFound {
        job_id: String,
    },
    IllegalTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCommand { .. } => "invalid_command",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::UnknownDevice { .. } => "unknown_device",
            Self::UnknownResource { .. } => "unknown_resource",
            Self::InsufficientCapacity { .. } => "insufficient_capacity",
            Self::JobNotFound { .. } => "job_not_found",
            Self::IllegalTransition { .. } => "illegal_transition",
        }
    }

    pub(crate) fn missing(field: &str) -> Self {
        Self::InvalidPayload {
            reason: format!("missing {field}"),
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCommand { reason } => write!(f, "invalid command: {reason}"),
            Self::InvalidPayload { reason } => write!(f, "invalid payload: {reason}"),
            Self::UnknownDevice { device_id } => write!(f, "device not found: {device_id}"),
            Self::UnknownResource { resource_id } => {
                write!(f, "resource not found: {resource_id}")
            }
            Self::InsufficientCapacity {
                resource_id,
                available,
                requested,
            } => write!(
                f,
                "not enough capacity remaining on resource {resource_id}: available {available}, requested {requested}"
            ),
            Self::JobNotFound { job_id } => write!(f, "job not found: {job_id}"),
            Self::IllegalTransition { job_id, from, to } => {
                write!(f, "job {job_id}: cannot change status from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "company")]
    pub manufacturer: String,
    pub model: String,
    /// Descriptive fields the registry stores without interpreting.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceCategory {
    Pla,
    Petg,
    Abs,
    Tpu,
}

impl ResourceCategory {
    pub const ALL: [Self; 4] = [Self::Pla, Self::Petg, Self::Abs, Self::Tpu];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pla => "PLA",
            Self::Petg => "PETG",
            Self::Abs => "ABS",
            Self::Tpu => "TPU",
        }
    }

    /// Case-insensitive.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl std::fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ResourceCategory {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown resource category: {value}"))
    }
}

impl From<ResourceCategory> for String {
    fn from(value: ResourceCategory) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    #[serde(default)]
    pub id: String,
    pub category: ResourceCategory,
    #[serde(default)]
    pub color: String,
    pub total_capacity: u64,
    #[serde(default)]
    pub remaining_capacity: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Done,
    Canceled,
}

impl JobStatus {
    pub const ALL: [Self; 4] = [Self::Queued, Self::Running, Self::Done, Self::Canceled];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Done => "Done",
            Self::Canceled => "Canceled",
        }
    }

    /// Case-insensitive, for query strings.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Canceled)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Canceled)
        )
    }

    /// Jobs in these states hold a reservation against their resource.
    pub fn reserves_capacity(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    pub device_id: String,
    pub resource_id: String,
    #[serde(default)]
    pub payload_ref: String,
    pub requested_capacity: u64,
    #[serde(default)]
    pub status: JobStatus,
}
