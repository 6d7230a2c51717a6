use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Path, Query, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    domain::{Device, DomainError, Job, JobStatus, Resource, ResourceCategory},
    id::or_new_ulid,
    raft::{
        ApplyError, ClientResponse, FleetNode, NodeId, NodeMeta, TypeConfig,
        forward::{
            CLUSTER_JOIN_PATH, CLUSTER_LEAVE_PATH, ForwardError, INTERNAL_APPLY_PATH,
            JoinRequest, LeaveRequest,
        },
        http_rpc::{RaftRpcState, build_raft_rpc_router},
    },
    state::{ApplyOutcome, Command},
};


#[derive(Clone)]
pub struct AppState {
    pub node: Arc<FleetNode>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// 409 for leader-only endpoints reached on a follower; carries the leader's address when
    /// known so callers can retry there.
    pub fn not_leader(leader: Option<String>) -> Self {
        let err = Self::new("not_leader", StatusCode::CONFLICT, "this node is not the leader");
        match leader {
            Some(leader) => err.with_detail("leader", leader),
            None => err,
        }
    }

    pub fn no_leader(message: impl Into<String>) -> Self {
        Self::new("no_leader", StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("timeout", StatusCode::GATEWAY_TIMEOUT, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new("bad_gateway", StatusCode::BAD_GATEWAY, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        let kind = value.code();
        let err = match &value {
            DomainError::UnknownDevice { .. }
            | DomainError::UnknownResource { .. }
            | DomainError::JobNotFound { .. } => ApiError::not_found(value.to_string()),
            DomainError::InsufficientCapacity {
                available,
                requested,
                ..
            } => ApiError::conflict(value.to_string())
                .with_detail("available", *available)
                .with_detail("requested", *requested),
            DomainError::IllegalTransition { from, to, .. } => ApiError::conflict(value.to_string())
                .with_detail("from", from.as_str())
                .with_detail("to", to.as_str()),
            DomainError::InvalidCommand { .. } | DomainError::InvalidPayload { .. } => {
                ApiError::invalid_request(value.to_string())
            }
        };
        err.with_detail("kind", kind)
    }
}

impl From<ForwardError> for ApiError {
    fn from(value: ForwardError) -> Self {
        match value {
            ForwardError::NoLeaderAvailable => ApiError::no_leader(value.to_string()),
            ForwardError::Timeout { .. } => ApiError::timeout(value.to_string()),
            ForwardError::Transport { .. } => ApiError::bad_gateway(value.to_string()),
            ForwardError::Rejected { status, ref body } => {
                let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                ApiError::new("leader_rejected", code, value.to_string())
                    .with_detail("leader_status", status)
                    .with_detail("leader_error", leader_error(body))
            }
            ForwardError::Membership(_) => ApiError::internal(value.to_string()),
        }
    }
}

impl From<ApplyError> for ApiError {
    fn from(value: ApplyError) -> Self {
        match value {
            ApplyError::Rejected(domain) => domain.into(),
            // The leader reports domain rejections inside a 200 `ClientResponse`, so any
            // non-2xx answer to a forwarded write means it could not take the write.
            ApplyError::Forward(ForwardError::Rejected { status, ref body }) => {
                ApiError::no_leader(value.to_string())
                    .with_detail("leader_status", status)
                    .with_detail("leader_error", leader_error(body))
            }
            ApplyError::Forward(forward) => forward.into(),
            ApplyError::NotLeader { .. } => ApiError::no_leader(value.to_string()),
            ApplyError::Timeout => ApiError::timeout(value.to_string()),
            ApplyError::Raft(_) | ApplyError::InvalidResponse(_) => {
                ApiError::internal(value.to_string())
            }
        }
    }
}

/// The `error` object of a forwarded reply, or its raw text when it is not our envelope.
fn leader_error(body: &str) -> Value {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").cloned())
        .unwrap_or_else(|| Value::String(body.to_string()))
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

/// Client API plus, when `raft_rpc` is given, the peer RPC routes on the same listener.
pub fn build_router(node: Arc<FleetNode>, raft_rpc: Option<openraft::Raft<TypeConfig>>) -> Router {
    let app_state = AppState { node };

    let v1 = Router::new()
        .route("/devices", post(create_device).get(list_devices))
        .route("/resources", post(create_resource).get(list_resources))
        .route("/resources/:resource_id", get(get_resource))
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/status", post(update_job_status));

    let mut router = Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route(CLUSTER_JOIN_PATH, post(cluster_join))
        .route(CLUSTER_LEAVE_PATH, post(cluster_leave))
        .route(INTERNAL_APPLY_PATH, post(internal_apply))
        .nest("/api/v1", v1)
        .layer(Extension(app_state));

    if let Some(raft) = raft_rpc {
        router = router.merge(build_raft_rpc_router(RaftRpcState { raft }));
    }
    router
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    node_id: NodeId,
    is_leader: bool,
    leader_id: Option<NodeId>,
    leader_address: Option<String>,
    raft_state: String,
    term: u64,
    last_applied_index: Option<u64>,
    members: Vec<MemberView>,
    version: &'static str,
}

#[derive(Serialize)]
struct MemberView {
    node_id: NodeId,
    #[serde(flatten)]
    meta: NodeMeta,
}

async fn status(Extension(state): Extension<AppState>) -> Json<StatusResponse> {
    let node = &state.node;
    let metrics = node.raft().metrics().borrow().clone();
    Json(StatusResponse {
        node_id: node.node_id(),
        is_leader: node.is_leader(),
        leader_id: metrics.current_leader,
        leader_address: node.leader_address(),
        raft_state: format!("{:?}", metrics.state),
        term: metrics.current_term,
        last_applied_index: metrics.last_applied.map(|l| l.index),
        members: metrics
            .membership_config
            .nodes()
            .map(|(id, meta)| MemberView {
                node_id: *id,
                meta: meta.clone(),
            })
            .collect(),
        version: crate::version::VERSION,
    })
}

async fn apply(state: &AppState, command: Command) -> Result<ApplyOutcome, ApiError> {
    let kind = command.kind;
    state.node.apply(command).await.map_err(|err| {
        match &err {
            ApplyError::Rejected(domain) => debug!(?kind, code = domain.code(), "command rejected"),
            other => warn!(?kind, error = %other, "command not applied"),
        }
        ApiError::from(err)
    })
}

fn unexpected(outcome: ApplyOutcome) -> ApiError {
    ApiError::internal(format!("unexpected apply outcome: {outcome:?}"))
}

#[derive(Deserialize)]
struct CreateDeviceRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "company")]
    manufacturer: String,
    model: String,
    #[serde(flatten)]
    attributes: std::collections::BTreeMap<String, Value>,
}

async fn create_device(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let device = Device {
        id: or_new_ulid(req.id),
        manufacturer: req.manufacturer,
        model: req.model,
        attributes: req.attributes,
    };
    match apply(&state, Command::add_device(device)).await? {
        ApplyOutcome::DeviceAdded { device } => Ok((StatusCode::CREATED, Json(device))),
        other => Err(unexpected(other)),
    }
}

async fn list_devices(Extension(state): Extension<AppState>) -> Json<Items<Device>> {
    Json(Items {
        items: state.node.state().list_devices().await,
    })
}

#[derive(Deserialize)]
struct CreateResourceRequest {
    #[serde(default)]
    id: Option<String>,
    category: String,
    #[serde(default)]
    color: String,
    total_capacity: u64,
    #[serde(default)]
    remaining_capacity: Option<u64>,
}

async fn create_resource(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<CreateResourceRequest>,
) -> Result<(StatusCode, Json<Resource>), ApiError> {
    let category = ResourceCategory::parse(&req.category).ok_or_else(|| {
        ApiError::invalid_request(format!(
            "invalid category {:?}: expected one of PLA, PETG, ABS, TPU",
            req.category
        ))
    })?;
    let remaining_capacity = req
        .remaining_capacity
        .filter(|remaining| *remaining > 0)
        .unwrap_or(req.total_capacity);
    if remaining_capacity > req.total_capacity {
        return Err(ApiError::invalid_request(
            "remaining_capacity must not exceed total_capacity",
        ));
    }
    let resource = Resource {
        id: or_new_ulid(req.id),
        category,
        color: req.color,
        total_capacity: req.total_capacity,
        remaining_capacity,
    };
    match apply(&state, Command::add_resource(resource)).await? {
        ApplyOutcome::ResourceAdded { resource } => Ok((StatusCode::CREATED, Json(resource))),
        other => Err(unexpected(other)),
    }
}

async fn list_resources(Extension(state): Extension<AppState>) -> Json<Items<Resource>> {
    Json(Items {
        items: state.node.state().list_resources().await,
    })
}

async fn get_resource(
    Extension(state): Extension<AppState>,
    Path(resource_id): Path<String>,
) -> Result<Json<Resource>, ApiError> {
    state
        .node
        .state()
        .get_resource(&resource_id)
        .await
        .map(Json)
        .ok_or_else(|| DomainError::UnknownResource { resource_id }.into())
}

#[derive(Deserialize)]
struct CreateJobRequest {
    #[serde(default)]
    id: Option<String>,
    device_id: String,
    resource_id: String,
    #[serde(default)]
    payload_ref: String,
    requested_capacity: u64,
}

async fn create_job(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = Job {
        id: or_new_ulid(req.id),
        device_id: req.device_id,
        resource_id: req.resource_id,
        payload_ref: req.payload_ref,
        requested_capacity: req.requested_capacity,
        status: JobStatus::Queued,
    };
    match apply(&state, Command::add_job(job)).await? {
        ApplyOutcome::JobAdded { job } => Ok((StatusCode::CREATED, Json(job))),
        other => Err(unexpected(other)),
    }
}

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default)]
    status: Option<String>,
}

fn parse_status(raw: &str) -> Result<JobStatus, ApiError> {
    JobStatus::parse(raw).ok_or_else(|| {
        ApiError::invalid_request(format!(
            "invalid status {raw:?}: expected one of Queued, Running, Done, Canceled"
        ))
    })
}

async fn list_jobs(
    Extension(state): Extension<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Items<Job>>, ApiError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(parse_status(raw)?),
        None => None,
    };
    Ok(Json(Items {
        items: state.node.state().list_jobs(status).await,
    }))
}

async fn get_job(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .node
        .state()
        .get_job(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| DomainError::JobNotFound { job_id }.into())
}

async fn update_job_status(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Job>, ApiError> {
    let raw = query
        .status
        .ok_or_else(|| ApiError::invalid_request("missing status query parameter"))?;
    let status = parse_status(&raw)?;
    match apply(&state, Command::update_job_status(job_id, status)).await? {
        ApplyOutcome::JobStatusUpdated { job, .. } => Ok(Json(job)),
        other => Err(unexpected(other)),
    }
}

async fn cluster_join(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<JoinRequest>,
) -> Result<Json<Value>, ApiError> {
    if !state.node.is_leader() {
        return Err(ApiError::not_leader(state.node.leader_address()));
    }
    state.node.join_cluster(req.node_id, req.node).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn cluster_leave(
    Extension(state): Extension<AppState>,
    ApiJson(req): ApiJson<LeaveRequest>,
) -> Result<Json<Value>, ApiError> {
    if !state.node.is_leader() {
        return Err(ApiError::not_leader(state.node.leader_address()));
    }
    state.node.leave_cluster(req.node_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Target of forwarded writes. Never forwards again: a follower answers 409.
async fn internal_apply(
    Extension(state): Extension<AppState>,
    ApiJson(command): ApiJson<Command>,
) -> Result<Json<ClientResponse>, ApiError> {
    if !state.node.is_leader() {
        return Err(ApiError::not_leader(state.node.leader_address()));
    }
    let resp = state.node.propose(command).await?;
    Ok(Json(resp))
}
