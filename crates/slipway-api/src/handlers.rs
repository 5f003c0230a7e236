//! REST API handlers.
//!
//! Every response uses the same envelope: `{success, data}` on success and
//! `{success: false, error}` on failure.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use slipway_core::{CutoverError, epoch_secs};
use slipway_deploy::DeployError;
use slipway_pipeline::ArtifactEvent;
use slipway_state::*;
use tracing::{debug, info};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn deploy_error(e: DeployError) -> Response {
    let status = match &e {
        DeployError::NoActiveDeployment(_) | DeployError::NothingToRollBack(_) => StatusCode::CONFLICT,
        DeployError::Cutover(CutoverError::InvalidArtifact(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        DeployError::Cutover(_) | DeployError::Traffic(_) | DeployError::State(_) | DeployError::Task(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status)
}

fn internal(e: impl std::fmt::Display) -> Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

// ── Views ──────────────────────────────────────────────────────

/// GET /api/v1/status body.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusView {
    pub service: String,
    pub production: Option<PoolSlot>,
    pub test: Option<PoolSlot>,
    pub pools: Vec<PoolRecord>,
    pub active: Option<DeploymentRecord>,
    pub last_completed: Option<DeploymentRecord>,
    pub queued: Vec<QueueEntry>,
}

/// GET /api/v1/requests/{seq} body.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestView {
    pub entry: QueueEntry,
    pub deployment: Option<DeploymentRecord>,
}

#[derive(Debug, Deserialize)]
pub struct DeployBody {
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct AlarmBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SampleBody {
    pub pool: PoolSlot,
    pub utilization: f64,
}

#[derive(Debug, Default, Deserialize)]
struct RejectBody {
    #[serde(default)]
    reason: Option<String>,
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> Response {
    let production = match state.traffic.production_pool().await {
        Ok(pool) => pool,
        Err(e) => return internal(e),
    };
    let test = match state.traffic.test_pool().await {
        Ok(pool) => pool,
        Err(e) => return internal(e),
    };

    let view = (|| -> StateResult<StatusView> {
        Ok(StatusView {
            service: state.service.clone(),
            production,
            test,
            pools: state.store.list_pools(&state.service)?,
            active: state.store.active_deployment(&state.service)?,
            last_completed: state.store.last_completed(&state.service)?,
            queued: state.store.pending_requests(&state.service)?,
        })
    })();

    match view {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => internal(e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> Response {
    match state.store.list_deployments(&state.service) {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_deployment(&id) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("deployment not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// POST /api/v1/deployments
pub async fn create_deployment(State(state): State<ApiState>, Json(body): Json<DeployBody>) -> Response {
    match state.operator.deploy(&body.version).await {
        Ok(entry) => (StatusCode::ACCEPTED, ApiResponse::ok(entry)).into_response(),
        Err(e) => deploy_error(e),
    }
}

/// GET /api/v1/requests/{seq}
pub async fn get_request(State(state): State<ApiState>, Path(seq): Path<u64>) -> Response {
    let entry = match state.store.get_queue_entry(&state.service, seq) {
        Ok(Some(entry)) => entry,
        Ok(None) => return error_response("request not found", StatusCode::NOT_FOUND),
        Err(e) => return internal(e),
    };

    let deployment = match &entry.status {
        QueueStatus::Admitted { deployment_id } => match state.store.get_deployment(deployment_id) {
            Ok(record) => record,
            Err(e) => return internal(e),
        },
        _ => None,
    };
    ApiResponse::ok(RequestView { entry, deployment }).into_response()
}

// ── Events ─────────────────────────────────────────────────────

/// POST /api/v1/events/artifact
pub async fn artifact_event(State(state): State<ApiState>, Json(event): Json<ArtifactEvent>) -> Response {
    match state.listener.handle_event(&event).await {
        Ok(entry) => (StatusCode::ACCEPTED, ApiResponse::ok(entry)).into_response(),
        Err(e) => deploy_error(e.into()),
    }
}

// ── Operator signals ───────────────────────────────────────────

/// POST /api/v1/active/{action}
///
/// `action` is one of `cancel`, `rollback`, `approve`, `reject`. A reject
/// may carry `{"reason": "..."}`.
pub async fn signal_active(State(state): State<ApiState>, Path(action): Path<String>, body: Bytes) -> Response {
    let signal = match action.as_str() {
        "cancel" => OperatorSignal::Cancel,
        "rollback" => OperatorSignal::Rollback,
        "approve" => OperatorSignal::Approve,
        "reject" => {
            let body: RejectBody = if body.is_empty() {
                RejectBody::default()
            } else {
                match serde_json::from_slice(&body) {
                    Ok(body) => body,
                    Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
                }
            };
            OperatorSignal::Reject {
                reason: body.reason.unwrap_or_else(|| "rejected by operator".to_string()),
            }
        }
        other => return error_response(&format!("unknown action {other}"), StatusCode::NOT_FOUND),
    };

    match state.operator.signal(signal) {
        Ok((_, entry)) => ApiResponse::ok(entry).into_response(),
        Err(e) => deploy_error(e),
    }
}

/// POST /api/v1/rollback
pub async fn rollback(State(state): State<ApiState>) -> Response {
    match state.operator.rollback().await {
        Ok(action) => {
            info!(?action, "rollback requested");
            ApiResponse::ok(action).into_response()
        }
        Err(e) => deploy_error(e),
    }
}

/// POST /api/v1/alarms
pub async fn alarm(State(state): State<ApiState>, Json(body): Json<AlarmBody>) -> Response {
    match state.operator.signal(OperatorSignal::Alarm { name: body.name }) {
        Ok((_, entry)) => ApiResponse::ok(entry).into_response(),
        Err(e) => deploy_error(e),
    }
}

// ── Metrics ────────────────────────────────────────────────────

/// POST /api/v1/metrics
pub async fn push_metric(State(state): State<ApiState>, Json(body): Json<SampleBody>) -> Response {
    if !(0.0..=100.0).contains(&body.utilization) {
        return error_response("utilization must be between 0 and 100", StatusCode::BAD_REQUEST);
    }
    let sample = UtilizationSample {
        service: state.service.clone(),
        pool: body.pool,
        epoch: epoch_secs(),
        utilization: body.utilization,
    };
    match state.store.put_sample(&sample) {
        Ok(()) => {
            debug!(pool = %sample.pool, utilization = sample.utilization, "utilization sample stored");
            (StatusCode::ACCEPTED, ApiResponse::ok(sample)).into_response()
        }
        Err(e) => internal(e),
    }
}
