//! slipway-api — REST API for the Slipway daemon.
//!
//! Thin axum handlers over the state store, the artifact listener and the
//! operator commands. Nothing here drives a deployment directly; handlers
//! enqueue requests or deliver signals and return.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/status` | Production/test targets, pools, active deployment, queue |
//! | GET | `/api/v1/deployments` | List deployments, oldest first |
//! | POST | `/api/v1/deployments` | Queue a version (`{version}`) |
//! | GET | `/api/v1/deployments/{id}` | Get one deployment |
//! | GET | `/api/v1/requests/{seq}` | Queue entry and its deployment, if admitted |
//! | POST | `/api/v1/active/{action}` | `cancel`, `rollback`, `approve`, `reject` |
//! | POST | `/api/v1/rollback` | Roll back the active deployment or redeploy the previous version |
//! | POST | `/api/v1/alarms` | Raise an alarm (`{name}`) |
//! | POST | `/api/v1/metrics` | Push a utilization sample (`{pool, utilization}`) |
//! | POST | `/api/v1/events/artifact` | Artifact published webhook |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use slipway_deploy::Operator;
use slipway_pipeline::ArtifactEventListener;
use slipway_state::StateStore;
use slipway_traffic::TrafficController;

pub use handlers::{ApiResponse, RequestView, StatusView};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: String,
    pub store: StateStore,
    pub traffic: Arc<TrafficController>,
    pub listener: Arc<ArtifactEventListener>,
    pub operator: Arc<Operator>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/requests/{seq}", get(handlers::get_request))
        .route("/active/{action}", post(handlers::signal_active))
        .route("/rollback", post(handlers::rollback))
        .route("/alarms", post(handlers::alarm))
        .route("/metrics", post(handlers::push_metric))
        .route("/events/artifact", post(handlers::artifact_event))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
