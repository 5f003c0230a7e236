use slipway_core::CutoverError;
use slipway_state::StateError;
use slipway_traffic::TrafficError;
use thiserror::Error;

/// Errors returned to callers of the deploy crate. Deployment failures
/// themselves are recorded on the deployment, not returned.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("no active deployment for {0}")]
    NoActiveDeployment(String),

    #[error("no earlier production version of {0} to roll back to")]
    NothingToRollBack(String),

    #[error("deployment task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Cutover(#[from] CutoverError),

    #[error(transparent)]
    Traffic(#[from] TrafficError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type DeployResult<T> = Result<T, DeployError>;
