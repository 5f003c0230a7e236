//! Traffic controller error types.

use slipway_core::CutoverError;
use slipway_state::PoolSlot;
use thiserror::Error;

use crate::backend::BackendError;

/// Errors that can occur during traffic control operations.
#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("refusing to retire production pool {0}")]
    RetireProduction(PoolSlot),

    #[error("pool {0} is the production pool and cannot be provisioned as a candidate")]
    CandidateIsProduction(PoolSlot),

    #[error("pool {pool} not at capacity after {waited_ms}ms")]
    CapacityTimeout { pool: PoolSlot, waited_ms: u64 },

    #[error("instance {0} failed to start")]
    InstanceFailed(String),

    #[error("listener {listener} targets {found:?} after swap, expected {expected}")]
    ShiftNotConfirmed {
        listener: String,
        expected: PoolSlot,
        found: Option<PoolSlot>,
    },

    #[error("pool {0} has no task definition")]
    NoTaskDefinition(PoolSlot),

    #[error("state store error: {0}")]
    State(#[from] slipway_state::StateError),
}

pub type TrafficResult<T> = Result<T, TrafficError>;

impl TrafficError {
    /// Lift into the deployment error taxonomy, tagged with the operation
    /// that failed.
    pub fn into_cutover(self, operation: &str) -> CutoverError {
        match self {
            Self::CapacityTimeout { waited_ms, .. } => CutoverError::ProvisioningTimeout { waited_ms },
            other => CutoverError::traffic(operation, other.to_string()),
        }
    }
}
