//! Deployment error taxonomy shared by every Slipway crate.
//!
//! Each error maps onto a [`FailureCategory`], which in turn determines
//! the exit code reported by the `slipway` CLI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation names used in [`CutoverError::TrafficControl`].
pub mod ops {
    pub const PROVISION_CANDIDATE: &str = "provision_candidate";
    pub const WAIT_FOR_CAPACITY: &str = "wait_for_capacity";
    pub const ROUTE_TEST_TRAFFIC: &str = "route_test_traffic";
    pub const SHIFT_PRODUCTION: &str = "shift_production";
    pub const RETIRE_POOL: &str = "retire_pool";
    pub const SCALE_POOL: &str = "scale_pool";
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CutoverError {
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("pipeline failed in {stage} stage: {message}")]
    PipelineFailed { stage: String, message: String },

    #[error("traffic control error in {operation}: {message}")]
    TrafficControl { operation: String, message: String },

    #[error("candidate pool not ready after {waited_ms}ms")]
    ProvisioningTimeout { waited_ms: u64 },

    #[error("validation timed out in {phase}")]
    ValidationTimeout { phase: String },

    #[error("validation failed in {phase}: {reason}")]
    ValidationFailed { phase: String, reason: String },

    #[error("deployment aborted: {reason}")]
    Aborted { reason: String },

    #[error("rollback failed: {message}")]
    RollbackFailed { message: String },
}

impl CutoverError {
    pub fn traffic(operation: &str, message: impl Into<String>) -> Self {
        Self::TrafficControl {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            Self::InvalidArtifact(_) => FailureCategory::InvalidArtifact,
            Self::PipelineFailed { .. } => FailureCategory::Pipeline,
            Self::ProvisioningTimeout { .. } => FailureCategory::Provisioning,
            Self::TrafficControl { operation, .. }
                if operation == ops::PROVISION_CANDIDATE || operation == ops::WAIT_FOR_CAPACITY =>
            {
                FailureCategory::Provisioning
            }
            Self::TrafficControl { .. } | Self::Aborted { .. } => FailureCategory::RolledBack,
            Self::ValidationTimeout { .. } | Self::ValidationFailed { .. } => {
                FailureCategory::Validation
            }
            Self::RollbackFailed { .. } => FailureCategory::Rollback,
        }
    }
}

/// Coarse failure buckets surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    InvalidArtifact,
    Pipeline,
    Provisioning,
    Validation,
    /// Rolled back for any other reason (shift failure, alarm, cancel).
    RolledBack,
    Rollback,
}

impl FailureCategory {
    /// CLI exit code for a deployment that ended in this category.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::InvalidArtifact => 2,
            Self::Pipeline => 3,
            Self::Provisioning => 4,
            Self::Validation => 5,
            Self::Rollback => 6,
            Self::RolledBack => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::InvalidArtifact => "invalid artifact",
            Self::Pipeline => "pipeline failure",
            Self::Provisioning => "provisioning failure",
            Self::Validation => "validation failure",
            Self::RolledBack => "rolled back",
            Self::Rollback => "rollback failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_errors_categorized_by_operation() {
        let err = CutoverError::traffic(ops::PROVISION_CANDIDATE, "scheduler rejected");
        assert_eq!(err.category(), FailureCategory::Provisioning);
        assert_eq!(err.category().exit_code(), 4);

        let err = CutoverError::traffic(ops::SHIFT_PRODUCTION, "listener update timed out");
        assert_eq!(err.category(), FailureCategory::RolledBack);
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes: std::collections::HashSet<i32> = [
            FailureCategory::InvalidArtifact,
            FailureCategory::Pipeline,
            FailureCategory::Provisioning,
            FailureCategory::Validation,
            FailureCategory::RolledBack,
            FailureCategory::Rollback,
        ]
        .into_iter()
        .map(FailureCategory::exit_code)
        .collect();
        assert_eq!(codes.len(), 6);
        assert!(!codes.contains(&0));
    }

    #[test]
    fn display_names_operation() {
        let err = CutoverError::traffic(ops::RETIRE_POOL, "timeout");
        assert_eq!(err.to_string(), "traffic control error in retire_pool: timeout");
    }
}
