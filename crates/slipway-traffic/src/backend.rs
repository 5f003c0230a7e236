//! Interfaces to the external task scheduler and load balancer.
//!
//! The traffic controller only talks to infrastructure through these two
//! traits. [`crate::local`] provides implementations backed by the state
//! store; tests substitute their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slipway_state::{InstanceHandle, InstanceStatus, PoolSlot, TaskDefinition};
use thiserror::Error;

/// Errors reported by a scheduler or load-balancer backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Transient failure: timeout, throttling, connection reset.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The backend refused the request outright.
    #[error("rejected: {0}")]
    Rejected(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// What the scheduler needs to start instances for a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSpec {
    pub service: String,
    pub pool: PoolSlot,
    pub generation: u64,
    pub task: TaskDefinition,
    /// Number of instances to create.
    pub count: u32,
}

/// Scheduler view of a single instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub status: InstanceStatus,
    /// Reachable address (ip:port), once assigned.
    pub address: Option<String>,
}

/// The managed task scheduler.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    async fn create_instances(&self, spec: &PoolSpec) -> BackendResult<Vec<InstanceHandle>>;

    async fn destroy_instances(&self, handles: &[InstanceHandle]) -> BackendResult<()>;

    async fn describe_instance(&self, handle: &str) -> BackendResult<InstanceDescription>;
}

/// The load balancer fronting the service. Each listener routes 100% of
/// its traffic to exactly one pool.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    async fn set_listener_target(&self, listener: &str, pool: PoolSlot) -> BackendResult<()>;

    async fn get_listener_target(&self, listener: &str) -> BackendResult<Option<PoolSlot>>;
}
