//! Domain types for the Slipway state store.
//!
//! These types represent the persisted state of deployment requests,
//! deployments, pools, instances, listeners and operator signals. All
//! types are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use slipway_core::{ArtifactError, ArtifactRef, FailureCategory};

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Scheduler-issued handle for a running instance.
pub type InstanceHandle = String;

// ── Pools ──────────────────────────────────────────────────────────

/// One of the two interchangeable instance pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSlot {
    Blue,
    Green,
}

impl PoolSlot {
    pub const ALL: [PoolSlot; 2] = [PoolSlot::Blue, PoolSlot::Green];

    /// The slot that is not `self`.
    pub fn other(self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blue" => Some(Self::Blue),
            "green" => Some(Self::Green),
            _ => None,
        }
    }
}

impl fmt::Display for PoolSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRole {
    Production,
    Candidate,
    Idle,
}

/// A named, sized group of running service instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolRecord {
    pub service: String,
    pub id: PoolSlot,
    pub role: PoolRole,
    /// Artifact version the instances run.
    pub version: Option<String>,
    /// Task definition new instances are created from.
    #[serde(default)]
    pub task: Option<TaskDefinition>,
    /// Deployment that provisioned the current generation.
    pub deployment_id: Option<DeploymentId>,
    /// Bumped every time the pool is provisioned from scratch.
    pub generation: u64,
    pub desired_count: u32,
    pub instances: Vec<InstanceHandle>,
    pub health: BTreeMap<InstanceHandle, HealthStatus>,
    /// Locked against autoscaling while the pool is being validated.
    pub under_validation: bool,
    pub updated_at: u64,
}

impl PoolRecord {
    /// An empty, idle pool.
    pub fn empty(service: &str, id: PoolSlot) -> Self {
        Self {
            service: service.to_string(),
            id,
            role: PoolRole::Idle,
            version: None,
            task: None,
            deployment_id: None,
            generation: 0,
            desired_count: 0,
            instances: Vec::new(),
            health: BTreeMap::new(),
            under_validation: false,
            updated_at: 0,
        }
    }

    pub fn current_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn table_key(&self) -> String {
        pool_key(&self.service, self.id)
    }
}

/// Composite key for the pools table.
pub fn pool_key(service: &str, id: PoolSlot) -> String {
    format!("{service}/{id}")
}

// ── Instances ──────────────────────────────────────────────────────

/// Lifecycle status reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Health status as determined by health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// An instance as tracked by the local scheduler backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub handle: InstanceHandle,
    pub pool: PoolSlot,
    pub image: String,
    /// Listen address (ip:port).
    pub address: String,
    pub status: InstanceStatus,
    /// Unix timestamp (millis) when the instance was created.
    pub created_at_ms: u64,
    /// Unix timestamp (millis) after which a pending instance reports running.
    pub ready_at_ms: u64,
}

// ── Listeners ──────────────────────────────────────────────────────

/// Load-balancer listener target as recorded by the local backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerRecord {
    pub listener: String,
    pub target: Option<PoolSlot>,
    pub updated_at: u64,
}

/// Which pool each listener routes to. Each listener sends 100% of its
/// traffic to exactly one pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficSplit {
    pub service: String,
    pub production: PoolSlot,
    pub test: Option<PoolSlot>,
    pub updated_at: u64,
}

// ── Requests and descriptors ───────────────────────────────────────

/// Resource quantities requested per instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    /// CPU units (1024 = one vCPU).
    pub cpu: u32,
    pub memory_mib: u32,
    pub container_port: u16,
}

/// Where a deployment request came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestSource {
    /// Registry publish event.
    Event,
    /// `slipway deploy`.
    Operator,
    /// `slipway rollback` with nothing in flight.
    Rollback,
}

/// A normalized request to deploy one artifact version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRequest {
    pub id: String,
    pub service: String,
    pub version: String,
    pub registry_location: String,
    pub task: TaskSpec,
    pub source: RequestSource,
    /// Unix timestamp when the artifact was published, if known.
    pub published_at: Option<u64>,
    pub submitted_at: u64,
}

impl DeploymentRequest {
    pub fn artifact(&self) -> Result<ArtifactRef, ArtifactError> {
        ArtifactRef::parse(&self.registry_location, &self.version)
    }
}

/// Resolved task definition handed to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub image: String,
    pub version: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub container_port: u16,
    /// Rendered scheduler manifest.
    pub manifest: serde_json::Value,
}

/// Sub-protocol run before the atomic production swap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ShiftPolicy {
    /// Swap immediately.
    AllAtOnce,
    /// Spaced health checkpoints on the candidate, then swap.
    Linear { steps: u32, step_interval_ms: u64 },
    /// Observe the candidate behind the test listener, then swap.
    CanaryWithBake { observation_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficShiftPolicy {
    pub shift: ShiftPolicy,
    pub bake_ms: u64,
    pub rollback_on_alarm: bool,
}

/// Timing and threshold knobs resolved from configuration at render time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationTimings {
    pub provision_timeout_ms: u64,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub unknown_budget: u32,
    pub traffic_window_ms: u64,
    pub require_approval: bool,
    pub synthetic_checks: bool,
}

/// Everything the state machine needs to run one deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentDescriptor {
    pub service: String,
    pub version: String,
    pub task: TaskDefinition,
    pub desired_count: u32,
    pub policy: TrafficShiftPolicy,
    pub timings: ValidationTimings,
}

// ── Deployments ────────────────────────────────────────────────────

/// State of a single deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Pending,
    Provisioning,
    ValidatingHealth,
    ValidatingTraffic,
    ShiftingProduction,
    Baking,
    Completed,
    RollingBack,
    RolledBack,
    Failed,
}

impl DeploymentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    /// Machine-readable state name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Provisioning => "Provisioning",
            Self::ValidatingHealth => "ValidatingHealth",
            Self::ValidatingTraffic => "ValidatingTraffic",
            Self::ShiftingProduction => "ShiftingProduction",
            Self::Baking => "Baking",
            Self::Completed => "Completed",
            Self::RollingBack => "RollingBack",
            Self::RolledBack => "RolledBack",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a deployment's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub from: DeploymentPhase,
    pub to: DeploymentPhase,
    /// Unix timestamp (millis).
    pub at_ms: u64,
    pub reason: Option<String>,
}

/// Why a deployment left the happy path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub category: FailureCategory,
    pub message: String,
    /// State the deployment was in when the failure occurred.
    pub phase: DeploymentPhase,
}

/// Pointers for an operator resolving a `Failed` deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Remediation {
    /// Pool the production listener targets, if it could be read.
    pub production_pool: Option<PoolSlot>,
    /// Pool left holding instances that serve no listener.
    pub orphaned_pool: Option<PoolSlot>,
    pub last_state: DeploymentPhase,
    pub last_error: String,
}

/// Terminal report for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub state: DeploymentPhase,
    pub summary: String,
    pub remediation: Option<Remediation>,
}

/// The live unit of orchestration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub service: String,
    /// Queue sequence number of the originating request.
    pub request_seq: u64,
    pub request: DeploymentRequest,
    pub descriptor: DeploymentDescriptor,
    pub phase: DeploymentPhase,
    /// Unix timestamp (millis).
    pub started_at_ms: u64,
    pub updated_at_ms: u64,
    pub history: Vec<StateTransition>,
    pub candidate_pool: Option<PoolSlot>,
    /// Production pool when the deployment started.
    pub prior_pool: Option<PoolSlot>,
    /// Set when an operator approves the production shift during
    /// `ValidatingTraffic`. Survives restarts.
    #[serde(default)]
    pub approved_at_ms: Option<u64>,
    pub failure: Option<FailureRecord>,
    pub outcome: Option<Outcome>,
}

impl DeploymentRecord {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn version(&self) -> &str {
        &self.descriptor.version
    }

    /// Category used for the CLI exit code; `None` for `Completed`.
    pub fn failure_category(&self) -> Option<FailureCategory> {
        match self.phase {
            DeploymentPhase::Completed => None,
            DeploymentPhase::Failed => Some(FailureCategory::Rollback),
            _ => self.failure.as_ref().map(|f| f.category),
        }
    }
}

// ── Queue ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Admitted { deployment_id: DeploymentId },
    PipelineFailed { error: String },
    Skipped { reason: String },
    Superseded { by_seq: u64 },
}

/// A deployment request waiting for (or past) admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    /// Submission order.
    pub seq: u64,
    pub request: DeploymentRequest,
    pub status: QueueStatus,
    pub updated_at: u64,
}

impl QueueEntry {
    pub fn table_key(&self) -> String {
        queue_key(&self.request.service, self.seq)
    }
}

/// Composite key for the queue table; zero-padded so keys sort by sequence.
pub fn queue_key(service: &str, seq: u64) -> String {
    format!("{service}:{seq:020}")
}

// ── Operator signals ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum OperatorSignal {
    Cancel,
    Rollback,
    Approve,
    Reject { reason: String },
    Alarm { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEntry {
    pub deployment_id: DeploymentId,
    pub seq: u64,
    pub signal: OperatorSignal,
    pub received_at: u64,
}

// ── Metrics ────────────────────────────────────────────────────────

/// Point-in-time utilization of one pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtilizationSample {
    pub service: String,
    pub pool: PoolSlot,
    /// Unix timestamp (seconds).
    pub epoch: u64,
    /// CPU utilization percentage (0-100).
    pub utilization: f64,
}

impl UtilizationSample {
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", metrics_prefix(&self.service, self.pool), self.epoch)
    }
}

pub fn metrics_prefix(service: &str, pool: PoolSlot) -> String {
    format!("{service}/{pool}")
}
