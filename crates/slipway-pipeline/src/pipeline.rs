//! Source → Configure → Dispatch.
//!
//! Every stage is a pure function of the store and the configuration, so
//! re-running a stage after a crash or a transient failure is harmless.
//! Dispatch upserts a `Pending` deployment whose id is derived from the
//! request id.

use std::sync::Arc;

use slipway_core::config::ShiftMode;
use slipway_core::{ArtifactError, CutoverError, RetryPolicy, SlipwayConfig, epoch_millis, stable_id};
use slipway_state::{
    DeploymentDescriptor, DeploymentPhase, DeploymentRecord, DeploymentRequest, PoolRole, QueueEntry,
    ShiftPolicy, StateError, StateStore, TaskDefinition, TrafficShiftPolicy, ValidationTimings,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::render::{DEFAULT_TEMPLATE, RenderError, render_manifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Source,
    Configure,
    Dispatch,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Configure => "configure",
            Self::Dispatch => "dispatch",
        }
    }
}

#[derive(Debug, Error)]
enum StageError {
    #[error("queue entry {0} not found")]
    MissingEntry(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub struct Pipeline {
    store: StateStore,
    config: Arc<SlipwayConfig>,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(store: StateStore, config: Arc<SlipwayConfig>) -> Self {
        let retry = config.pipeline.retry_policy();
        Self { store, config, retry }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run all three stages for a queue entry.
    pub async fn run(&self, entry: &QueueEntry) -> Result<DeploymentRecord, CutoverError> {
        debug!(seq = entry.seq, version = %entry.request.version, "pipeline started");

        let request = self
            .stage(Stage::Source, || self.source(entry))
            .await?;
        let request = &request;
        let descriptor = self
            .stage(Stage::Configure, || self.configure(request))
            .await?;
        let descriptor = &descriptor;
        let record = self
            .stage(Stage::Dispatch, || self.dispatch(entry.seq, request, descriptor))
            .await?;

        info!(seq = entry.seq, deployment = %record.id, version = %record.version(), "request dispatched");
        Ok(record)
    }

    async fn stage<T>(
        &self,
        stage: Stage,
        mut f: impl FnMut() -> Result<T, StageError>,
    ) -> Result<T, CutoverError> {
        let operation = format!("pipeline.{}", stage.as_str());
        self.retry
            .run(&operation, |_| std::future::ready(f()))
            .await
            .map_err(|e| CutoverError::PipelineFailed {
                stage: stage.as_str().to_string(),
                message: e.to_string(),
            })
    }

    // ── Source ─────────────────────────────────────────────────────

    fn source(&self, entry: &QueueEntry) -> Result<DeploymentRequest, StageError> {
        let stored = self
            .store
            .get_queue_entry(&entry.request.service, entry.seq)?
            .ok_or(StageError::MissingEntry(entry.seq))?;

        let mut request = stored.request;
        let defaults = &self.config.task;
        if request.task.cpu == 0 {
            request.task.cpu = defaults.cpu;
        }
        if request.task.memory_mib == 0 {
            request.task.memory_mib = defaults.memory_mib;
        }
        if request.task.container_port == 0 {
            request.task.container_port = defaults.container_port;
        }

        if request.version.trim().is_empty() {
            return Err(StageError::InvalidRequest("empty version".to_string()));
        }
        if request.task.cpu == 0 || request.task.memory_mib == 0 || request.task.container_port == 0 {
            return Err(StageError::InvalidRequest(format!(
                "task quantities must be positive: {:?}",
                request.task
            )));
        }
        request.artifact()?;
        Ok(request)
    }

    // ── Configure ──────────────────────────────────────────────────

    fn configure(&self, request: &DeploymentRequest) -> Result<DeploymentDescriptor, StageError> {
        let config = &self.config;
        let artifact = request.artifact()?;

        let mut task = TaskDefinition {
            image: artifact.image(),
            version: request.version.clone(),
            cpu: request.task.cpu,
            memory_mib: request.task.memory_mib,
            container_port: request.task.container_port,
            manifest: serde_json::Value::Null,
        };
        let template = config.task.manifest_template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
        task.manifest = render_manifest(template, &request.service, &task)?;

        Ok(DeploymentDescriptor {
            service: request.service.clone(),
            version: request.version.clone(),
            task,
            desired_count: self.desired_count(&request.service)?,
            policy: TrafficShiftPolicy {
                shift: shift_policy(config),
                bake_ms: config.shift.bake().as_millis() as u64,
                rollback_on_alarm: config.shift.rollback_on_alarm,
            },
            timings: ValidationTimings {
                provision_timeout_ms: config.traffic.provision_timeout().as_millis() as u64,
                health_interval_ms: config.health.interval().as_millis() as u64,
                health_timeout_ms: config.health.validation_timeout().as_millis() as u64,
                healthy_threshold: config.health.healthy_threshold,
                unhealthy_threshold: config.health.unhealthy_threshold,
                unknown_budget: config.health.unknown_budget,
                traffic_window_ms: config.traffic.window().as_millis() as u64,
                require_approval: config.traffic.require_approval,
                synthetic_checks: config.traffic.synthetic_checks,
            },
        })
    }

    /// Candidates start at the production pool's current size (it may have
    /// been autoscaled), or the configured size for a first deployment.
    fn desired_count(&self, service: &str) -> Result<u32, StageError> {
        let pools = &self.config.pools;
        let production = self
            .store
            .list_pools(service)?
            .into_iter()
            .find(|p| p.role == PoolRole::Production && p.desired_count > 0);
        let count = production.map_or(pools.desired, |p| p.desired_count);
        Ok(count.clamp(pools.min.max(1), pools.max.max(1)))
    }

    // ── Dispatch ───────────────────────────────────────────────────

    fn dispatch(
        &self,
        seq: u64,
        request: &DeploymentRequest,
        descriptor: &DeploymentDescriptor,
    ) -> Result<DeploymentRecord, StageError> {
        let id = deployment_id(request);
        if let Some(existing) = self.store.get_deployment(&id)? {
            debug!(deployment = %id, phase = %existing.phase, "already dispatched");
            return Ok(existing);
        }

        let now = epoch_millis();
        let record = DeploymentRecord {
            id,
            service: request.service.clone(),
            request_seq: seq,
            request: request.clone(),
            descriptor: descriptor.clone(),
            phase: DeploymentPhase::Pending,
            started_at_ms: now,
            updated_at_ms: now,
            history: Vec::new(),
            candidate_pool: None,
            prior_pool: None,
            approved_at_ms: None,
            failure: None,
            outcome: None,
        };
        self.store.put_deployment(&record)?;
        Ok(record)
    }
}

/// Deployment id for a request; the same request always maps to the same id.
pub fn deployment_id(request: &DeploymentRequest) -> String {
    stable_id("dep", &[&request.service, &request.id])
}

fn shift_policy(config: &SlipwayConfig) -> ShiftPolicy {
    let shift = &config.shift;
    match shift.mode {
        ShiftMode::AllAtOnce => ShiftPolicy::AllAtOnce,
        ShiftMode::Linear => ShiftPolicy::Linear {
            steps: shift.steps.max(1),
            step_interval_ms: shift.step_interval().as_millis() as u64,
        },
        ShiftMode::Canary => ShiftPolicy::CanaryWithBake {
            observation_ms: shift.observation().as_millis() as u64,
        },
    }
}
