//! ArtifactEvent listener — validates publish events and enqueues requests.
//!
//! The listener never waits for a deployment: a valid event becomes a
//! `Queued` entry in the durable queue and the coordinator is woken.
//! Invalid events are logged and reported back to the caller; they never
//! affect other events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slipway_core::{ArtifactRef, CutoverError, SlipwayConfig, epoch_millis, epoch_secs, stable_id};
use slipway_state::{DeploymentRequest, QueueEntry, RequestSource, StateStore, TaskSpec};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::registry::ArtifactRegistry;

/// Inbound notification that an artifact version was published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEvent {
    pub artifact_version: String,
    pub registry_location: String,
    /// Unix seconds.
    #[serde(default)]
    pub published_at: Option<u64>,
}

pub struct ArtifactEventListener {
    store: StateStore,
    registry: Arc<dyn ArtifactRegistry>,
    service: String,
    /// Expected `registry/repository`.
    repository: String,
    task: TaskSpec,
    /// Wakes the admission coordinator.
    wake: Arc<Notify>,
}

impl ArtifactEventListener {
    pub fn new(
        config: &SlipwayConfig,
        store: StateStore,
        registry: Arc<dyn ArtifactRegistry>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            service: config.service.name.clone(),
            repository: config.service.repository.clone(),
            task: TaskSpec {
                cpu: config.task.cpu,
                memory_mib: config.task.memory_mib,
                container_port: config.task.container_port,
            },
            wake,
        }
    }

    /// Validate a publish event and enqueue it.
    pub async fn handle_event(&self, event: &ArtifactEvent) -> Result<QueueEntry, CutoverError> {
        self.submit(
            &event.artifact_version,
            &event.registry_location,
            RequestSource::Event,
            event.published_at,
        )
        .await
    }

    /// Enqueue a version from the configured repository on an operator's
    /// behalf (`slipway deploy`, `slipway rollback`).
    pub async fn submit_version(&self, version: &str, source: RequestSource) -> Result<QueueEntry, CutoverError> {
        let location = self.repository.clone();
        self.submit(version, &location, source, None).await
    }

    async fn submit(
        &self,
        version: &str,
        location: &str,
        source: RequestSource,
        published_at: Option<u64>,
    ) -> Result<QueueEntry, CutoverError> {
        let artifact = match self.validate(version, location).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(%version, %location, ?source, error = %e, "artifact rejected");
                return Err(e);
            }
        };

        let submitted_at = epoch_secs();
        let request = DeploymentRequest {
            id: stable_id(
                "req",
                &[&self.service, version, &source_tag(source), &epoch_millis().to_string()],
            ),
            service: self.service.clone(),
            version: artifact.tag.clone(),
            registry_location: artifact.location(),
            task: self.task,
            source,
            published_at,
            submitted_at,
        };

        let entry = self
            .store
            .enqueue_request(&request)
            .map_err(|e| CutoverError::PipelineFailed {
                stage: "enqueue".to_string(),
                message: e.to_string(),
            })?;
        self.wake.notify_one();

        info!(seq = entry.seq, version = %request.version, ?source, "deployment request queued");
        Ok(entry)
    }

    async fn validate(&self, version: &str, location: &str) -> Result<ArtifactRef, CutoverError> {
        let invalid = |e: &dyn std::fmt::Display| CutoverError::InvalidArtifact(e.to_string());
        let artifact = ArtifactRef::parse(location, version).map_err(|e| invalid(&e))?;
        artifact.expect_repository(&self.repository).map_err(|e| invalid(&e))?;
        self.registry.lookup(&artifact).await.map_err(|e| invalid(&e))?;
        Ok(artifact)
    }
}

fn source_tag(source: RequestSource) -> String {
    format!("{source:?}")
}
