//! Operator commands: deploy, cancel, rollback, approve, reject, alarm.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slipway_core::epoch_secs;
use slipway_pipeline::ArtifactEventListener;
use slipway_state::{
    DeploymentPhase, DeploymentRecord, OperatorSignal, QueueEntry, RequestSource, SignalEntry, StateStore,
};
use tracing::info;

use crate::error::{DeployError, DeployResult};

/// What `rollback` did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RollbackAction {
    /// The active deployment was told to roll back.
    Signalled { deployment_id: String },
    /// Nothing was in flight; the previous version was queued.
    Queued { seq: u64, version: String },
}

pub struct Operator {
    service: String,
    store: StateStore,
    listener: Arc<ArtifactEventListener>,
}

impl Operator {
    pub fn new(service: &str, store: StateStore, listener: Arc<ArtifactEventListener>) -> Self {
        Self {
            service: service.to_string(),
            store,
            listener,
        }
    }

    /// Queue a version from the configured repository.
    pub async fn deploy(&self, version: &str) -> DeployResult<QueueEntry> {
        Ok(self.listener.submit_version(version, RequestSource::Operator).await?)
    }

    /// Deliver a signal to the active deployment.
    pub fn signal(&self, signal: OperatorSignal) -> DeployResult<(DeploymentRecord, SignalEntry)> {
        let active = self
            .store
            .active_deployment(&self.service)?
            .ok_or_else(|| DeployError::NoActiveDeployment(self.service.clone()))?;
        let entry = self.store.push_signal(&active.id, signal, epoch_secs())?;
        info!(deployment = %active.id, signal = ?entry.signal, "operator signal delivered");
        Ok((active, entry))
    }

    pub fn cancel(&self) -> DeployResult<DeploymentRecord> {
        self.signal(OperatorSignal::Cancel).map(|(record, _)| record)
    }

    /// Roll back the active deployment, or redeploy the version that was in
    /// production before the current one when nothing is in flight.
    pub async fn rollback(&self) -> DeployResult<RollbackAction> {
        if self.store.active_deployment(&self.service)?.is_some() {
            let (record, _) = self.signal(OperatorSignal::Rollback)?;
            return Ok(RollbackAction::Signalled { deployment_id: record.id });
        }

        let version = self.previous_version()?;
        let entry = self.listener.submit_version(&version, RequestSource::Rollback).await?;
        info!(seq = entry.seq, %version, "rollback to previous version queued");
        Ok(RollbackAction::Queued { seq: entry.seq, version })
    }

    /// Most recent completed version that differs from the current one.
    pub fn previous_version(&self) -> DeployResult<String> {
        let completed: Vec<DeploymentRecord> = self
            .store
            .list_deployments(&self.service)?
            .into_iter()
            .filter(|d| d.phase == DeploymentPhase::Completed)
            .collect();
        let nothing = || DeployError::NothingToRollBack(self.service.clone());

        let current = completed.last().ok_or_else(nothing)?.version();
        completed
            .iter()
            .rev()
            .map(DeploymentRecord::version)
            .find(|v| *v != current)
            .map(str::to_string)
            .ok_or_else(nothing)
    }
}
