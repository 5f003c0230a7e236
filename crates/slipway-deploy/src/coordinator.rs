//! Admission coordinator — keeps at most one deployment per service active.
//!
//! Each step of the loop does exactly one of:
//!
//! 1. resume the non-terminal deployment left by a previous process,
//! 2. re-run an admitted request whose deployment was never recorded,
//! 3. admit the next queued request (or skip / supersede it).
//!
//! Deployments run in their own task; the coordinator waits for them to
//! finish before admitting anything else.

use std::sync::Arc;
use std::time::Duration;

use slipway_core::config::QueuePolicy;
use slipway_core::{SlipwayConfig, epoch_secs};
use slipway_pipeline::{Pipeline, deployment_id};
use slipway_state::{DeploymentRecord, QueueEntry, QueueStatus, StateStore};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::error::{DeployError, DeployResult};
use crate::machine::{DeploymentMachine, MachineDeps};

pub struct Coordinator {
    service: String,
    store: StateStore,
    pipeline: Pipeline,
    deps: MachineDeps,
    policy: QueuePolicy,
    wake: Arc<Notify>,
    idle_poll: Duration,
}

impl Coordinator {
    pub fn new(config: &SlipwayConfig, pipeline: Pipeline, deps: MachineDeps, wake: Arc<Notify>) -> Self {
        Self {
            service: config.service.name.clone(),
            store: deps.store.clone(),
            pipeline,
            deps,
            policy: config.queue.policy,
            wake,
            idle_poll: Duration::from_secs(5),
        }
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Admit requests until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(service = %self.service, policy = ?self.policy, "admission coordinator started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.step(&mut shutdown).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(service = %self.service, error = %e, "admission step failed"),
            }

            tokio::select! {
                _ = self.wake.notified() => debug!("coordinator woken"),
                _ = tokio::time::sleep(self.idle_poll) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!(service = %self.service, "admission coordinator stopped");
    }

    /// Do one unit of admission work. Returns `false` when there was
    /// nothing to do.
    pub async fn step(&self, shutdown: &mut watch::Receiver<bool>) -> DeployResult<bool> {
        if let Some(active) = self.store.active_deployment(&self.service)? {
            info!(deployment = %active.id, phase = %active.phase, "resuming deployment");
            self.run_deployment(active, shutdown).await?;
            return Ok(true);
        }

        if let Some(entry) = self.stuck_entry()? {
            warn!(seq = entry.seq, "admitted request has no deployment, re-running pipeline");
            self.dispatch(entry, shutdown).await?;
            return Ok(true);
        }

        let Some(entry) = self.next_entry()? else {
            return Ok(false);
        };

        if let Some(reason) = self.skip_reason(&entry.request.version).await? {
            info!(seq = entry.seq, version = %entry.request.version, %reason, "request skipped");
            self.set_status(entry, QueueStatus::Skipped { reason })?;
            return Ok(true);
        }

        let id = deployment_id(&entry.request);
        let entry = self.set_status(entry, QueueStatus::Admitted { deployment_id: id })?;
        info!(seq = entry.seq, version = %entry.request.version, "request admitted");
        self.dispatch(entry, shutdown).await?;
        Ok(true)
    }

    fn stuck_entry(&self) -> DeployResult<Option<QueueEntry>> {
        for entry in self.store.list_queue(&self.service)? {
            if let QueueStatus::Admitted { deployment_id } = &entry.status
                && self.store.get_deployment(deployment_id)?.is_none()
            {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Pick the queued entry to admit next, superseding older entries under
    /// `keep-latest`.
    fn next_entry(&self) -> DeployResult<Option<QueueEntry>> {
        let mut pending = self.store.pending_requests(&self.service)?;
        match self.policy {
            QueuePolicy::RunEachInTurn => Ok(pending.into_iter().next()),
            QueuePolicy::KeepLatest => {
                let Some(latest) = pending.pop() else {
                    return Ok(None);
                };
                for older in pending {
                    info!(seq = older.seq, by = latest.seq, "request superseded");
                    self.set_status(older, QueueStatus::Superseded { by_seq: latest.seq })?;
                }
                Ok(Some(latest))
            }
        }
    }

    /// A version already in production, or already being deployed, is not
    /// deployed again. "In production" means running on the pool the
    /// production listener targets, whatever the deployment history says.
    async fn skip_reason(&self, version: &str) -> DeployResult<Option<String>> {
        if let Some(active) = self.store.active_deployment(&self.service)?
            && active.version() == version
        {
            return Ok(Some(format!("{version} is already being deployed by {}", active.id)));
        }
        let Some(production) = self.deps.traffic.production_pool().await? else {
            return Ok(None);
        };
        let pool = self.deps.traffic.pool(production)?;
        if pool.version.as_deref() == Some(version) && !pool.instances.is_empty() {
            return Ok(Some(format!("{version} is already in production on {production}")));
        }
        Ok(None)
    }

    fn set_status(&self, mut entry: QueueEntry, status: QueueStatus) -> DeployResult<QueueEntry> {
        entry.status = status;
        entry.updated_at = epoch_secs();
        self.store.put_queue_entry(&entry)?;
        Ok(entry)
    }

    async fn dispatch(&self, entry: QueueEntry, shutdown: &mut watch::Receiver<bool>) -> DeployResult<()> {
        match self.pipeline.run(&entry).await {
            Ok(record) => {
                self.run_deployment(record, shutdown).await?;
            }
            Err(e) => {
                warn!(seq = entry.seq, version = %entry.request.version, error = %e, "pipeline failed");
                self.set_status(entry, QueueStatus::PipelineFailed { error: e.to_string() })?;
            }
        }
        Ok(())
    }

    /// Run a deployment in its own task and wait for it. On shutdown the
    /// task is aborted; the persisted record resumes on the next start.
    async fn run_deployment(
        &self,
        record: DeploymentRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DeployResult<Option<DeploymentRecord>> {
        if record.is_terminal() {
            debug!(deployment = %record.id, phase = %record.phase, "deployment already finished");
            return Ok(Some(record));
        }

        let id = record.id.clone();
        let mut handle = tokio::spawn(DeploymentMachine::new(self.deps.clone(), record).run());

        tokio::select! {
            joined = &mut handle => {
                let finished = joined.map_err(|e| DeployError::Task(e.to_string()))??;
                Ok(Some(finished))
            }
            _ = shutdown_requested(shutdown) => {
                handle.abort();
                info!(deployment = %id, "deployment interrupted by shutdown; it resumes on restart");
                Ok(None)
            }
        }
    }
}

/// Resolves once `true` is sent. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
