//! Deployment state machine.
//!
//! One [`DeploymentMachine`] drives one deployment from `Pending` to a
//! terminal state. Each transition is written to the store before the next
//! state's side effects begin, and every state's entry actions can be
//! repeated, so a machine built from a persisted record resumes where the
//! previous process stopped.
//!
//! Operator signals (cancel, rollback, approve, reject, alarm) are read from
//! the store at every wait point.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use slipway_core::error::ops;
use slipway_core::{CutoverError, SlipwayConfig, epoch_millis};
use slipway_health::{HealthProbe, HealthTracker, PoolValidation, Thresholds, Verdict, http_check};
use slipway_state::{
    DeploymentPhase, DeploymentRecord, FailureRecord, HealthStatus, InstanceHandle, OperatorSignal, Outcome,
    PoolSlot, Remediation, ShiftPolicy, StateError, StateResult, StateStore, StateTransition,
};
use slipway_traffic::{TrafficController, TrafficError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Test listener address for synthetic checks.
    pub test_address: Option<String>,
    pub check_path: String,
    pub check_timeout: Duration,
    /// How often operator signals are read while waiting.
    pub signal_poll: Duration,
}

impl MachineSettings {
    pub fn from_config(config: &SlipwayConfig) -> Self {
        Self {
            test_address: config.listeners.test_address.clone(),
            check_path: config.health.path.clone(),
            check_timeout: config.health.timeout(),
            signal_poll: Duration::from_millis(250),
        }
    }
}

/// Collaborators shared by every deployment of a service.
#[derive(Clone)]
pub struct MachineDeps {
    pub store: StateStore,
    pub traffic: Arc<TrafficController>,
    pub probe: Arc<dyn HealthProbe>,
    pub settings: MachineSettings,
}

enum PhaseError {
    Cutover(CutoverError),
    State(StateError),
}

impl From<CutoverError> for PhaseError {
    fn from(e: CutoverError) -> Self {
        PhaseError::Cutover(e)
    }
}

impl From<StateError> for PhaseError {
    fn from(e: StateError) -> Self {
        PhaseError::State(e)
    }
}

type PhaseResult<T> = Result<T, PhaseError>;

struct Next {
    phase: DeploymentPhase,
    reason: Option<String>,
}

impl Next {
    fn to(phase: DeploymentPhase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            reason: Some(reason.into()),
        }
    }
}

/// Signals read so far and not yet acted on.
#[derive(Debug, Default)]
struct Mailbox {
    rejected: Option<String>,
    abort: Option<String>,
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub struct DeploymentMachine {
    deps: MachineDeps,
    record: DeploymentRecord,
    mailbox: Mailbox,
}

impl DeploymentMachine {
    pub fn new(deps: MachineDeps, record: DeploymentRecord) -> Self {
        Self {
            deps,
            record,
            mailbox: Mailbox::default(),
        }
    }

    pub fn record(&self) -> &DeploymentRecord {
        &self.record
    }

    /// Drive the deployment to a terminal state. Only store failures are
    /// returned as errors; everything else ends up on the record.
    pub async fn run(mut self) -> StateResult<DeploymentRecord> {
        info!(
            deployment = %self.record.id,
            version = %self.record.version(),
            phase = %self.record.phase,
            "deployment running"
        );

        loop {
            let result = match self.record.phase {
                DeploymentPhase::Pending => self.start().await,
                DeploymentPhase::Provisioning => self.provision().await,
                DeploymentPhase::ValidatingHealth => self.validate_health().await,
                DeploymentPhase::ValidatingTraffic => self.validate_traffic().await,
                DeploymentPhase::ShiftingProduction => self.shift().await,
                DeploymentPhase::Baking => self.bake().await,
                DeploymentPhase::RollingBack => self.roll_back().await,
                DeploymentPhase::Completed | DeploymentPhase::RolledBack | DeploymentPhase::Failed => break,
            };

            match result {
                Ok(next) => self.transition(next.phase, next.reason)?,
                Err(PhaseError::State(e)) => return Err(e),
                Err(PhaseError::Cutover(e)) if self.record.phase == DeploymentPhase::RollingBack => {
                    let next = self.rollback_failed(None, self.record.candidate_pool, e);
                    self.transition(next.phase, next.reason)?;
                }
                Err(PhaseError::Cutover(e)) => self.begin_rollback(e)?,
            }
        }

        info!(
            deployment = %self.record.id,
            phase = %self.record.phase,
            summary = ?self.record.outcome.as_ref().map(|o| &o.summary),
            "deployment finished"
        );
        Ok(self.record)
    }

    fn transition(&mut self, to: DeploymentPhase, reason: Option<String>) -> StateResult<()> {
        let from = self.record.phase;
        let now = epoch_millis();
        self.record.history.push(StateTransition {
            from,
            to,
            at_ms: now,
            reason: reason.clone(),
        });
        self.record.phase = to;
        self.record.updated_at_ms = now;
        self.deps.store.put_deployment(&self.record)?;
        info!(deployment = %self.record.id, %from, %to, reason = ?reason, "deployment transition");
        Ok(())
    }

    fn begin_rollback(&mut self, e: CutoverError) -> StateResult<()> {
        warn!(deployment = %self.record.id, phase = %self.record.phase, error = %e, "rolling back");
        self.record.failure = Some(FailureRecord {
            category: e.category(),
            message: e.to_string(),
            phase: self.record.phase,
        });
        self.transition(DeploymentPhase::RollingBack, Some(e.to_string()))
    }

    fn candidate(&self) -> PhaseResult<PoolSlot> {
        self.record
            .candidate_pool
            .ok_or_else(|| CutoverError::traffic(ops::PROVISION_CANDIDATE, "no candidate pool assigned").into())
    }

    fn phase_name(&self) -> String {
        self.record.phase.to_string()
    }

    // ── Signals ────────────────────────────────────────────────────

    fn read_signals(&mut self) -> StateResult<()> {
        for entry in self.deps.store.take_signals(&self.record.id)? {
            debug!(deployment = %self.record.id, signal = ?entry.signal, "operator signal");
            match entry.signal {
                OperatorSignal::Cancel => {
                    self.mailbox.abort.get_or_insert_with(|| "cancelled by operator".to_string());
                }
                OperatorSignal::Rollback => {
                    self.mailbox
                        .abort
                        .get_or_insert_with(|| "rollback requested by operator".to_string());
                }
                OperatorSignal::Approve => self.on_approve()?,
                OperatorSignal::Reject { reason } => self.on_reject(reason),
                OperatorSignal::Alarm { name } => self.on_alarm(name),
            }
        }
        Ok(())
    }

    /// Approvals only count while the test window is open; one read earlier
    /// would skip a window that has not started yet.
    fn on_approve(&mut self) -> StateResult<()> {
        let phase = self.record.phase;
        if phase != DeploymentPhase::ValidatingTraffic {
            warn!(deployment = %self.record.id, %phase, "approval ignored outside traffic validation");
        } else if self.record.approved_at_ms.is_none() {
            self.record.approved_at_ms = Some(epoch_millis());
            self.deps.store.put_deployment(&self.record)?;
        }
        Ok(())
    }

    fn on_reject(&mut self, reason: String) {
        let phase = self.record.phase;
        if phase == DeploymentPhase::ValidatingTraffic {
            self.mailbox.rejected = Some(reason);
        } else {
            warn!(deployment = %self.record.id, %phase, %reason, "rejection ignored outside traffic validation");
        }
    }

    fn on_alarm(&mut self, name: String) {
        let phase = self.record.phase;
        if phase != DeploymentPhase::Baking {
            debug!(deployment = %self.record.id, alarm = %name, %phase, "alarm ignored outside bake");
        } else if self.record.descriptor.policy.rollback_on_alarm {
            self.mailbox
                .abort
                .get_or_insert_with(|| format!("alarm {name} fired during bake"));
        } else {
            warn!(deployment = %self.record.id, alarm = %name, "alarm during bake, rollback_on_alarm is off");
        }
    }

    /// Read pending signals and fail with `Aborted` on cancel, rollback or
    /// an actionable alarm.
    fn check_signals(&mut self) -> PhaseResult<()> {
        self.read_signals()?;
        match self.mailbox.abort.take() {
            Some(reason) => Err(CutoverError::Aborted { reason }.into()),
            None => Ok(()),
        }
    }

    /// Sleep for `duration`, reading signals every `signal_poll`.
    async fn pause(&mut self, duration: Duration) -> PhaseResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_signals()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep(self.deps.settings.signal_poll.min(deadline - now)).await;
        }
    }

    /// Await `fut` while reading signals. `fut` must not borrow `self`.
    async fn interruptible<T>(&mut self, fut: impl Future<Output = T>) -> PhaseResult<T> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = tokio::time::sleep(self.deps.settings.signal_poll) => self.check_signals()?,
            }
        }
    }

    // ── Health helpers ─────────────────────────────────────────────

    fn instances_of(&self, slot: PoolSlot) -> PhaseResult<Vec<InstanceHandle>> {
        match self.deps.traffic.pool(slot) {
            Ok(pool) => Ok(pool.instances),
            Err(TrafficError::State(e)) => Err(e.into()),
            Err(e) => Err(e.into_cutover(ops::WAIT_FOR_CAPACITY).into()),
        }
    }

    fn validation_for(&self, slot: PoolSlot) -> PhaseResult<PoolValidation> {
        Ok(PoolValidation::new(
            &self.instances_of(slot)?,
            Thresholds::from_timings(&self.record.descriptor.timings),
        ))
    }

    /// Probe every instance once; an instance past the unhealthy threshold
    /// fails the current phase.
    async fn health_round(&mut self, slot: PoolSlot, validation: &mut PoolValidation) -> PhaseResult<Verdict> {
        let round = validation.round(self.deps.probe.as_ref()).await;
        self.store_health(slot, &round.observed).await;
        if let Verdict::Failed { instance, failures } = &round.verdict {
            return Err(CutoverError::ValidationFailed {
                phase: self.phase_name(),
                reason: format!("{instance} failed {failures} consecutive health checks"),
            }
            .into());
        }
        Ok(round.verdict)
    }

    async fn store_health(&self, slot: PoolSlot, observed: &BTreeMap<InstanceHandle, HealthStatus>) {
        if let Err(e) = self.deps.traffic.record_health(slot, observed).await {
            warn!(pool = %slot, error = %e, "failed to record pool health");
        }
    }

    /// Keep probing `slot` every health interval until `duration` elapses.
    async fn watch_pool(&mut self, slot: PoolSlot, duration: Duration) -> PhaseResult<()> {
        let interval = ms(self.record.descriptor.timings.health_interval_ms);
        let mut validation = self.validation_for(slot)?;
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.pause(interval.min(deadline - now)).await?;
            validation.sync(&self.instances_of(slot)?);
            self.health_round(slot, &mut validation).await?;
        }
    }

    // ── States ─────────────────────────────────────────────────────

    async fn start(&mut self) -> PhaseResult<Next> {
        self.check_signals()?;
        if self.record.candidate_pool.is_none() {
            let production = self
                .deps
                .traffic
                .production_pool()
                .await
                .map_err(|e| e.into_cutover(ops::PROVISION_CANDIDATE))?;
            self.record.prior_pool = production;
            self.record.candidate_pool = Some(production.map_or(PoolSlot::Blue, PoolSlot::other));
        }
        let candidate = self.candidate()?;
        Ok(Next::to(
            DeploymentPhase::Provisioning,
            format!("candidate pool {candidate}"),
        ))
    }

    async fn provision(&mut self) -> PhaseResult<Next> {
        self.check_signals()?;
        let candidate = self.candidate()?;
        let traffic = self.deps.traffic.clone();

        traffic
            .provision_candidate(candidate, &self.record.id, &self.record.descriptor)
            .await
            .map_err(|e| e.into_cutover(ops::PROVISION_CANDIDATE))?;

        let timeout = ms(self.record.descriptor.timings.provision_timeout_ms);
        let pool = self
            .interruptible(traffic.wait_for_capacity(candidate, timeout))
            .await?
            .map_err(|e| e.into_cutover(ops::WAIT_FOR_CAPACITY))?;

        Ok(Next::to(
            DeploymentPhase::ValidatingHealth,
            format!("{} instances running in {candidate}", pool.current_count()),
        ))
    }

    async fn validate_health(&mut self) -> PhaseResult<Next> {
        self.check_signals()?;
        let candidate = self.candidate()?;
        let timings = self.record.descriptor.timings.clone();
        let interval = ms(timings.health_interval_ms);
        let deadline = Instant::now() + ms(timings.health_timeout_ms);
        let mut validation = self.validation_for(candidate)?;

        loop {
            if self.health_round(candidate, &mut validation).await? == Verdict::Passed {
                return Ok(Next::to(
                    DeploymentPhase::ValidatingTraffic,
                    format!("candidate healthy after {} rounds", validation.rounds()),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CutoverError::ValidationTimeout {
                    phase: self.phase_name(),
                }
                .into());
            }
            self.pause(interval.min(deadline - now)).await?;
        }
    }

    async fn validate_traffic(&mut self) -> PhaseResult<Next> {
        self.check_signals()?;
        let candidate = self.candidate()?;
        self.deps
            .traffic
            .route_test_traffic(candidate)
            .await
            .map_err(|e| e.into_cutover(ops::ROUTE_TEST_TRAFFIC))?;

        let timings = self.record.descriptor.timings.clone();
        let window = ms(timings.traffic_window_ms);
        let interval = ms(timings.health_interval_ms);
        let deadline = Instant::now() + window;
        let mut synthetic = self.synthetic_checker(timings.synthetic_checks, Thresholds::from_timings(&timings));
        let mut next_check = Instant::now();

        loop {
            self.check_signals()?;
            if let Some(reason) = self.mailbox.rejected.take() {
                return Err(CutoverError::ValidationFailed {
                    phase: self.phase_name(),
                    reason: format!("rejected: {reason}"),
                }
                .into());
            }
            if self.record.approved_at_ms.is_some() {
                return Ok(Next::to(DeploymentPhase::ShiftingProduction, "approved by operator"));
            }

            let now = Instant::now();
            if let Some((address, tracker)) = synthetic.as_mut()
                && now >= next_check
            {
                let settings = &self.deps.settings;
                let status = http_check(address, &settings.check_path, settings.check_timeout).await;
                tracker.record(status);
                if tracker.has_failed() {
                    return Err(CutoverError::ValidationFailed {
                        phase: self.phase_name(),
                        reason: format!(
                            "synthetic check against {address} failed {} times",
                            tracker.consecutive_failures()
                        ),
                    }
                    .into());
                }
                next_check = now + interval;
            }

            if now >= deadline {
                if timings.require_approval {
                    return Err(CutoverError::ValidationTimeout {
                        phase: self.phase_name(),
                    }
                    .into());
                }
                return Ok(Next::to(
                    DeploymentPhase::ShiftingProduction,
                    format!("traffic window of {window:?} passed"),
                ));
            }
            tokio::time::sleep(self.deps.settings.signal_poll.min(deadline - now)).await;
        }
    }

    fn synthetic_checker(&self, enabled: bool, thresholds: Thresholds) -> Option<(String, HealthTracker)> {
        if !enabled {
            return None;
        }
        match &self.deps.settings.test_address {
            Some(address) => Some((address.clone(), HealthTracker::new(thresholds))),
            None => {
                warn!(deployment = %self.record.id, "synthetic checks enabled without listeners.test_address");
                None
            }
        }
    }

    async fn shift(&mut self) -> PhaseResult<Next> {
        self.check_signals()?;
        let candidate = self.candidate()?;
        let traffic = self.deps.traffic.clone();

        let current = traffic
            .production_pool()
            .await
            .map_err(|e| e.into_cutover(ops::SHIFT_PRODUCTION))?;
        if current == Some(candidate) {
            info!(deployment = %self.record.id, pool = %candidate, "production already on candidate");
        } else {
            self.before_swap(candidate).await?;
        }

        traffic
            .shift_production(candidate)
            .await
            .map_err(|e| e.into_cutover(ops::SHIFT_PRODUCTION))?;

        let from = self.record.prior_pool.map_or("none".to_string(), |p| p.to_string());
        Ok(Next::to(
            DeploymentPhase::Baking,
            format!("production shifted {from} -> {candidate}"),
        ))
    }

    /// Sub-protocol selected by the shift policy, run before the swap.
    async fn before_swap(&mut self, candidate: PoolSlot) -> PhaseResult<()> {
        match self.record.descriptor.policy.shift.clone() {
            ShiftPolicy::AllAtOnce => Ok(()),
            ShiftPolicy::Linear { steps, step_interval_ms } => {
                let mut validation = self.validation_for(candidate)?;
                for step in 1..=steps {
                    self.pause(ms(step_interval_ms)).await?;
                    self.health_round(candidate, &mut validation).await?;
                    info!(deployment = %self.record.id, step, steps, "shift checkpoint passed");
                }
                Ok(())
            }
            ShiftPolicy::CanaryWithBake { observation_ms } => {
                info!(deployment = %self.record.id, observation_ms, "observing candidate on test listener");
                self.watch_pool(candidate, ms(observation_ms)).await
            }
        }
    }

    async fn bake(&mut self) -> PhaseResult<Next> {
        self.check_signals()?;
        let candidate = self.candidate()?;
        let policy = self.record.descriptor.policy.clone();
        let bake = ms(policy.bake_ms);

        if policy.rollback_on_alarm {
            self.watch_pool(candidate, bake).await?;
        } else {
            self.pause(bake).await?;
        }
        self.complete(candidate).await
    }

    /// Release the new production pool to the autoscaler and retire the
    /// previous one. A pool that cannot be retired is reported as orphaned;
    /// the deployment still completes.
    async fn complete(&mut self, candidate: PoolSlot) -> PhaseResult<Next> {
        match self.deps.traffic.set_under_validation(candidate, false).await {
            Ok(()) => {}
            Err(TrafficError::State(e)) => return Err(e.into()),
            Err(e) => return Err(e.into_cutover(ops::SCALE_POOL).into()),
        }

        let version = self.record.version().to_string();
        let mut summary = format!("{version} serving from {candidate}");
        let mut remediation = None;

        if let Some(prior) = self.record.prior_pool.filter(|p| *p != candidate) {
            match self.deps.traffic.retire_pool(prior).await {
                Ok(()) => summary.push_str(&format!("; {prior} retired")),
                Err(e) => {
                    warn!(deployment = %self.record.id, pool = %prior, error = %e, "previous pool not retired");
                    summary.push_str(&format!("; {prior} could not be retired"));
                    remediation = Some(Remediation {
                        production_pool: Some(candidate),
                        orphaned_pool: Some(prior),
                        last_state: DeploymentPhase::Baking,
                        last_error: e.to_string(),
                    });
                }
            }
        }

        self.record.outcome = Some(Outcome {
            state: DeploymentPhase::Completed,
            summary: summary.clone(),
            remediation,
        });
        Ok(Next::to(DeploymentPhase::Completed, summary))
    }

    /// Undo what is observable: re-shift production if it was moved, then
    /// retire the candidate.
    async fn roll_back(&mut self) -> PhaseResult<Next> {
        for entry in self.deps.store.take_signals(&self.record.id)? {
            debug!(deployment = %self.record.id, signal = ?entry.signal, "signal ignored during rollback");
        }

        let Some(candidate) = self.record.candidate_pool else {
            return Ok(self.rolled_back("nothing was provisioned".to_string()));
        };
        let prior = self.record.prior_pool;
        let traffic = self.deps.traffic.clone();

        let production = match traffic.production_pool().await {
            Ok(production) => production,
            Err(e) => return Ok(self.rollback_failed(None, Some(candidate), e)),
        };

        if production == Some(candidate) {
            let Some(prior) = prior else {
                return Ok(self.rollback_failed(
                    production,
                    None,
                    "no earlier production pool to return to; candidate left serving",
                ));
            };
            if let Err(e) = traffic.shift_production(prior).await {
                return Ok(self.rollback_failed(production, Some(prior), e));
            }
            info!(deployment = %self.record.id, pool = %prior, "production restored");
        }

        if let Err(e) = traffic.retire_pool(candidate).await {
            let production = if production == Some(candidate) { prior } else { production };
            return Ok(self.rollback_failed(production, Some(candidate), e));
        }

        let serving = match prior {
            Some(prior) => format!("production on {prior}"),
            None => "no production pool".to_string(),
        };
        Ok(self.rolled_back(format!("{candidate} retired; {serving}")))
    }

    fn rolled_back(&mut self, detail: String) -> Next {
        let cause = self
            .record
            .failure
            .as_ref()
            .map_or("rolled back".to_string(), |f| format!("rolled back from {}: {}", f.phase, f.message));
        let summary = format!("{} {cause}; {detail}", self.record.version());
        self.record.outcome = Some(Outcome {
            state: DeploymentPhase::RolledBack,
            summary: summary.clone(),
            remediation: None,
        });
        Next::to(DeploymentPhase::RolledBack, summary)
    }

    fn rollback_failed(
        &mut self,
        production: Option<PoolSlot>,
        orphaned: Option<PoolSlot>,
        e: impl std::fmt::Display,
    ) -> Next {
        let err = CutoverError::RollbackFailed { message: e.to_string() };
        error!(
            deployment = %self.record.id,
            production = ?production,
            orphaned = ?orphaned,
            error = %err,
            "rollback failed; manual intervention required"
        );
        let last_state = self
            .record
            .failure
            .as_ref()
            .map_or(DeploymentPhase::RollingBack, |f| f.phase);
        self.record.outcome = Some(Outcome {
            state: DeploymentPhase::Failed,
            summary: format!("{} {err}", self.record.version()),
            remediation: Some(Remediation {
                production_pool: production,
                orphaned_pool: orphaned,
                last_state,
                last_error: e.to_string(),
            }),
        });
        Next::to(DeploymentPhase::Failed, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use slipway_core::RetryPolicy;
    use slipway_state::{
        DeploymentDescriptor, DeploymentRequest, RequestSource, TaskDefinition, TaskSpec, TrafficShiftPolicy,
        ValidationTimings,
    };
    use slipway_traffic::{ControllerSettings, Listeners, LocalLoadBalancer, LocalScheduler};

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn check(&self, _instance: &str) -> HealthStatus {
            HealthStatus::Healthy
        }
    }

    fn deps(store: &StateStore) -> MachineDeps {
        let scheduler = Arc::new(LocalScheduler::new(store.clone(), Duration::ZERO, 9000));
        let balancer = Arc::new(LocalLoadBalancer::new(store.clone()));
        let settings = ControllerSettings {
            listeners: Listeners {
                production: "production".to_string(),
                test: "test".to_string(),
            },
            retry: RetryPolicy::immediate(2),
            drain_grace: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
        };
        MachineDeps {
            store: store.clone(),
            traffic: Arc::new(TrafficController::new("api", store.clone(), scheduler, balancer, settings)),
            probe: Arc::new(AlwaysHealthy),
            settings: MachineSettings {
                test_address: None,
                check_path: "/healthz".to_string(),
                check_timeout: Duration::from_millis(100),
                signal_poll: Duration::from_millis(5),
            },
        }
    }

    fn record(version: &str, window_ms: u64, require_approval: bool) -> DeploymentRecord {
        let request = DeploymentRequest {
            id: format!("req-{version}"),
            service: "api".to_string(),
            version: version.to_string(),
            registry_location: "registry.example.com/team/api".to_string(),
            task: TaskSpec {
                cpu: 256,
                memory_mib: 512,
                container_port: 8080,
            },
            source: RequestSource::Operator,
            published_at: None,
            submitted_at: 0,
        };
        DeploymentRecord {
            id: format!("dep-{version}"),
            service: "api".to_string(),
            request_seq: 1,
            request,
            descriptor: DeploymentDescriptor {
                service: "api".to_string(),
                version: version.to_string(),
                task: TaskDefinition {
                    image: format!("registry.example.com/team/api:{version}"),
                    version: version.to_string(),
                    cpu: 256,
                    memory_mib: 512,
                    container_port: 8080,
                    manifest: serde_json::json!({}),
                },
                desired_count: 2,
                policy: TrafficShiftPolicy {
                    shift: ShiftPolicy::AllAtOnce,
                    bake_ms: 10,
                    rollback_on_alarm: true,
                },
                timings: ValidationTimings {
                    provision_timeout_ms: 1000,
                    health_interval_ms: 5,
                    health_timeout_ms: 1000,
                    healthy_threshold: 2,
                    unhealthy_threshold: 3,
                    unknown_budget: 2,
                    traffic_window_ms: window_ms,
                    require_approval,
                    synthetic_checks: false,
                },
            },
            phase: DeploymentPhase::Pending,
            started_at_ms: 0,
            updated_at_ms: 0,
            history: Vec::new(),
            candidate_pool: None,
            prior_pool: None,
            approved_at_ms: None,
            failure: None,
            outcome: None,
        }
    }

    #[tokio::test]
    async fn first_deployment_completes_on_blue() {
        let store = StateStore::open_in_memory().unwrap();
        let done = DeploymentMachine::new(deps(&store), record("v1", 10, false))
            .run()
            .await
            .unwrap();

        assert_eq!(done.phase, DeploymentPhase::Completed);
        assert_eq!(done.candidate_pool, Some(PoolSlot::Blue));
        assert_eq!(done.prior_pool, None);
        let phases: Vec<_> = done.history.iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![
                DeploymentPhase::Provisioning,
                DeploymentPhase::ValidatingHealth,
                DeploymentPhase::ValidatingTraffic,
                DeploymentPhase::ShiftingProduction,
                DeploymentPhase::Baking,
                DeploymentPhase::Completed,
            ]
        );
        assert_eq!(store.get_deployment("dep-v1").unwrap(), Some(done));
    }

    #[tokio::test]
    async fn cancel_before_provisioning_rolls_back_cleanly() {
        let store = StateStore::open_in_memory().unwrap();
        store.push_signal("dep-v1", OperatorSignal::Cancel, 0).unwrap();

        let done = DeploymentMachine::new(deps(&store), record("v1", 10, false))
            .run()
            .await
            .unwrap();

        assert_eq!(done.phase, DeploymentPhase::RolledBack);
        let failure = done.failure.unwrap();
        assert_eq!(failure.phase, DeploymentPhase::Pending);
        assert!(failure.message.contains("cancelled"));
        assert!(store.list_instances("api-").unwrap().is_empty());
    }

    #[tokio::test]
    async fn required_approval_times_out_without_signal() {
        let store = StateStore::open_in_memory().unwrap();
        let done = DeploymentMachine::new(deps(&store), record("v1", 20, true))
            .run()
            .await
            .unwrap();

        assert_eq!(done.phase, DeploymentPhase::RolledBack);
        let failure = done.failure.unwrap();
        assert_eq!(failure.phase, DeploymentPhase::ValidatingTraffic);
        assert_eq!(failure.category, slipway_core::FailureCategory::Validation);
    }

    /// Poll the store until `id` reaches `phase`.
    async fn reach(store: &StateStore, id: &str, phase: DeploymentPhase) {
        loop {
            if store.get_deployment(id).unwrap().is_some_and(|r| r.phase == phase) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn approval_ends_window_early() {
        let store = StateStore::open_in_memory().unwrap();
        // A one-minute window that only the approval can end in time.
        let machine = DeploymentMachine::new(deps(&store), record("v1", 60_000, true));
        let run = tokio::spawn(machine.run());

        reach(&store, "dep-v1", DeploymentPhase::ValidatingTraffic).await;
        store.push_signal("dep-v1", OperatorSignal::Approve, 0).unwrap();

        let done = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.phase, DeploymentPhase::Completed);
        assert!(done.approved_at_ms.is_some());
    }

    #[tokio::test]
    async fn approval_before_test_window_is_ignored() {
        let store = StateStore::open_in_memory().unwrap();
        store.push_signal("dep-v1", OperatorSignal::Approve, 0).unwrap();

        let done = DeploymentMachine::new(deps(&store), record("v1", 30, true))
            .run()
            .await
            .unwrap();
        assert_eq!(done.phase, DeploymentPhase::RolledBack);
        assert_eq!(done.approved_at_ms, None);
        assert_eq!(done.failure.unwrap().phase, DeploymentPhase::ValidatingTraffic);
    }

    #[tokio::test]
    async fn rejection_before_test_window_is_ignored() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .push_signal(
                "dep-v1",
                OperatorSignal::Reject {
                    reason: "too early".to_string(),
                },
                0,
            )
            .unwrap();

        let done = DeploymentMachine::new(deps(&store), record("v1", 10, false))
            .run()
            .await
            .unwrap();
        assert_eq!(done.phase, DeploymentPhase::Completed);
    }

    #[tokio::test]
    async fn rejection_rolls_back() {
        let store = StateStore::open_in_memory().unwrap();
        let machine = DeploymentMachine::new(deps(&store), record("v1", 60_000, false));
        let run = tokio::spawn(machine.run());

        reach(&store, "dep-v1", DeploymentPhase::ValidatingTraffic).await;
        store
            .push_signal(
                "dep-v1",
                OperatorSignal::Reject {
                    reason: "error rate".to_string(),
                },
                0,
            )
            .unwrap();

        let done = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.phase, DeploymentPhase::RolledBack);
        assert!(done.failure.unwrap().message.contains("rejected: error rate"));
    }

    #[tokio::test]
    async fn recorded_approval_survives_resume() {
        let store = StateStore::open_in_memory().unwrap();
        let deps = deps(&store);

        // A previous process stored the approval, then stopped before shifting.
        let mut rec = record("v1", 60_000, true);
        rec.candidate_pool = Some(PoolSlot::Blue);
        rec.phase = DeploymentPhase::ValidatingTraffic;
        rec.approved_at_ms = Some(5);
        deps.traffic
            .provision_candidate(PoolSlot::Blue, &rec.id, &rec.descriptor)
            .await
            .unwrap();
        store.put_deployment(&rec).unwrap();

        let resumed = store.get_deployment("dep-v1").unwrap().unwrap();
        assert_eq!(resumed.approved_at_ms, Some(5));
        let done = tokio::time::timeout(Duration::from_secs(10), DeploymentMachine::new(deps, resumed).run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.phase, DeploymentPhase::Completed);
        assert_eq!(done.history[0].from, DeploymentPhase::ValidatingTraffic);
    }

    #[tokio::test]
    async fn resumes_from_recorded_phase() {
        let store = StateStore::open_in_memory().unwrap();
        let deps = deps(&store);

        // A previous process provisioned blue and recorded ValidatingHealth.
        let mut rec = record("v1", 10, false);
        rec.candidate_pool = Some(PoolSlot::Blue);
        rec.phase = DeploymentPhase::ValidatingHealth;
        deps.traffic
            .provision_candidate(PoolSlot::Blue, &rec.id, &rec.descriptor)
            .await
            .unwrap();
        store.put_deployment(&rec).unwrap();

        let done = DeploymentMachine::new(deps, rec).run().await.unwrap();
        assert_eq!(done.phase, DeploymentPhase::Completed);
        assert_eq!(done.history[0].from, DeploymentPhase::ValidatingHealth);
        // Provisioning was not repeated: still generation 1 with two instances.
        assert_eq!(store.list_instances("api-blue-g1-").unwrap().len(), 2);
    }
}
