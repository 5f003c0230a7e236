//! Traffic controller — the only writer of pool state and listener targets.
//!
//! Operations are idempotent by pool identity (slot + owning deployment +
//! generation) so an interrupted deployment can re-run them after a
//! restart. Every scheduler and load-balancer call goes through the
//! configured [`RetryPolicy`]. A per-pool mutex serializes mutations
//! between the deployment state machine and the autoscaler; it is released
//! before any capacity wait or drain period.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use slipway_core::error::ops;
use slipway_core::{RetryPolicy, SlipwayConfig, epoch_secs};
use slipway_state::{
    DeploymentDescriptor, HealthStatus, InstanceHandle, InstanceStatus, PoolRecord, PoolRole,
    PoolSlot, StateStore, TrafficSplit,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{LoadBalancerApi, PoolSpec, SchedulerApi};
use crate::error::{TrafficError, TrafficResult};

/// Listener ids on the load balancer.
#[derive(Debug, Clone)]
pub struct Listeners {
    pub production: String,
    pub test: String,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub listeners: Listeners,
    pub retry: RetryPolicy,
    /// Time in-flight requests get before a pool's instances are destroyed.
    pub drain_grace: Duration,
    /// Interval between `describe_instance` sweeps while waiting for capacity.
    pub poll_interval: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &SlipwayConfig) -> Self {
        Self {
            listeners: Listeners {
                production: config.listeners.production.clone(),
                test: config.listeners.test.clone(),
            },
            retry: config.traffic.retry_policy(),
            drain_grace: config.traffic.drain_grace(),
            poll_interval: config.health.interval().min(Duration::from_secs(2)),
        }
    }
}

struct PoolLocks {
    blue: Mutex<()>,
    green: Mutex<()>,
}

impl PoolLocks {
    fn get(&self, slot: PoolSlot) -> &Mutex<()> {
        match slot {
            PoolSlot::Blue => &self.blue,
            PoolSlot::Green => &self.green,
        }
    }
}

pub struct TrafficController {
    service: String,
    store: StateStore,
    scheduler: Arc<dyn SchedulerApi>,
    balancer: Arc<dyn LoadBalancerApi>,
    settings: ControllerSettings,
    locks: PoolLocks,
}

impl TrafficController {
    pub fn new(
        service: &str,
        store: StateStore,
        scheduler: Arc<dyn SchedulerApi>,
        balancer: Arc<dyn LoadBalancerApi>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            service: service.to_string(),
            store,
            scheduler,
            balancer,
            settings,
            locks: PoolLocks {
                blue: Mutex::new(()),
                green: Mutex::new(()),
            },
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn scheduler(&self) -> Arc<dyn SchedulerApi> {
        self.scheduler.clone()
    }

    pub fn listeners(&self) -> &Listeners {
        &self.settings.listeners
    }

    /// Current record for a slot; an empty idle pool if none was stored yet.
    pub fn pool(&self, slot: PoolSlot) -> TrafficResult<PoolRecord> {
        Ok(self
            .store
            .get_pool(&self.service, slot)?
            .unwrap_or_else(|| PoolRecord::empty(&self.service, slot)))
    }

    fn save(&self, pool: &mut PoolRecord) -> TrafficResult<()> {
        pool.updated_at = epoch_secs();
        self.store.put_pool(pool)?;
        Ok(())
    }

    // ── Listener reads ─────────────────────────────────────────────

    async fn read_target(&self, listener: &str) -> TrafficResult<Option<PoolSlot>> {
        let target = self
            .settings
            .retry
            .run("get_listener_target", |_| self.balancer.get_listener_target(listener))
            .await?;
        Ok(target)
    }

    /// Pool the production listener routes to.
    pub async fn production_pool(&self) -> TrafficResult<Option<PoolSlot>> {
        self.read_target(&self.settings.listeners.production).await
    }

    /// Pool the test listener routes to.
    pub async fn test_pool(&self) -> TrafficResult<Option<PoolSlot>> {
        self.read_target(&self.settings.listeners.test).await
    }

    fn record_split(&self, production: Option<PoolSlot>, test: Option<PoolSlot>) -> TrafficResult<()> {
        let existing = self.store.get_traffic(&self.service)?;
        let production = production.or(existing.as_ref().map(|s| s.production));
        let test = test.or(existing.and_then(|s| s.test));
        if let Some(production) = production {
            self.store.put_traffic(&TrafficSplit {
                service: self.service.clone(),
                production,
                test,
                updated_at: epoch_secs(),
            })?;
        }
        Ok(())
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Create (or top up) the candidate pool in `slot` for a deployment.
    ///
    /// A slot already owned by `deployment_id` at its desired count is left
    /// untouched. Instances left behind by another deployment are destroyed
    /// and a new generation is started.
    pub async fn provision_candidate(
        &self,
        slot: PoolSlot,
        deployment_id: &str,
        descriptor: &DeploymentDescriptor,
    ) -> TrafficResult<PoolRecord> {
        if self.production_pool().await? == Some(slot) {
            return Err(TrafficError::CandidateIsProduction(slot));
        }

        let _guard = self.locks.get(slot).lock().await;
        let mut pool = self.pool(slot)?;

        if pool.deployment_id.as_deref() != Some(deployment_id) {
            if !pool.instances.is_empty() {
                warn!(
                    pool = %slot,
                    stale = pool.instances.len(),
                    owner = ?pool.deployment_id,
                    "destroying leftover instances before provisioning"
                );
                let stale = pool.instances.clone();
                self.settings
                    .retry
                    .run(ops::PROVISION_CANDIDATE, |_| self.scheduler.destroy_instances(&stale))
                    .await?;
            }
            pool = PoolRecord {
                role: PoolRole::Candidate,
                version: Some(descriptor.version.clone()),
                task: Some(descriptor.task.clone()),
                deployment_id: Some(deployment_id.to_string()),
                generation: pool.generation + 1,
                desired_count: descriptor.desired_count,
                under_validation: true,
                ..PoolRecord::empty(&self.service, slot)
            };
            self.save(&mut pool)?;
        }

        let missing = pool.desired_count.saturating_sub(pool.current_count());
        if missing == 0 {
            debug!(pool = %slot, %deployment_id, "candidate already provisioned");
            return Ok(pool);
        }

        let spec = PoolSpec {
            service: self.service.clone(),
            pool: slot,
            generation: pool.generation,
            task: descriptor.task.clone(),
            count: missing,
        };
        let handles = self
            .settings
            .retry
            .run(ops::PROVISION_CANDIDATE, |_| self.scheduler.create_instances(&spec))
            .await?;
        pool.instances.extend(handles);
        self.save(&mut pool)?;

        info!(
            pool = %slot,
            %deployment_id,
            generation = pool.generation,
            instances = pool.current_count(),
            "candidate pool provisioned"
        );
        Ok(pool)
    }

    /// Poll the scheduler until every instance of `slot` is running and the
    /// pool holds its desired count.
    pub async fn wait_for_capacity(&self, slot: PoolSlot, timeout: Duration) -> TrafficResult<PoolRecord> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let pool = self.pool(slot)?;
            let mut running = 0u32;
            for handle in &pool.instances {
                let desc = self
                    .settings
                    .retry
                    .run(ops::WAIT_FOR_CAPACITY, |_| self.scheduler.describe_instance(handle))
                    .await?;
                match desc.status {
                    InstanceStatus::Running => running += 1,
                    InstanceStatus::Failed | InstanceStatus::Stopped => {
                        return Err(TrafficError::InstanceFailed(handle.clone()));
                    }
                    InstanceStatus::Pending | InstanceStatus::Stopping => {}
                }
            }

            if running >= pool.desired_count && running == pool.current_count() {
                debug!(pool = %slot, running, "pool at capacity");
                return Ok(pool);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TrafficError::CapacityTimeout {
                    pool: slot,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Point the test listener at `slot` exclusively.
    pub async fn route_test_traffic(&self, slot: PoolSlot) -> TrafficResult<()> {
        let listener = &self.settings.listeners.test;
        self.settings
            .retry
            .run(ops::ROUTE_TEST_TRAFFIC, |_| self.balancer.set_listener_target(listener, slot))
            .await?;
        self.record_split(None, Some(slot))?;
        info!(%listener, pool = %slot, "test traffic routed");
        Ok(())
    }

    /// Swap the production listener to `slot` and confirm by reading the
    /// target back. The previous production pool keeps its instances. A
    /// candidate stays under validation until its deployment releases it.
    pub async fn shift_production(&self, slot: PoolSlot) -> TrafficResult<()> {
        let listener = &self.settings.listeners.production;
        let previous = self.production_pool().await?;

        self.settings
            .retry
            .run(ops::SHIFT_PRODUCTION, |_| async move {
                self.balancer.set_listener_target(listener, slot).await?;
                let found = self.balancer.get_listener_target(listener).await?;
                if found == Some(slot) {
                    Ok(())
                } else {
                    Err(TrafficError::ShiftNotConfirmed {
                        listener: listener.clone(),
                        expected: slot,
                        found,
                    })
                }
            })
            .await?;

        {
            let _guard = self.locks.get(slot).lock().await;
            let mut pool = self.pool(slot)?;
            pool.role = PoolRole::Production;
            self.save(&mut pool)?;
        }
        if let Some(prev) = previous
            && prev != slot
        {
            let _guard = self.locks.get(prev).lock().await;
            let mut pool = self.pool(prev)?;
            pool.role = PoolRole::Idle;
            self.save(&mut pool)?;
        }
        self.record_split(Some(slot), None)?;

        info!(%listener, from = ?previous, to = %slot, "production traffic shifted");
        Ok(())
    }

    /// Drain and destroy every instance of a non-production pool.
    pub async fn retire_pool(&self, slot: PoolSlot) -> TrafficResult<()> {
        let production = self.production_pool().await?;
        if production == Some(slot) {
            return Err(TrafficError::RetireProduction(slot));
        }

        if let Some(prod) = production
            && self.test_pool().await? == Some(slot)
        {
            self.route_test_traffic(prod).await?;
        }

        if self.pool(slot)?.instances.is_empty() {
            let _guard = self.locks.get(slot).lock().await;
            let mut pool = self.pool(slot)?;
            pool.role = PoolRole::Idle;
            pool.under_validation = false;
            self.save(&mut pool)?;
            debug!(pool = %slot, "pool already empty");
            return Ok(());
        }

        if !self.settings.drain_grace.is_zero() {
            info!(pool = %slot, grace = ?self.settings.drain_grace, "draining pool");
            tokio::time::sleep(self.settings.drain_grace).await;
        }

        let _guard = self.locks.get(slot).lock().await;
        let pool = self.pool(slot)?;
        let handles = pool.instances.clone();
        self.settings
            .retry
            .run(ops::RETIRE_POOL, |_| self.scheduler.destroy_instances(&handles))
            .await?;

        let mut retired = PoolRecord {
            generation: pool.generation,
            ..PoolRecord::empty(&self.service, slot)
        };
        self.save(&mut retired)?;

        info!(pool = %slot, destroyed = handles.len(), version = ?pool.version, "pool retired");
        Ok(())
    }

    /// Create or destroy instances until `slot` holds `desired`. Returns the
    /// new instance count.
    pub async fn scale_pool(&self, slot: PoolSlot, desired: u32) -> TrafficResult<u32> {
        let _guard = self.locks.get(slot).lock().await;
        let mut pool = self.pool(slot)?;
        self.resize(&mut pool, desired).await
    }

    /// Resize on behalf of the autoscaler. Does nothing and returns `None`
    /// unless `slot` is the production pool and not under validation.
    pub async fn autoscale_pool(&self, slot: PoolSlot, desired: u32) -> TrafficResult<Option<u32>> {
        let _guard = self.locks.get(slot).lock().await;
        let mut pool = self.pool(slot)?;
        if pool.role != PoolRole::Production || pool.under_validation {
            debug!(pool = %slot, role = ?pool.role, under_validation = pool.under_validation, "autoscale skipped");
            return Ok(None);
        }
        self.resize(&mut pool, desired).await.map(Some)
    }

    /// Caller holds the pool lock.
    async fn resize(&self, pool: &mut PoolRecord, desired: u32) -> TrafficResult<u32> {
        let slot = pool.id;
        let current = pool.current_count();

        if desired > current {
            let task = pool.task.clone().ok_or(TrafficError::NoTaskDefinition(slot))?;
            let spec = PoolSpec {
                service: self.service.clone(),
                pool: slot,
                generation: pool.generation,
                task,
                count: desired - current,
            };
            let handles = self
                .settings
                .retry
                .run(ops::SCALE_POOL, |_| self.scheduler.create_instances(&spec))
                .await?;
            pool.instances.extend(handles);
        } else if desired < current {
            let surplus: Vec<InstanceHandle> = pool.instances[desired as usize..].to_vec();
            self.settings
                .retry
                .run(ops::SCALE_POOL, |_| self.scheduler.destroy_instances(&surplus))
                .await?;
            pool.instances.truncate(desired as usize);
            for handle in &surplus {
                pool.health.remove(handle);
            }
        }

        pool.desired_count = desired;
        self.save(pool)?;
        if desired != current {
            info!(pool = %slot, from = current, to = desired, "pool scaled");
        }
        Ok(pool.current_count())
    }

    /// Lock or unlock a pool against autoscaling.
    pub async fn set_under_validation(&self, slot: PoolSlot, under_validation: bool) -> TrafficResult<()> {
        let _guard = self.locks.get(slot).lock().await;
        let mut pool = self.pool(slot)?;
        if pool.under_validation != under_validation {
            pool.under_validation = under_validation;
            self.save(&mut pool)?;
        }
        Ok(())
    }

    /// Store the latest per-instance health of a pool.
    pub async fn record_health(
        &self,
        slot: PoolSlot,
        statuses: &BTreeMap<InstanceHandle, HealthStatus>,
    ) -> TrafficResult<()> {
        let _guard = self.locks.get(slot).lock().await;
        let mut pool = self.pool(slot)?;
        pool.health = statuses
            .iter()
            .filter(|(handle, _)| pool.instances.contains(handle))
            .map(|(handle, status)| (handle.clone(), *status))
            .collect();
        self.save(&mut pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult};
    use crate::local::{LocalLoadBalancer, LocalScheduler};
    use async_trait::async_trait;
    use slipway_state::{
        ShiftPolicy, TaskDefinition, TrafficShiftPolicy, ValidationTimings,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    fn descriptor(version: &str, desired_count: u32) -> DeploymentDescriptor {
        DeploymentDescriptor {
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
            desired_count,
            policy: TrafficShiftPolicy {
                shift: ShiftPolicy::AllAtOnce,
                bake_ms: 0,
                rollback_on_alarm: true,
            },
            timings: ValidationTimings {
                provision_timeout_ms: 1000,
                health_interval_ms: 10,
                health_timeout_ms: 1000,
                healthy_threshold: 1,
                unhealthy_threshold: 3,
                unknown_budget: 3,
                traffic_window_ms: 10,
                require_approval: false,
                synthetic_checks: false,
            },
        }
    }

    fn settings(max_attempts: u32) -> ControllerSettings {
        ControllerSettings {
            listeners: Listeners {
                production: "production".to_string(),
                test: "test".to_string(),
            },
            retry: RetryPolicy::immediate(max_attempts),
            drain_grace: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
        }
    }

    fn controller_with(store: &StateStore, balancer: Arc<dyn LoadBalancerApi>, startup: Duration) -> TrafficController {
        let scheduler = Arc::new(LocalScheduler::new(store.clone(), startup, 9000));
        TrafficController::new("api", store.clone(), scheduler, balancer, settings(3))
    }

    fn controller(store: &StateStore) -> TrafficController {
        let balancer = Arc::new(LocalLoadBalancer::new(store.clone()));
        controller_with(store, balancer, Duration::ZERO)
    }

    /// Fails the first `failures` listener writes.
    struct FlakyBalancer {
        inner: LocalLoadBalancer,
        failures: AtomicU32,
    }

    #[async_trait]
    impl LoadBalancerApi for FlakyBalancer {
        async fn set_listener_target(&self, listener: &str, pool: PoolSlot) -> BackendResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(BackendError::Unavailable("listener update timed out".into()));
            }
            self.inner.set_listener_target(listener, pool).await
        }

        async fn get_listener_target(&self, listener: &str) -> BackendResult<Option<PoolSlot>> {
            self.inner.get_listener_target(listener).await
        }
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);
        let desc = descriptor("v2", 2);

        let first = ctl.provision_candidate(PoolSlot::Green, "dep-1", &desc).await.unwrap();
        let second = ctl.provision_candidate(PoolSlot::Green, "dep-1", &desc).await.unwrap();

        assert_eq!(first.instances, second.instances);
        assert_eq!(second.generation, 1);
        assert!(second.under_validation);
        assert_eq!(second.role, PoolRole::Candidate);
        assert_eq!(store.list_instances("api-green-").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn partial_pool_is_topped_up() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);
        let desc = descriptor("v2", 3);

        let mut pool = ctl.provision_candidate(PoolSlot::Green, "dep-1", &desc).await.unwrap();
        // Simulate a crash after only one instance was recorded.
        pool.instances.truncate(1);
        store.put_pool(&pool).unwrap();

        let pool = ctl.provision_candidate(PoolSlot::Green, "dep-1", &desc).await.unwrap();
        assert_eq!(pool.current_count(), 3);
        assert_eq!(pool.generation, 1);
    }

    #[tokio::test]
    async fn new_deployment_starts_new_generation() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);

        let old = ctl.provision_candidate(PoolSlot::Green, "dep-1", &descriptor("v2", 1)).await.unwrap();
        let new = ctl.provision_candidate(PoolSlot::Green, "dep-2", &descriptor("v3", 1)).await.unwrap();

        assert_eq!(new.generation, 2);
        assert_eq!(new.version.as_deref(), Some("v3"));
        assert!(store.get_instance(&old.instances[0]).unwrap().is_none());
    }

    #[tokio::test]
    async fn candidate_cannot_be_production() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);
        ctl.provision_candidate(PoolSlot::Blue, "dep-1", &descriptor("v1", 1)).await.unwrap();
        ctl.shift_production(PoolSlot::Blue).await.unwrap();

        let err = ctl
            .provision_candidate(PoolSlot::Blue, "dep-2", &descriptor("v2", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TrafficError::CandidateIsProduction(PoolSlot::Blue)));
    }

    #[tokio::test]
    async fn shift_swaps_roles_and_keeps_validation_lock() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);

        ctl.provision_candidate(PoolSlot::Blue, "dep-1", &descriptor("v1", 1)).await.unwrap();
        ctl.shift_production(PoolSlot::Blue).await.unwrap();
        ctl.provision_candidate(PoolSlot::Green, "dep-2", &descriptor("v2", 1)).await.unwrap();
        ctl.shift_production(PoolSlot::Green).await.unwrap();

        assert_eq!(ctl.production_pool().await.unwrap(), Some(PoolSlot::Green));
        let green = ctl.pool(PoolSlot::Green).unwrap();
        assert_eq!(green.role, PoolRole::Production);
        assert!(green.under_validation);
        assert_eq!(ctl.pool(PoolSlot::Blue).unwrap().role, PoolRole::Idle);
        assert_eq!(store.get_traffic("api").unwrap().unwrap().production, PoolSlot::Green);
    }

    #[tokio::test]
    async fn shift_retries_transient_listener_failures() {
        let store = StateStore::open_in_memory().unwrap();
        let balancer = Arc::new(FlakyBalancer {
            inner: LocalLoadBalancer::new(store.clone()),
            failures: AtomicU32::new(2),
        });
        let ctl = controller_with(&store, balancer, Duration::ZERO);

        ctl.shift_production(PoolSlot::Blue).await.unwrap();
        assert_eq!(ctl.production_pool().await.unwrap(), Some(PoolSlot::Blue));
    }

    #[tokio::test]
    async fn shift_gives_up_after_max_attempts() {
        let store = StateStore::open_in_memory().unwrap();
        let balancer = Arc::new(FlakyBalancer {
            inner: LocalLoadBalancer::new(store.clone()),
            failures: AtomicU32::new(10),
        });
        let ctl = controller_with(&store, balancer, Duration::ZERO);

        let err = ctl.shift_production(PoolSlot::Blue).await.unwrap_err();
        assert!(matches!(err, TrafficError::Backend(BackendError::Unavailable(_))));
        assert_eq!(ctl.production_pool().await.unwrap(), None);
    }

    #[tokio::test]
    async fn retire_refuses_production_and_repoints_test_listener() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);

        ctl.provision_candidate(PoolSlot::Blue, "dep-1", &descriptor("v1", 1)).await.unwrap();
        ctl.shift_production(PoolSlot::Blue).await.unwrap();
        let green = ctl.provision_candidate(PoolSlot::Green, "dep-2", &descriptor("v2", 2)).await.unwrap();
        ctl.route_test_traffic(PoolSlot::Green).await.unwrap();

        assert!(matches!(
            ctl.retire_pool(PoolSlot::Blue).await,
            Err(TrafficError::RetireProduction(PoolSlot::Blue))
        ));

        ctl.retire_pool(PoolSlot::Green).await.unwrap();
        assert_eq!(ctl.test_pool().await.unwrap(), Some(PoolSlot::Blue));
        let retired = ctl.pool(PoolSlot::Green).unwrap();
        assert_eq!(retired.current_count(), 0);
        assert_eq!(retired.role, PoolRole::Idle);
        for handle in &green.instances {
            assert!(store.get_instance(handle).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn scale_up_and_down() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);
        ctl.provision_candidate(PoolSlot::Blue, "dep-1", &descriptor("v1", 2)).await.unwrap();

        assert_eq!(ctl.scale_pool(PoolSlot::Blue, 5).await.unwrap(), 5);
        assert_eq!(ctl.scale_pool(PoolSlot::Blue, 1).await.unwrap(), 1);
        assert_eq!(store.list_instances("api-blue-").unwrap().len(), 1);
        assert_eq!(ctl.pool(PoolSlot::Blue).unwrap().desired_count, 1);
    }

    #[tokio::test]
    async fn autoscale_only_touches_settled_production() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);
        ctl.provision_candidate(PoolSlot::Blue, "dep-1", &descriptor("v1", 2)).await.unwrap();

        // Still a candidate under validation.
        assert_eq!(ctl.autoscale_pool(PoolSlot::Blue, 4).await.unwrap(), None);

        // Serving production, but its deployment has not released it yet.
        ctl.shift_production(PoolSlot::Blue).await.unwrap();
        assert_eq!(ctl.autoscale_pool(PoolSlot::Blue, 4).await.unwrap(), None);

        ctl.set_under_validation(PoolSlot::Blue, false).await.unwrap();
        assert_eq!(ctl.autoscale_pool(PoolSlot::Blue, 4).await.unwrap(), Some(4));

        ctl.set_under_validation(PoolSlot::Blue, true).await.unwrap();
        assert_eq!(ctl.autoscale_pool(PoolSlot::Blue, 1).await.unwrap(), None);
        assert_eq!(ctl.pool(PoolSlot::Blue).unwrap().current_count(), 4);
    }

    #[tokio::test]
    async fn scaling_an_empty_pool_needs_a_task() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);
        assert!(matches!(
            ctl.scale_pool(PoolSlot::Blue, 2).await,
            Err(TrafficError::NoTaskDefinition(PoolSlot::Blue))
        ));
    }

    #[tokio::test]
    async fn capacity_wait_times_out() {
        let store = StateStore::open_in_memory().unwrap();
        let balancer = Arc::new(LocalLoadBalancer::new(store.clone()));
        let ctl = controller_with(&store, balancer, Duration::from_secs(3600));
        ctl.provision_candidate(PoolSlot::Green, "dep-1", &descriptor("v2", 1)).await.unwrap();

        let err = ctl
            .wait_for_capacity(PoolSlot::Green, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TrafficError::CapacityTimeout { pool: PoolSlot::Green, .. }));
    }

    #[tokio::test]
    async fn capacity_reached_when_all_running() {
        let store = StateStore::open_in_memory().unwrap();
        let ctl = controller(&store);
        ctl.provision_candidate(PoolSlot::Green, "dep-1", &descriptor("v2", 2)).await.unwrap();

        let pool = ctl.wait_for_capacity(PoolSlot::Green, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.current_count(), 2);
    }
}
