//! Local scheduler and load-balancer backends.
//!
//! Both keep their state in the [`StateStore`], so a daemon restart sees
//! the same instances and listener targets it left behind. Instances start
//! `Pending` and report `Running` once the configured startup delay has
//! passed.

use std::time::Duration;

use async_trait::async_trait;
use slipway_core::epoch_millis;
use slipway_state::{InstanceHandle, InstanceRecord, InstanceStatus, ListenerRecord, PoolSlot, StateError, StateStore};
use tracing::{debug, info};

use crate::backend::{
    BackendError, BackendResult, InstanceDescription, LoadBalancerApi, PoolSpec, SchedulerApi,
};

impl From<StateError> for BackendError {
    fn from(e: StateError) -> Self {
        BackendError::Unavailable(e.to_string())
    }
}

// ── Scheduler ──────────────────────────────────────────────────────

pub struct LocalScheduler {
    store: StateStore,
    startup_delay: Duration,
    base_port: u16,
}

impl LocalScheduler {
    pub fn new(store: StateStore, startup_delay: Duration, base_port: u16) -> Self {
        Self {
            store,
            startup_delay,
            base_port,
        }
    }

    /// Force an instance into a status (crash simulation, manual stop).
    pub fn set_status(&self, handle: &str, status: InstanceStatus) -> BackendResult<()> {
        let mut record = self
            .store
            .get_instance(handle)?
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;
        record.status = status;
        self.store.put_instance(&record)?;
        Ok(())
    }

    fn address_for(&self, pool: PoolSlot, index: u32) -> String {
        let offset = match pool {
            PoolSlot::Blue => 0,
            PoolSlot::Green => 1000,
        };
        let port = self.base_port as u32 + offset + index % 1000;
        format!("127.0.0.1:{port}")
    }
}

/// Handle prefix shared by every instance of one pool generation.
fn handle_prefix(spec: &PoolSpec) -> String {
    format!("{}-{}-g{}-", spec.service, spec.pool, spec.generation)
}

#[async_trait]
impl SchedulerApi for LocalScheduler {
    async fn create_instances(&self, spec: &PoolSpec) -> BackendResult<Vec<InstanceHandle>> {
        let prefix = handle_prefix(spec);
        let next_index = self
            .store
            .list_instances(&prefix)?
            .iter()
            .filter_map(|r| r.handle.strip_prefix(&prefix)?.parse::<u32>().ok())
            .max()
            .map_or(0, |max| max + 1);

        let now = epoch_millis();
        let mut handles = Vec::with_capacity(spec.count as usize);
        for index in next_index..next_index + spec.count {
            let handle = format!("{prefix}{index:03}");
            let record = InstanceRecord {
                handle: handle.clone(),
                pool: spec.pool,
                image: spec.task.image.clone(),
                address: self.address_for(spec.pool, index),
                status: InstanceStatus::Pending,
                created_at_ms: now,
                ready_at_ms: now + self.startup_delay.as_millis() as u64,
            };
            self.store.put_instance(&record)?;
            handles.push(handle);
        }

        info!(
            service = %spec.service,
            pool = %spec.pool,
            generation = spec.generation,
            count = spec.count,
            "instances created"
        );
        Ok(handles)
    }

    async fn destroy_instances(&self, handles: &[InstanceHandle]) -> BackendResult<()> {
        for handle in handles {
            if self.store.delete_instance(handle)? {
                debug!(%handle, "instance destroyed");
            }
        }
        Ok(())
    }

    async fn describe_instance(&self, handle: &str) -> BackendResult<InstanceDescription> {
        let mut record = self
            .store
            .get_instance(handle)?
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        if record.status == InstanceStatus::Pending && epoch_millis() >= record.ready_at_ms {
            record.status = InstanceStatus::Running;
            self.store.put_instance(&record)?;
        }

        Ok(InstanceDescription {
            status: record.status,
            address: Some(record.address),
        })
    }
}

// ── Load balancer ──────────────────────────────────────────────────

pub struct LocalLoadBalancer {
    store: StateStore,
}

impl LocalLoadBalancer {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LoadBalancerApi for LocalLoadBalancer {
    async fn set_listener_target(&self, listener: &str, pool: PoolSlot) -> BackendResult<()> {
        self.store.put_listener(&ListenerRecord {
            listener: listener.to_string(),
            target: Some(pool),
            updated_at: slipway_core::epoch_secs(),
        })?;
        info!(%listener, %pool, "listener target set");
        Ok(())
    }

    async fn get_listener_target(&self, listener: &str) -> BackendResult<Option<PoolSlot>> {
        Ok(self.store.get_listener(listener)?.and_then(|l| l.target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_state::TaskDefinition;

    fn spec(pool: PoolSlot, generation: u64, count: u32) -> PoolSpec {
        PoolSpec {
            service: "api".to_string(),
            pool,
            generation,
            task: TaskDefinition {
                image: "registry.example.com/team/api:v2".to_string(),
                version: "v2".to_string(),
                cpu: 256,
                memory_mib: 512,
                container_port: 8080,
                manifest: serde_json::json!({}),
            },
            count,
        }
    }

    #[tokio::test]
    async fn created_instances_become_running() {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = LocalScheduler::new(store, Duration::ZERO, 9000);

        let handles = scheduler.create_instances(&spec(PoolSlot::Green, 1, 2)).await.unwrap();
        assert_eq!(handles, vec!["api-green-g1-000", "api-green-g1-001"]);

        let desc = scheduler.describe_instance(&handles[0]).await.unwrap();
        assert_eq!(desc.status, InstanceStatus::Running);
        assert_eq!(desc.address.as_deref(), Some("127.0.0.1:10000"));
    }

    #[tokio::test]
    async fn startup_delay_keeps_instances_pending() {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = LocalScheduler::new(store, Duration::from_secs(3600), 9000);

        let handles = scheduler.create_instances(&spec(PoolSlot::Blue, 1, 1)).await.unwrap();
        let desc = scheduler.describe_instance(&handles[0]).await.unwrap();
        assert_eq!(desc.status, InstanceStatus::Pending);
    }

    #[tokio::test]
    async fn topping_up_continues_numbering() {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = LocalScheduler::new(store, Duration::ZERO, 9000);

        scheduler.create_instances(&spec(PoolSlot::Blue, 3, 2)).await.unwrap();
        let more = scheduler.create_instances(&spec(PoolSlot::Blue, 3, 1)).await.unwrap();
        assert_eq!(more, vec!["api-blue-g3-002"]);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = LocalScheduler::new(store, Duration::ZERO, 9000);

        let handles = scheduler.create_instances(&spec(PoolSlot::Blue, 1, 2)).await.unwrap();
        scheduler.destroy_instances(&handles).await.unwrap();
        scheduler.destroy_instances(&handles).await.unwrap();
        assert!(matches!(
            scheduler.describe_instance(&handles[0]).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listener_targets_persist() {
        let store = StateStore::open_in_memory().unwrap();
        let lb = LocalLoadBalancer::new(store.clone());

        assert_eq!(lb.get_listener_target("production").await.unwrap(), None);
        lb.set_listener_target("production", PoolSlot::Blue).await.unwrap();
        lb.set_listener_target("production", PoolSlot::Green).await.unwrap();

        let reopened = LocalLoadBalancer::new(store);
        assert_eq!(
            reopened.get_listener_target("production").await.unwrap(),
            Some(PoolSlot::Green)
        );
    }
}
