//! Utilization sources for the autoscaler.

use std::time::Duration;

use async_trait::async_trait;
use slipway_core::epoch_secs;
use slipway_state::{PoolSlot, StateStore};

/// Average CPU utilization (percent) of a pool over a trailing window.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// `Ok(None)` when the window holds no samples.
    async fn get_utilization(&self, pool: PoolSlot, window: Duration) -> anyhow::Result<Option<f64>>;
}

/// Averages the utilization samples pushed into the state store.
pub struct StoreMetrics {
    store: StateStore,
    service: String,
}

impl StoreMetrics {
    pub fn new(store: StateStore, service: &str) -> Self {
        Self {
            store,
            service: service.to_string(),
        }
    }
}

#[async_trait]
impl MetricsSource for StoreMetrics {
    async fn get_utilization(&self, pool: PoolSlot, window: Duration) -> anyhow::Result<Option<f64>> {
        let since = epoch_secs().saturating_sub(window.as_secs());
        let samples = self.store.list_samples(&self.service, pool, since)?;
        if samples.is_empty() {
            return Ok(None);
        }
        let total: f64 = samples.iter().map(|s| s.utilization).sum();
        Ok(Some(total / samples.len() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_state::UtilizationSample;

    #[tokio::test]
    async fn averages_samples_inside_window() {
        let store = StateStore::open_in_memory().unwrap();
        let now = epoch_secs();
        for (age, utilization) in [(3600u64, 99.0), (20, 40.0), (10, 80.0)] {
            store
                .put_sample(&UtilizationSample {
                    service: "api".to_string(),
                    pool: PoolSlot::Blue,
                    epoch: now - age,
                    utilization,
                })
                .unwrap();
        }

        let metrics = StoreMetrics::new(store, "api");
        let avg = metrics
            .get_utilization(PoolSlot::Blue, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(avg, Some(60.0));
        assert_eq!(
            metrics.get_utilization(PoolSlot::Green, Duration::from_secs(60)).await.unwrap(),
            None
        );
    }
}
