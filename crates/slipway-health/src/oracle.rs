//! Debounced health validation of a whole pool.
//!
//! A [`PoolValidation`] keeps one [`HealthTracker`] per instance. Each call
//! to [`PoolValidation::round`] probes every instance once. The pool
//! passes once every instance is debounced-healthy, which is the same as
//! "all instances healthy for `healthy` consecutive rounds", and fails as
//! soon as any instance crosses the unhealthy threshold. The caller owns
//! the pacing and the overall timeout.

use std::collections::BTreeMap;

use slipway_state::{HealthStatus, InstanceHandle};
use tracing::{debug, warn};

use crate::checker::{HealthTracker, Thresholds};
use crate::probe::HealthProbe;

/// Outcome of one probing round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every instance is debounced-healthy.
    Passed,
    /// `instance` failed past the unhealthy threshold.
    Failed { instance: InstanceHandle, failures: u32 },
    /// Not decided yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub verdict: Verdict,
    /// Raw probe result per instance for this round.
    pub observed: BTreeMap<InstanceHandle, HealthStatus>,
}

pub struct PoolValidation {
    trackers: BTreeMap<InstanceHandle, HealthTracker>,
    thresholds: Thresholds,
    rounds: u32,
}

impl PoolValidation {
    pub fn new(instances: &[InstanceHandle], thresholds: Thresholds) -> Self {
        Self {
            trackers: instances
                .iter()
                .map(|handle| (handle.clone(), HealthTracker::new(thresholds)))
                .collect(),
            thresholds,
            rounds: 0,
        }
    }

    /// Follow the pool's current membership: trackers of removed instances
    /// are dropped, new instances start with a fresh tracker.
    pub fn sync(&mut self, instances: &[InstanceHandle]) {
        self.trackers.retain(|handle, _| instances.contains(handle));
        for handle in instances {
            if !self.trackers.contains_key(handle) {
                debug!(instance = %handle, "instance joined pool validation");
                self.trackers
                    .insert(handle.clone(), HealthTracker::new(self.thresholds));
            }
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Probe every instance once and fold the results into the trackers.
    pub async fn round(&mut self, probe: &dyn HealthProbe) -> Round {
        self.rounds += 1;
        let mut observed = BTreeMap::new();
        for (handle, tracker) in self.trackers.iter_mut() {
            let status = probe.check(handle).await;
            tracker.record(status);
            observed.insert(handle.clone(), status);
        }

        let verdict = self.verdict();
        match &verdict {
            Verdict::Failed { instance, failures } => {
                warn!(%instance, failures, round = self.rounds, "pool health validation failed");
            }
            Verdict::Passed => debug!(round = self.rounds, "pool health validation passed"),
            Verdict::Pending => debug!(round = self.rounds, ?observed, "pool health pending"),
        }
        Round { verdict, observed }
    }

    fn verdict(&self) -> Verdict {
        if let Some((instance, tracker)) = self.trackers.iter().find(|(_, t)| t.has_failed()) {
            return Verdict::Failed {
                instance: instance.clone(),
                failures: tracker.consecutive_failures(),
            };
        }
        if !self.trackers.is_empty()
            && self
                .trackers
                .values()
                .all(|t| t.status() == HealthStatus::Healthy)
        {
            Verdict::Passed
        } else {
            Verdict::Pending
        }
    }
}
