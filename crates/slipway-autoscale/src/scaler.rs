//! Autoscaler — utilization-driven scaling of the production pool.
//!
//! Reads the average utilization of whichever pool the production listener
//! targets, compares it against the target, and resizes that pool through
//! the traffic controller. Pools under validation are never touched.

use std::sync::Arc;
use std::time::Duration;

use slipway_core::SlipwayConfig;
use slipway_core::epoch_secs;
use slipway_traffic::TrafficController;
use tracing::{debug, info, warn};

use crate::metrics::MetricsSource;

/// A scaling decision for the production pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified instance count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub min: u32,
    pub max: u32,
    /// Target utilization percentage.
    pub target: f64,
    /// Dead band, in percent of `target`.
    pub tolerance: f64,
    pub max_step: u32,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
}

impl ScalingPolicy {
    pub fn from_config(config: &SlipwayConfig) -> Self {
        Self {
            min: config.pools.min,
            max: config.pools.max,
            target: config.autoscale.target_utilization,
            tolerance: config.autoscale.tolerance,
            max_step: config.autoscale.max_step.max(1),
            scale_up_cooldown: config.autoscale.scale_up_cooldown(),
            scale_down_cooldown: config.autoscale.scale_down_cooldown(),
        }
    }
}

pub struct Autoscaler {
    controller: Arc<TrafficController>,
    metrics: Arc<dyn MetricsSource>,
    policy: ScalingPolicy,
    /// Averaging window for the utilization metric.
    window: Duration,
    /// Last time we scaled up (unix seconds).
    last_scale_up: Option<u64>,
    /// Last time we scaled down (unix seconds).
    last_scale_down: Option<u64>,
}

impl Autoscaler {
    pub fn new(
        controller: Arc<TrafficController>,
        metrics: Arc<dyn MetricsSource>,
        policy: ScalingPolicy,
        window: Duration,
    ) -> Self {
        Self {
            controller,
            metrics,
            policy,
            window,
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    /// Decide the next instance count from the current count and the
    /// observed utilization.
    pub fn evaluate(&mut self, current: u32, utilization: f64, now: u64) -> ScaleDecision {
        let policy = &self.policy;
        if current == 0 || policy.target <= 0.0 {
            return ScaleDecision::NoChange;
        }

        let band = policy.target * policy.tolerance / 100.0;
        if (utilization - policy.target).abs() <= band {
            return ScaleDecision::NoChange;
        }

        let proportional = ((current as f64) * utilization / policy.target).ceil() as u32;
        let stepped = if proportional > current {
            proportional.min(current + policy.max_step)
        } else {
            proportional.max(current.saturating_sub(policy.max_step))
        };
        let desired = stepped.clamp(policy.min, policy.max);

        if desired > current {
            if !cooled_down(self.last_scale_up, policy.scale_up_cooldown, now) {
                debug!(current, desired, "scale up suppressed by cooldown");
                return ScaleDecision::NoChange;
            }
            self.last_scale_up = Some(now);
            debug!(from = current, to = desired, utilization, target = policy.target, "scaling up");
            ScaleDecision::ScaleTo(desired)
        } else if desired < current {
            if !cooled_down(self.last_scale_down, policy.scale_down_cooldown, now) {
                debug!(current, desired, "scale down suppressed by cooldown");
                return ScaleDecision::NoChange;
            }
            self.last_scale_down = Some(now);
            debug!(from = current, to = desired, utilization, target = policy.target, "scaling down");
            ScaleDecision::ScaleTo(desired)
        } else {
            ScaleDecision::NoChange
        }
    }

    /// One evaluation of the production pool. Returns the decision, or
    /// `None` if there was nothing to evaluate.
    pub async fn evaluate_once(&mut self) -> anyhow::Result<Option<ScaleDecision>> {
        let Some(slot) = self.controller.production_pool().await? else {
            return Ok(None);
        };
        let pool = self.controller.pool(slot)?;
        if pool.under_validation {
            debug!(pool = %slot, "production pool under validation, skipping");
            return Ok(None);
        }
        let Some(utilization) = self.metrics.get_utilization(slot, self.window).await? else {
            debug!(pool = %slot, "no utilization samples");
            return Ok(None);
        };

        let decision = self.evaluate(pool.current_count(), utilization, epoch_secs());
        if let ScaleDecision::ScaleTo(target) = decision {
            match self.controller.autoscale_pool(slot, target).await? {
                Some(count) => info!(pool = %slot, utilization, instances = count, "production pool scaled"),
                None => warn!(pool = %slot, "pool changed role before scaling"),
            }
        }
        Ok(Some(decision))
    }

    /// Run the autoscaler loop.
    pub async fn run(&mut self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_once().await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

fn cooled_down(last: Option<u64>, cooldown: Duration, now: u64) -> bool {
    last.is_none_or(|t| now.saturating_sub(t) >= cooldown.as_secs())
}
