//! Per-instance health debouncing.
//!
//! A single flaky probe never decides anything: an instance becomes
//! `Healthy` after `healthy_threshold` consecutive healthy probes and
//! `Unhealthy` after `unhealthy_threshold` consecutive failures. `Unknown`
//! results are tolerated up to `unknown_budget` in a row; beyond that each
//! further unknown counts as a failure.

use slipway_state::{HealthStatus, ValidationTimings};
use tracing::{debug, warn};

/// Debounce thresholds shared by every tracker of one validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub healthy: u32,
    pub unhealthy: u32,
    pub unknown_budget: u32,
}

impl Thresholds {
    pub fn from_timings(timings: &ValidationTimings) -> Self {
        Self {
            healthy: timings.healthy_threshold.max(1),
            unhealthy: timings.unhealthy_threshold.max(1),
            unknown_budget: timings.unknown_budget,
        }
    }
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    consecutive_unknowns: u32,
    thresholds: Thresholds,
}

impl HealthTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            consecutive_unknowns: 0,
            thresholds,
        }
    }

    /// Record a probe result and return the debounced status.
    pub fn record(&mut self, observed: HealthStatus) -> HealthStatus {
        match observed {
            HealthStatus::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_unknowns = 0;
                self.consecutive_successes += 1;
            }
            HealthStatus::Unhealthy => self.record_failure(),
            HealthStatus::Unknown => {
                self.consecutive_successes = 0;
                self.consecutive_unknowns += 1;
                if self.consecutive_unknowns > self.thresholds.unknown_budget {
                    self.consecutive_failures += 1;
                }
                // A tolerated unknown neither counts as nor resets a failure.
            }
        }

        let next = if self.consecutive_failures >= self.thresholds.unhealthy {
            HealthStatus::Unhealthy
        } else if self.consecutive_successes >= self.thresholds.healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };

        if next != self.status {
            match next {
                HealthStatus::Unhealthy => warn!(
                    failures = self.consecutive_failures,
                    threshold = self.thresholds.unhealthy,
                    "instance marked unhealthy"
                ),
                _ => debug!(from = ?self.status, to = ?next, "instance health changed"),
            }
        }
        self.status = next;
        self.status
    }

    fn record_failure(&mut self) {
        self.consecutive_successes = 0;
        self.consecutive_unknowns = 0;
        self.consecutive_failures += 1;
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Failed past the unhealthy threshold.
    pub fn has_failed(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}
