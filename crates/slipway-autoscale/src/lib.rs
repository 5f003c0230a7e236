//! slipway-autoscale — utilization-driven scaling of the production pool.
//!
//! Reads the average CPU utilization of the production pool from a
//! [`MetricsSource`], compares it against `target_utilization`, and resizes
//! the pool through the traffic controller.
//!
//! # Scaling Algorithm
//!
//! ```text
//! band    = target * tolerance / 100
//! if |utilization - target| <= band:
//!     NoChange
//!
//! desired = ceil(current * utilization / target)
//! desired = limit |desired - current| to max_step
//! desired = clamp(desired, pools.min, pools.max)
//! ```
//!
//! Cooldown windows (`scale_up_cooldown`, `scale_down_cooldown`) prevent
//! rapid oscillation. The autoscaler never touches a pool that is under
//! validation and never writes listener targets.

pub mod metrics;
pub mod scaler;

pub use metrics::{MetricsSource, StoreMetrics};
pub use scaler::{Autoscaler, ScaleDecision, ScalingPolicy};
