//! slipway-health — the health oracle.
//!
//! Answers one question per instance: `Healthy`, `Unhealthy` or `Unknown`.
//! The deployment state machine folds those answers into a debounced
//! verdict for a whole pool.
//!
//! # Architecture
//!
//! ```text
//! PoolValidation
//!   ├── HealthTracker per instance (consecutive successes/failures/unknowns)
//!   └── HealthProbe
//!       ├── SchedulerProbe  (describe_instance → status)
//!       └── HttpProbe       (GET {address}{path} → 2xx / non-2xx / unreachable)
//! ```
//!
//! # Debouncing
//!
//! A single failed probe never fails a pool. An instance fails once it
//! reaches `unhealthy_threshold` consecutive failures; `Unknown` results
//! only start counting as failures after `unknown_budget` of them in a row.

pub mod checker;
pub mod oracle;
pub mod probe;

pub use checker::{HealthTracker, Thresholds};
pub use oracle::{PoolValidation, Round, Verdict};
pub use probe::{HealthProbe, HttpProbe, SchedulerProbe, http_check, probe_from_config};
