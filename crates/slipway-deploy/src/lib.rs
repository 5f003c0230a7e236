//! slipway-deploy — the blue-green deployment state machine.
//!
//! # Lifecycle
//!
//! ```text
//! Pending → Provisioning → ValidatingHealth → ValidatingTraffic
//!         → ShiftingProduction → Baking → Completed
//!
//! any non-terminal state → RollingBack → RolledBack
//!                                      ↘ Failed (rollback could not finish)
//! ```
//!
//! # Components
//!
//! - **`machine`** — drives one deployment; persists every transition
//! - **`coordinator`** — admits queued requests one at a time, resumes
//!   interrupted deployments, skips versions already in production
//! - **`operator`** — cancel / rollback / approve / reject / alarm

pub mod coordinator;
pub mod error;
pub mod machine;
pub mod operator;

pub use coordinator::Coordinator;
pub use error::{DeployError, DeployResult};
pub use machine::{DeploymentMachine, MachineDeps, MachineSettings};
pub use operator::{Operator, RollbackAction};
