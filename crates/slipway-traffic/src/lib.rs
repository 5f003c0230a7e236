//! slipway-traffic — the traffic controller and its infrastructure seams.
//!
//! The [`TrafficController`] is the only component that creates or
//! destroys instances and the only writer of listener targets. It talks to
//! infrastructure through two traits:
//!
//! - [`SchedulerApi`] creates, destroys and describes instances
//! - [`LoadBalancerApi`] reads and swaps listener targets
//!
//! # Architecture
//!
//! ```text
//! TrafficController
//!   ├── SchedulerApi     (LocalScheduler, or a real scheduler client)
//!   ├── LoadBalancerApi  (LocalLoadBalancer, or a real LB client)
//!   ├── StateStore       (PoolRecord + TrafficSplit after every mutation)
//!   └── Per-pool mutex   (shared with the autoscaler)
//! ```
//!
//! The production listener always routes 100% of its traffic to one pool.
//! `shift_production` swaps it in a single call and reads it back.

pub mod backend;
pub mod controller;
pub mod error;
pub mod local;

pub use backend::{
    BackendError, BackendResult, InstanceDescription, LoadBalancerApi, PoolSpec, SchedulerApi,
};
pub use controller::{ControllerSettings, Listeners, TrafficController};
pub use error::{TrafficError, TrafficResult};
pub use local::{LocalLoadBalancer, LocalScheduler};
