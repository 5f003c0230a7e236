//! slipway-state — embedded state store for Slipway.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for deployment records, pools, listener targets, the request queue,
//! operator signals and utilization samples.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{service}/{slot}`, `{service}:{seq}`) enable prefix
//! scans for related records; sequence numbers are zero-padded so that key
//! order is submission order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Every deployment transition is
//! written here before the next state's side effects begin, which is what
//! makes a crashed deployment resumable.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
