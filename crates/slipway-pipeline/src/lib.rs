//! slipway-pipeline — from artifact publish event to a dispatched deployment.
//!
//! # Architecture
//!
//! ```text
//! webhook / operator
//!   │
//!   ▼
//! ArtifactEventListener ── validate tag, repository, registry lookup
//!   │
//!   ▼ (durable queue, coordinator woken)
//! Pipeline
//!   ├── Source     re-read and validate the queued request
//!   ├── Configure  task definition, shift policy, rendered manifest
//!   └── Dispatch   upsert a Pending deployment record
//! ```
//!
//! The listener only enqueues; the pipeline is driven by the admission
//! coordinator in `slipway-deploy`.

pub mod listener;
pub mod pipeline;
pub mod registry;
pub mod render;

pub use listener::{ArtifactEvent, ArtifactEventListener};
pub use pipeline::{Pipeline, Stage, deployment_id};
pub use registry::{ArtifactRegistry, HttpRegistry, RegistryError, TrustingRegistry};
pub use render::{DEFAULT_TEMPLATE, RenderError, render_manifest};
