//! redb table definitions for the Slipway state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{service}/{name}` or `{parent}:{seq}`.

use redb::TableDefinition;

/// Deployment records keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Pool records keyed by `{service}/{slot}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Local-scheduler instances keyed by instance handle.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Local load-balancer listener targets keyed by listener id.
pub const LISTENERS: TableDefinition<&str, &[u8]> = TableDefinition::new("listeners");

/// Traffic split keyed by `{service}`.
pub const TRAFFIC: TableDefinition<&str, &[u8]> = TableDefinition::new("traffic");

/// Deployment requests keyed by `{service}:{seq:020}`.
pub const QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("queue");

/// Operator signals keyed by `{deployment_id}:{seq:020}`.
pub const SIGNALS: TableDefinition<&str, &[u8]> = TableDefinition::new("signals");

/// Utilization samples keyed by `{service}/{slot}:{epoch:020}`.
pub const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");

/// Monotonic counters keyed by name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
