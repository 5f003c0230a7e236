//! StateStore — redb-backed state persistence for Slipway.
//!
//! Provides typed CRUD operations over deployments, pools, instances,
//! listeners, the request queue, operator signals and utilization samples.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const QUEUE_SEQ: &str = "queue_seq";
const SIGNAL_SEQ: &str = "signal_seq";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [DEPLOYMENTS, POOLS, INSTANCES, LISTENERS, TRAFFIC, QUEUE, SIGNALS, METRICS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn list_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Increment a named counter inside an open write transaction.
    fn bump_counter(txn: &redb::WriteTransaction, name: &str) -> StateResult<u64> {
        let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        let next = counters
            .get(name)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0)
            + 1;
        counters.insert(name, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        self.put_json(DEPLOYMENTS, &record.id, record)?;
        debug!(deployment = %record.id, phase = %record.phase, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get_json(DEPLOYMENTS, id)
    }

    /// All deployments of a service, oldest first.
    pub fn list_deployments(&self, service: &str) -> StateResult<Vec<DeploymentRecord>> {
        let mut records: Vec<DeploymentRecord> = self
            .list_json::<DeploymentRecord>(DEPLOYMENTS, "")?
            .into_iter()
            .filter(|r| r.service == service)
            .collect();
        records.sort_by_key(|r| (r.started_at_ms, r.request_seq));
        Ok(records)
    }

    /// The non-terminal deployment of a service, if any.
    pub fn active_deployment(&self, service: &str) -> StateResult<Option<DeploymentRecord>> {
        Ok(self
            .list_deployments(service)?
            .into_iter()
            .find(|r| !r.is_terminal()))
    }

    /// The most recent deployment that reached `Completed`.
    pub fn last_completed(&self, service: &str) -> StateResult<Option<DeploymentRecord>> {
        Ok(self
            .list_deployments(service)?
            .into_iter()
            .rev()
            .find(|r| r.phase == DeploymentPhase::Completed))
    }

    // ── Pools ──────────────────────────────────────────────────────

    pub fn put_pool(&self, pool: &PoolRecord) -> StateResult<()> {
        self.put_json(POOLS, &pool.table_key(), pool)
    }

    pub fn get_pool(&self, service: &str, id: PoolSlot) -> StateResult<Option<PoolRecord>> {
        self.get_json(POOLS, &pool_key(service, id))
    }

    pub fn list_pools(&self, service: &str) -> StateResult<Vec<PoolRecord>> {
        self.list_json(POOLS, &format!("{service}/"))
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, instance: &InstanceRecord) -> StateResult<()> {
        self.put_json(INSTANCES, &instance.handle, instance)
    }

    pub fn get_instance(&self, handle: &str) -> StateResult<Option<InstanceRecord>> {
        self.get_json(INSTANCES, handle)
    }

    /// Instances whose handle starts with `prefix`.
    pub fn list_instances(&self, prefix: &str) -> StateResult<Vec<InstanceRecord>> {
        self.list_json(INSTANCES, prefix)
    }

    /// Delete an instance by handle. Returns true if it existed.
    pub fn delete_instance(&self, handle: &str) -> StateResult<bool> {
        self.delete_key(INSTANCES, handle)
    }

    // ── Listeners and traffic ──────────────────────────────────────

    pub fn put_listener(&self, listener: &ListenerRecord) -> StateResult<()> {
        self.put_json(LISTENERS, &listener.listener, listener)
    }

    pub fn get_listener(&self, listener: &str) -> StateResult<Option<ListenerRecord>> {
        self.get_json(LISTENERS, listener)
    }

    pub fn put_traffic(&self, split: &TrafficSplit) -> StateResult<()> {
        self.put_json(TRAFFIC, &split.service, split)
    }

    pub fn get_traffic(&self, service: &str) -> StateResult<Option<TrafficSplit>> {
        self.get_json(TRAFFIC, service)
    }

    // ── Queue ──────────────────────────────────────────────────────

    /// Append a request to the service queue, assigning the next sequence
    /// number atomically.
    pub fn enqueue_request(&self, request: &DeploymentRequest) -> StateResult<QueueEntry> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let entry;
        {
            let seq = Self::bump_counter(&txn, QUEUE_SEQ)?;
            entry = QueueEntry {
                seq,
                request: request.clone(),
                status: QueueStatus::Queued,
                updated_at: request.submitted_at,
            };
            let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            let mut t = txn.open_table(QUEUE).map_err(map_err!(Table))?;
            t.insert(entry.table_key().as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq = entry.seq, version = %request.version, "request enqueued");
        Ok(entry)
    }

    pub fn put_queue_entry(&self, entry: &QueueEntry) -> StateResult<()> {
        self.put_json(QUEUE, &entry.table_key(), entry)
    }

    pub fn get_queue_entry(&self, service: &str, seq: u64) -> StateResult<Option<QueueEntry>> {
        self.get_json(QUEUE, &queue_key(service, seq))
    }

    /// All queue entries of a service in submission order.
    pub fn list_queue(&self, service: &str) -> StateResult<Vec<QueueEntry>> {
        self.list_json(QUEUE, &format!("{service}:"))
    }

    /// Entries still waiting for admission, in submission order.
    pub fn pending_requests(&self, service: &str) -> StateResult<Vec<QueueEntry>> {
        Ok(self
            .list_queue(service)?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Queued)
            .collect())
    }

    // ── Signals ────────────────────────────────────────────────────

    /// Deliver an operator signal to a deployment's mailbox.
    pub fn push_signal(&self, deployment_id: &str, signal: OperatorSignal, now: u64) -> StateResult<SignalEntry> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let entry;
        {
            let seq = Self::bump_counter(&txn, SIGNAL_SEQ)?;
            entry = SignalEntry {
                deployment_id: deployment_id.to_string(),
                seq,
                signal,
                received_at: now,
            };
            let key = format!("{deployment_id}:{seq:020}");
            let bytes = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            let mut t = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
            t.insert(key.as_str(), bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %deployment_id, signal = ?entry.signal, "signal stored");
        Ok(entry)
    }

    /// Drain a deployment's mailbox, oldest signal first.
    pub fn take_signals(&self, deployment_id: &str) -> StateResult<Vec<SignalEntry>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut drained = Vec::new();
        {
            let mut t = txn.open_table(SIGNALS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in t.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    let signal: SignalEntry =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    keys.push(key.value().to_string());
                    drained.push(signal);
                }
            }
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(drained)
    }

    // ── Metrics ────────────────────────────────────────────────────

    pub fn put_sample(&self, sample: &UtilizationSample) -> StateResult<()> {
        self.put_json(METRICS, &sample.table_key(), sample)
    }

    /// Samples for a pool with `epoch >= since`, oldest first.
    pub fn list_samples(&self, service: &str, pool: PoolSlot, since: u64) -> StateResult<Vec<UtilizationSample>> {
        let prefix = format!("{}:", metrics_prefix(service, pool));
        Ok(self
            .list_json::<UtilizationSample>(METRICS, &prefix)?
            .into_iter()
            .filter(|s| s.epoch >= since)
            .collect())
    }
}
