//! # Database Adapter
//!
//! The persistence contract every feature uses. Callers never talk to either
//! physical store directly.
//!
//! ## Store Selection (per call)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  forced mode set? ──yes──► forced store                                │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │  browser context? ──yes──► REMOTE  (no offline fallback, errors        │
//! │        │ no                          propagate to the caller)           │
//! │        ▼                                                                │
//! │  local host reachable? ──yes──► LOCAL  (regardless of connectivity)    │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │  REMOTE (fallback, logged)                                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Local Writes
//! ```text
//! insert / update / delete
//!     │
//!     ▼
//! ┌──────────────── one local batch ────────────────┐
//! │ 1. mutate the table                              │
//! │ 2. INSERT INTO sync_queue (operation, table, id, │
//! │    payload)                                      │
//! └──────────────────────────────────────────────────┘
//!     │
//!     ▼  later: drain() replays the queue, pull() copies remote rows back
//! ```

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use harbor_core::{
    now_timestamp, QueueStatus, Record, RuntimeContext, StoreMode, SyncOperation, SyncQueueEntry,
    SyncTable, TranslateMode,
};
use harbor_db::{CleanupReport, LocalStoreClient, Statement, SyncQueueRepository};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventHub, SyncActivity};
use crate::outbox::{DrainReport, DrainSkip, OutboxDrainer};
use crate::pull::{PullReport, Puller};
use crate::remote::{RemoteError, RemoteStore};

// =============================================================================
// Settings & Reports
// =============================================================================

/// Queue limits used by the reconciliation passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    pub batch_size: i64,
    pub max_attempts: i64,
    pub retention_days: i64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        AdapterSettings {
            batch_size: harbor_core::DEFAULT_BATCH_SIZE,
            max_attempts: harbor_core::MAX_SYNC_ATTEMPTS,
            retention_days: harbor_core::DEFAULT_RETENTION_DAYS,
        }
    }
}

impl From<&SyncConfig> for AdapterSettings {
    fn from(config: &SyncConfig) -> Self {
        AdapterSettings {
            batch_size: config.batch_size(),
            max_attempts: config.max_attempts(),
            retention_days: config.retention_days(),
        }
    }
}

/// Outcome of a bidirectional sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub drain: DrainReport,
    pub pull: PullReport,
}

// =============================================================================
// Adapter
// =============================================================================

/// Routes persistence calls to the local or remote store and reconciles the
/// two.
pub struct DatabaseAdapter {
    context: RuntimeContext,
    local: LocalStoreClient,
    queue: SyncQueueRepository,
    remote: Arc<dyn RemoteStore>,
    monitor: ConnectivityMonitor,
    events: EventHub,
    settings: AdapterSettings,
    forced: RwLock<Option<StoreMode>>,
    /// Serialises drain passes.
    drain_lock: Mutex<()>,
}

impl std::fmt::Debug for DatabaseAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseAdapter")
            .field("context", &self.context)
            .field("forced", &self.forced_mode())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DatabaseAdapter {
    pub fn new(
        context: RuntimeContext,
        local: LocalStoreClient,
        remote: Arc<dyn RemoteStore>,
        monitor: ConnectivityMonitor,
        events: EventHub,
        settings: AdapterSettings,
    ) -> Self {
        DatabaseAdapter {
            context,
            queue: SyncQueueRepository::new(local.clone()),
            local,
            remote,
            monitor,
            events,
            settings,
            forced: RwLock::new(None),
            drain_lock: Mutex::new(()),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn context(&self) -> RuntimeContext {
        self.context
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn settings(&self) -> AdapterSettings {
        self.settings
    }

    /// Returns true if this context has a reachable local store.
    pub fn has_local_store(&self) -> bool {
        self.context.has_local_store() && self.local.is_available()
    }

    // -------------------------------------------------------------------------
    // Store Selection
    // -------------------------------------------------------------------------

    /// Pins every call to `mode`, or restores automatic selection with `None`.
    pub fn set_forced_mode(&self, mode: Option<StoreMode>) {
        *self.forced.write().unwrap_or_else(|p| p.into_inner()) = mode;
        debug!(forced = ?mode, "Store mode override changed");
    }

    pub fn forced_mode(&self) -> Option<StoreMode> {
        *self.forced.read().unwrap_or_else(|p| p.into_inner())
    }

    /// The store that backs the next call.
    pub fn select_store(&self) -> StoreMode {
        if let Some(mode) = self.forced_mode() {
            return mode;
        }

        if !self.context.has_local_store() {
            return StoreMode::Remote;
        }

        if self.local.is_available() {
            StoreMode::Local
        } else {
            warn!("Local store unavailable in desktop context, falling back to remote");
            StoreMode::Remote
        }
    }

    // -------------------------------------------------------------------------
    // Persistence Contract
    // -------------------------------------------------------------------------

    /// Runs a free-form statement against the local store.
    ///
    /// The remote store accepts only structured operations; selecting it here
    /// is a programming error and fails with
    /// [`SyncError::RemoteQueryUnsupported`].
    pub async fn query<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> SyncResult<Vec<T>> {
        match self.select_store() {
            StoreMode::Remote => {
                error!(sql = %sql, "Free-form query routed to the remote store");
                Err(SyncError::RemoteQueryUnsupported(sql.to_string()))
            }
            StoreMode::Local => self
                .local
                .query(sql, params)
                .await?
                .into_iter()
                .map(|row| serde_json::from_value(Value::Object(row)).map_err(SyncError::from))
                .collect(),
        }
    }

    /// Inserts a record (local shape) and returns its primary key.
    ///
    /// A missing `id` is generated; `created_at` and the table's
    /// last-modified column are stamped when absent.
    pub async fn insert(&self, table: SyncTable, record: &Record) -> SyncResult<String> {
        let schema = table.schema();
        let (id, row) = prepare_insert(table, record)?;

        match self.select_store() {
            StoreMode::Local => {
                let (append, entry) =
                    SyncQueueRepository::append_statement(SyncOperation::Insert, table, &id, Some(&row))?;
                self.local
                    .batch(vec![Statement::insert(schema.local, &row)?, append])
                    .await?;
                debug!(table = %table, record_id = %id, queue_id = %entry.id, "Inserted locally");
            }
            StoreMode::Remote => {
                self.remote
                    .insert(schema.remote, &schema.to_remote(&row, TranslateMode::Full))
                    .await?;
                debug!(table = %table, record_id = %id, "Inserted remotely");
            }
        }

        Ok(id)
    }

    /// Applies a partial record to the row with primary key `id`.
    ///
    /// Fails with a not-found error when the row does not exist.
    pub async fn update(&self, table: SyncTable, id: &str, patch: &Record) -> SyncResult<()> {
        let schema = table.schema();
        let patch = prepare_patch(table, patch);

        match self.select_store() {
            StoreMode::Local => {
                let (append, entry) =
                    SyncQueueRepository::append_statement(SyncOperation::Update, table, id, Some(&patch))?;
                self.local
                    .batch(vec![
                        Statement::update(schema.local, schema.primary_key, id, &patch)?
                            .expect_changes(),
                        append,
                    ])
                    .await?;
                debug!(table = %table, record_id = %id, queue_id = %entry.id, "Updated locally");
            }
            StoreMode::Remote => {
                let changed = self
                    .remote
                    .update(
                        schema.remote,
                        schema.primary_key,
                        id,
                        &schema.to_remote(&patch, TranslateMode::Partial),
                    )
                    .await?;
                if changed == 0 {
                    return Err(RemoteError::NotFound.into());
                }
                debug!(table = %table, record_id = %id, "Updated remotely");
            }
        }

        Ok(())
    }

    /// Deletes the row with primary key `id`. A missing row is not an error.
    pub async fn delete(&self, table: SyncTable, id: &str) -> SyncResult<()> {
        let schema = table.schema();

        match self.select_store() {
            StoreMode::Local => {
                let (append, entry) =
                    SyncQueueRepository::append_statement(SyncOperation::Delete, table, id, None)?;
                self.local
                    .batch(vec![
                        Statement::delete(schema.local, schema.primary_key, id)?,
                        append,
                    ])
                    .await?;
                debug!(table = %table, record_id = %id, queue_id = %entry.id, "Deleted locally");
            }
            StoreMode::Remote => {
                self.remote
                    .delete(schema.remote, schema.primary_key, id)
                    .await?;
                debug!(table = %table, record_id = %id, "Deleted remotely");
            }
        }

        Ok(())
    }

    /// Reads one row, always in the local shape.
    pub async fn get_by_id(&self, table: SyncTable, id: &str) -> SyncResult<Option<Record>> {
        let schema = table.schema();
        match self.select_store() {
            StoreMode::Local => Ok(self
                .local
                .get_by_id(schema.local, schema.primary_key, id)
                .await?),
            StoreMode::Remote => Ok(self
                .remote
                .select_by_id(schema.remote, schema.primary_key, id)
                .await?
                .map(|row| schema.to_local(&row))),
        }
    }

    /// Reads every row, always in the local shape.
    pub async fn get_all(&self, table: SyncTable) -> SyncResult<Vec<Record>> {
        let schema = table.schema();
        match self.select_store() {
            StoreMode::Local => Ok(self.local.get_all(schema.local).await?),
            StoreMode::Remote => Ok(self
                .remote
                .select_all(schema.remote)
                .await?
                .iter()
                .map(|row| schema.to_local(row))
                .collect()),
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Replays one batch of pending queue entries against the remote store.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        let report = self.drain_pass().await?;
        if let Some(reason) = report.skipped {
            debug!(reason = %reason, "Drain skipped");
        }
        self.events
            .publish_activity(SyncActivity::Drained(report.clone()));
        Ok(report)
    }

    async fn drain_pass(&self) -> SyncResult<DrainReport> {
        if !self.has_local_store() {
            return Ok(DrainReport::skipped(DrainSkip::NoLocalStore));
        }
        if !self.monitor.remote_status().is_online() {
            return Ok(DrainReport::skipped(DrainSkip::Offline));
        }

        let _guard = self.drain_lock.lock().await;

        if let Err(e) = self.remote.ping().await {
            debug!(error = %e, "Drain pre-check failed");
            return Ok(DrainReport::skipped(DrainSkip::Unreachable));
        }

        OutboxDrainer::new(
            self.local.clone(),
            self.remote.clone(),
            self.settings.batch_size,
            self.settings.max_attempts,
        )
        .drain_batch()
        .await
    }

    /// Copies newer remote rows of the pulled tables into the local store.
    pub async fn pull(&self) -> SyncResult<PullReport> {
        let report = if !self.has_local_store() {
            PullReport::skipped("no local store")
        } else if !self.monitor.remote_status().is_online() {
            PullReport::skipped("offline")
        } else {
            Puller::new(self.local.clone(), self.remote.clone(), self.settings.max_attempts)
                .pull_tables(&SyncTable::PULLED)
                .await
        };

        self.events
            .publish_activity(SyncActivity::Pulled(report.clone()));
        Ok(report)
    }

    /// Drain, then pull, so fresh uploads are not overwritten by stale rows.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        let drain = self.drain().await?;
        let pull = self.pull().await?;
        info!(
            synced = drain.synced,
            failed = drain.failed,
            pulled_inserted = pull.inserted(),
            pulled_updated = pull.updated(),
            "Sync complete"
        );
        Ok(SyncReport { drain, pull })
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Counts of pending, synced and exhausted queue entries.
    pub async fn queue_status(&self) -> SyncResult<QueueStatus> {
        if !self.has_local_store() {
            return Ok(QueueStatus::default());
        }
        Ok(self.queue.status(self.settings.max_attempts).await?)
    }

    /// Entries past the retry ceiling, with their last error.
    pub async fn list_exhausted(&self) -> SyncResult<Vec<SyncQueueEntry>> {
        if !self.has_local_store() {
            return Ok(Vec::new());
        }
        Ok(self.queue.list_exhausted(self.settings.max_attempts).await?)
    }

    /// Removes synced entries older than the retention window (default from
    /// settings) and every exhausted entry.
    pub async fn cleanup_queue(&self, retention_days: Option<i64>) -> SyncResult<CleanupReport> {
        let days = retention_days.unwrap_or(self.settings.retention_days);
        let report = self
            .queue
            .cleanup(days, self.settings.max_attempts)
            .await?;
        if report.removed_exhausted > 0 {
            warn!(
                removed = report.removed_exhausted,
                "Discarded queue entries that never reached the remote store"
            );
        }
        self.events
            .publish_activity(SyncActivity::QueueCleaned(report));
        Ok(report)
    }

    /// Deletes every pending entry, retryable or not.
    pub async fn reset_queue(&self) -> SyncResult<u64> {
        let removed = self.queue.reset_pending().await?;
        self.events
            .publish_activity(SyncActivity::QueueReset { removed });
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Triggers
    // -------------------------------------------------------------------------

    /// Reconciles every time the remote store becomes reachable.
    ///
    /// Runs a full [`sync`](Self::sync) when `full_sync` is set, otherwise a
    /// drain.
    pub fn spawn_reconnect_trigger(self: &Arc<Self>, full_sync: bool) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        let mut events = self.monitor.subscribe();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                adapter
                    .events
                    .publish_activity(SyncActivity::Connectivity(event));

                if !event.came_online() {
                    continue;
                }

                info!(full_sync, "Remote store reachable, reconciling");
                let outcome = if full_sync {
                    adapter.sync().await.map(|_| ())
                } else {
                    adapter.drain().await.map(|_| ())
                };
                if let Err(e) = outcome {
                    warn!(error = %e, "Reconnect reconciliation failed");
                }
            }
        })
    }

    /// Drains every `interval` while the remote store is reachable.
    pub fn spawn_periodic_drain(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let adapter = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !adapter.monitor.remote_status().is_online() {
                    continue;
                }
                if let Err(e) = adapter.drain().await {
                    warn!(error = %e, "Periodic drain failed");
                }
            }
        })
    }
}

// =============================================================================
// Record Preparation
// =============================================================================

fn is_missing(record: &Record, column: &str) -> bool {
    record.get(column).map_or(true, Value::is_null)
}

/// Fills the primary key and timestamps of a new record.
fn prepare_insert(table: SyncTable, record: &Record) -> SyncResult<(String, Record)> {
    let schema = table.schema();
    let mut row = record.clone();

    let id = match schema.record_id(&row) {
        Ok(id) => id,
        Err(_) if schema.primary_key == "id" => {
            let id = Uuid::new_v4().to_string();
            row.insert("id".to_string(), Value::String(id.clone()));
            id
        }
        Err(e) => return Err(e.into()),
    };

    let now = now_timestamp();
    let stamped = schema
        .field("created_at")
        .map(|_| "created_at")
        .into_iter()
        .chain(schema.last_modified);
    for column in stamped {
        if is_missing(&row, column) {
            row.insert(column.to_string(), Value::String(now.clone()));
        }
    }

    Ok((id, row))
}

/// Drops the primary key from a patch and stamps the last-modified column.
fn prepare_patch(table: SyncTable, patch: &Record) -> Record {
    let schema = table.schema();
    let mut patch = patch.clone();
    patch.remove(schema.primary_key);

    if let Some(column) = schema.last_modified {
        if is_missing(&patch, column) {
            patch.insert(column.to_string(), Value::String(now_timestamp()));
        }
    }
    patch
}
