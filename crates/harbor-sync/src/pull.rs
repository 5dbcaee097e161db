//! # Puller
//!
//! Copies remote rows into the local store.
//!
//! ## Merge Rule per Row
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  remote row ──► to_local() ──► match local row by primary key          │
//! │                                                                         │
//! │  absent locally                      → INSERT                          │
//! │  table has last-modified column:                                       │
//! │      remote strictly newer            → UPDATE                         │
//! │      (local timestamp missing counts as older)                         │
//! │      otherwise                        → unchanged                      │
//! │  table without last-modified column   → UPDATE (remote wins)           │
//! │  id has a retryable queue entry       → deferred (local is ahead)      │
//! │                                                                         │
//! │  One local batch per table: a table is merged entirely or not at all.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pulled rows are not queued for upload.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use harbor_core::{Record, SyncTable};
use harbor_db::{LocalStoreClient, Statement, SyncQueueRepository};

use crate::error::SyncResult;
use crate::remote::RemoteStore;

/// Per-table merge counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePull {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Rows left alone because a local change to them is still queued.
    pub deferred: usize,
}

/// Outcome of a pull pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    pub tables: BTreeMap<SyncTable, TablePull>,
    /// Tables that could not be pulled, with the reason.
    pub errors: BTreeMap<SyncTable, String>,
    /// Set when the pass did not run at all.
    pub skipped: Option<String>,
}

impl PullReport {
    pub fn skipped(reason: impl Into<String>) -> Self {
        PullReport {
            skipped: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn inserted(&self) -> usize {
        self.tables.values().map(|t| t.inserted).sum()
    }

    pub fn updated(&self) -> usize {
        self.tables.values().map(|t| t.updated).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.skipped.is_none() && self.errors.is_empty()
    }
}

/// Downloads remote rows table by table.
pub struct Puller {
    local: LocalStoreClient,
    remote: Arc<dyn RemoteStore>,
    queue: SyncQueueRepository,
    max_attempts: i64,
}

impl Puller {
    /// `max_attempts` is the retry ceiling: ids whose queue entries are
    /// still under it are not overwritten.
    pub fn new(local: LocalStoreClient, remote: Arc<dyn RemoteStore>, max_attempts: i64) -> Self {
        Puller {
            queue: SyncQueueRepository::new(local.clone()),
            local,
            remote,
            max_attempts,
        }
    }

    /// Pulls every table in `tables`, in order.
    ///
    /// A failing table is recorded and the rest still run.
    pub async fn pull_tables(&self, tables: &[SyncTable]) -> PullReport {
        let mut report = PullReport::default();

        for &table in tables {
            match self.pull_table(table).await {
                Ok(counts) => {
                    report.tables.insert(table, counts);
                }
                Err(e) => {
                    warn!(table = %table, error = %e, "Pull failed for table");
                    report.errors.insert(table, e.to_string());
                }
            }
        }

        info!(
            inserted = report.inserted(),
            updated = report.updated(),
            errors = report.errors.len(),
            "Pull pass complete"
        );
        report
    }

    /// Merges one table's remote rows into the local store.
    pub async fn pull_table(&self, table: SyncTable) -> SyncResult<TablePull> {
        let schema = table.schema();
        let key = schema.primary_key;

        let remote_rows = self.remote.select_all(schema.remote).await?;
        let local_rows: HashMap<String, Record> = self
            .local
            .get_all(schema.local)
            .await?
            .into_iter()
            .filter_map(|row| schema.record_id(&row).ok().map(|id| (id, row)))
            .collect();
        // A queued delete leaves the id absent locally; re-inserting it would
        // be undone by the next drain and never restored.
        let pending = self.queue.pending_ids(table, self.max_attempts).await?;

        let mut counts = TablePull::default();
        let mut statements = Vec::new();

        for remote_row in &remote_rows {
            let incoming = schema.to_local(remote_row);
            let id = match schema.record_id(&incoming) {
                Ok(id) => id,
                Err(e) => {
                    debug!(table = %table, error = %e, "Skipping remote row without key");
                    continue;
                }
            };

            if pending.contains(&id) {
                counts.deferred += 1;
                continue;
            }

            match local_rows.get(&id) {
                None => {
                    statements.push(Statement::insert(schema.local, &incoming)?);
                    counts.inserted += 1;
                }
                Some(existing) => {
                    let newer = match schema.last_modified {
                        None => true,
                        Some(_) => match (schema.modified_at(&incoming), schema.modified_at(existing)) {
                            (Some(remote_at), Some(local_at)) => remote_at > local_at,
                            (Some(_), None) => true,
                            (None, _) => false,
                        },
                    };

                    if newer {
                        statements.push(Statement::update(schema.local, key, &id, &incoming)?);
                        counts.updated += 1;
                    } else {
                        counts.unchanged += 1;
                    }
                }
            }
        }

        if !statements.is_empty() {
            self.local.batch(statements).await?;
        }

        debug!(
            table = %table,
            remote = remote_rows.len(),
            inserted = counts.inserted,
            updated = counts.updated,
            deferred = counts.deferred,
            "Table pulled"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use harbor_db::{Database, DbConfig, LocalHost};
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_pull_inserts_and_respects_timestamps() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (_host, local) = LocalHost::spawn(&db).await.unwrap();
        let remote = MemoryRemote::new();

        local
            .insert(
                "categories",
                &record(json!({
                    "id": "c-1", "name": "Local newer", "is_active": 1,
                    "updated_at": "2026-03-02T00:00:00.000Z"
                })),
            )
            .await
            .unwrap();
        local
            .insert(
                "categories",
                &record(json!({
                    "id": "c-2", "name": "Local older", "is_active": 1,
                    "updated_at": "2026-03-01T00:00:00.000Z"
                })),
            )
            .await
            .unwrap();

        remote.seed("categories", record(json!({
            "id": "c-1", "name": "Remote older", "active": true,
            "updated_at": "2026-03-01T00:00:00.000Z"
        })));
        remote.seed("categories", record(json!({
            "id": "c-2", "name": "Remote newer", "active": false,
            "updated_at": "2026-03-02T00:00:00.000Z"
        })));
        remote.seed("categories", record(json!({
            "id": "c-3", "name": "Remote only", "active": true
        })));

        let puller = Puller::new(local.clone(), Arc::new(remote.clone()), 5);
        let counts = puller.pull_table(SyncTable::Categories).await.unwrap();
        assert_eq!(
            counts,
            TablePull { inserted: 1, updated: 1, unchanged: 1, deferred: 0 }
        );

        let c1 = local.get_by_id("categories", "id", "c-1").await.unwrap().unwrap();
        assert_eq!(c1["name"], json!("Local newer"));
        let c2 = local.get_by_id("categories", "id", "c-2").await.unwrap().unwrap();
        assert_eq!(c2["name"], json!("Remote newer"));
        assert_eq!(c2["is_active"], json!(0));
        assert!(local.get_by_id("categories", "id", "c-3").await.unwrap().is_some());

        let queued = local.query("SELECT * FROM sync_queue", vec![]).await.unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_table_is_reported() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (_host, local) = LocalHost::spawn(&db).await.unwrap();
        let remote = MemoryRemote::new();
        remote.set_online(false);

        let report = Puller::new(local, Arc::new(remote), 5)
            .pull_tables(&[SyncTable::Settings, SyncTable::Products])
            .await;
        assert_eq!(report.errors.len(), 2);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_queued_ids_are_deferred() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (_host, local) = LocalHost::spawn(&db).await.unwrap();
        let remote = MemoryRemote::new();
        let queue = SyncQueueRepository::new(local.clone());

        // Deleted locally, delete not yet uploaded.
        queue
            .enqueue(harbor_core::SyncOperation::Delete, SyncTable::Customers, "cu-1", None)
            .await
            .unwrap();
        // Edited locally, edit not yet uploaded.
        local
            .insert("customers", &record(json!({ "id": "cu-2", "name": "Local edit" })))
            .await
            .unwrap();
        queue
            .enqueue(
                harbor_core::SyncOperation::Update,
                SyncTable::Customers,
                "cu-2",
                Some(&record(json!({ "name": "Local edit" }))),
            )
            .await
            .unwrap();

        remote.seed("customers", record(json!({ "id": "cu-1", "name": "Gone" })));
        remote.seed("customers", record(json!({ "id": "cu-2", "name": "Remote" })));

        let counts = Puller::new(local.clone(), Arc::new(remote), 5)
            .pull_table(SyncTable::Customers)
            .await
            .unwrap();
        assert_eq!(counts.deferred, 2);
        assert_eq!(counts.inserted + counts.updated, 0);

        assert!(local.get_by_id("customers", "id", "cu-1").await.unwrap().is_none());
        let cu2 = local.get_by_id("customers", "id", "cu-2").await.unwrap().unwrap();
        assert_eq!(cu2["name"], json!("Local edit"));
    }
}
