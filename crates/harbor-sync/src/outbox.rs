//! # Outbox Drainer
//!
//! Replays pending sync queue entries against the remote store.
//!
//! ## Replay Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Per-Entry Replay                                 │
//! │                                                                         │
//! │  INSERT  remote.insert(full row)                                       │
//! │          └─ Conflict ──────────► remote.update(id, payload)   converted│
//! │                                                                         │
//! │  UPDATE  remote.update(id, patch)                                      │
//! │          └─ 0 rows ───► read full local row ─► remote.insert  converted│
//! │                         └─ row gone locally ─► nothing sent  superseded│
//! │                                                                         │
//! │  DELETE  remote.delete(id)                                             │
//! │          └─ 0 rows / NotFound ─► success                               │
//! │                                                                         │
//! │  ok    → mark_synced (synced = 1, synced_at = now)                     │
//! │  error → mark_failed (attempts += 1, last_error) and continue          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are replayed one at a time in the order the queue returns them
//! (parent tables first), so a child row never reaches the remote store
//! before the row it references.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use harbor_core::{SyncOperation, SyncQueueEntry, TranslateMode};
use harbor_db::{LocalStoreClient, SyncQueueRepository};

use crate::error::SyncResult;
use crate::remote::{RemoteError, RemoteStore};

// =============================================================================
// Reports
// =============================================================================

/// Why a drain pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainSkip {
    /// This context has no local store, so there is no queue.
    NoLocalStore,
    /// The monitor reports the remote store offline.
    Offline,
    /// The reachability pre-check failed.
    Unreachable,
}

impl std::fmt::Display for DrainSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainSkip::NoLocalStore => write!(f, "no local store"),
            DrainSkip::Offline => write!(f, "offline"),
            DrainSkip::Unreachable => write!(f, "remote unreachable"),
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Entries taken from the queue.
    pub attempted: usize,
    /// Entries confirmed by the remote store.
    pub synced: usize,
    /// Synced entries that needed the complementary operation.
    pub converted: usize,
    /// Synced updates whose row was deleted locally before they reached the
    /// remote store. The queued delete covers them.
    pub superseded: usize,
    /// Entries that failed this pass.
    pub failed: usize,
    /// Failed entries that reached the retry ceiling this pass.
    pub exhausted: usize,
    pub skipped: Option<DrainSkip>,
}

impl DrainReport {
    pub fn skipped(reason: DrainSkip) -> Self {
        DrainReport {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// How a successful entry reached the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Applied,
    Converted,
    Superseded,
}

// =============================================================================
// Drainer
// =============================================================================

/// Replays one batch of the sync queue.
pub struct OutboxDrainer {
    local: LocalStoreClient,
    queue: SyncQueueRepository,
    remote: Arc<dyn RemoteStore>,
    batch_size: i64,
    max_attempts: i64,
}

impl OutboxDrainer {
    pub fn new(
        local: LocalStoreClient,
        remote: Arc<dyn RemoteStore>,
        batch_size: i64,
        max_attempts: i64,
    ) -> Self {
        OutboxDrainer {
            queue: SyncQueueRepository::new(local.clone()),
            local,
            remote,
            batch_size,
            max_attempts,
        }
    }

    /// Replays up to `batch_size` pending entries.
    ///
    /// Remote failures are recorded per entry and never abort the batch.
    /// A local store failure while recording an outcome does.
    pub async fn drain_batch(&self) -> SyncResult<DrainReport> {
        let entries = self
            .queue
            .fetch_pending(self.batch_size, self.max_attempts)
            .await?;

        let mut report = DrainReport {
            attempted: entries.len(),
            ..Default::default()
        };

        if entries.is_empty() {
            debug!("No pending sync queue entries");
            return Ok(report);
        }

        info!(count = entries.len(), "Draining sync queue");

        for entry in &entries {
            match self.replay(entry).await {
                Ok(outcome) => {
                    self.queue.mark_synced(&entry.id).await?;
                    report.synced += 1;
                    match outcome {
                        Replay::Converted => report.converted += 1,
                        Replay::Superseded => report.superseded += 1,
                        Replay::Applied => {}
                    }
                    debug!(
                        operation = %entry.operation,
                        table = %entry.table_name,
                        record_id = %entry.record_id,
                        outcome = ?outcome,
                        "Queue entry synced"
                    );
                }
                Err(e) => {
                    self.queue.mark_failed(&entry.id, &e.to_string()).await?;
                    report.failed += 1;

                    let attempts = entry.attempts + 1;
                    if attempts >= self.max_attempts {
                        report.exhausted += 1;
                        warn!(
                            id = %entry.id,
                            table = %entry.table_name,
                            record_id = %entry.record_id,
                            attempts,
                            error = %e,
                            "Queue entry reached the retry ceiling and will no longer be replayed"
                        );
                    } else {
                        warn!(
                            id = %entry.id,
                            table = %entry.table_name,
                            record_id = %entry.record_id,
                            attempts,
                            error = %e,
                            "Queue entry failed"
                        );
                    }
                }
            }
        }

        info!(
            synced = report.synced,
            converted = report.converted,
            failed = report.failed,
            "Drain pass complete"
        );
        Ok(report)
    }

    async fn replay(&self, entry: &SyncQueueEntry) -> SyncResult<Replay> {
        let table = entry.table()?;
        let schema = table.schema();
        let key = schema.primary_key;
        let id = entry.record_id.as_str();

        match entry.operation {
            SyncOperation::Insert => {
                let payload = entry.payload()?;
                let row = schema.to_remote(&payload, TranslateMode::Full);

                match self.remote.insert(schema.remote, &row).await {
                    Ok(()) => Ok(Replay::Applied),
                    Err(RemoteError::Conflict) => {
                        debug!(table = %table, record_id = %id, "Insert conflicted, updating instead");
                        let patch = schema.to_remote(&payload, TranslateMode::Partial);
                        self.remote.update(schema.remote, key, id, &patch).await?;
                        Ok(Replay::Converted)
                    }
                    Err(e) => Err(e.into()),
                }
            }

            SyncOperation::Update => {
                let payload = entry.payload()?;
                let patch = schema.to_remote(&payload, TranslateMode::Partial);

                if self.remote.update(schema.remote, key, id, &patch).await? > 0 {
                    return Ok(Replay::Applied);
                }

                debug!(table = %table, record_id = %id, "Update matched no remote row, inserting");
                let Some(full) = self.local.get_by_id(schema.local, key, id).await? else {
                    debug!(table = %table, record_id = %id, "Row deleted locally, update superseded");
                    return Ok(Replay::Superseded);
                };

                self.remote
                    .insert(schema.remote, &schema.to_remote(&full, TranslateMode::Full))
                    .await?;
                Ok(Replay::Converted)
            }

            SyncOperation::Delete => match self.remote.delete(schema.remote, key, id).await {
                Ok(_) | Err(RemoteError::NotFound) => Ok(Replay::Applied),
                Err(e) => Err(e.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use harbor_core::{Record, SyncTable};
    use harbor_db::{Database, DbConfig, LocalHost, LocalHostHandle};
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn setup() -> (LocalHostHandle, LocalStoreClient, MemoryRemote) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (handle, client) = LocalHost::spawn(&db).await.unwrap();
        (handle, client, MemoryRemote::new())
    }

    fn drainer(client: &LocalStoreClient, remote: &MemoryRemote) -> OutboxDrainer {
        OutboxDrainer::new(client.clone(), Arc::new(remote.clone()), 50, 3)
    }

    #[tokio::test]
    async fn test_insert_translated_to_remote_shape() {
        let (_host, client, remote) = setup().await;
        let queue = SyncQueueRepository::new(client.clone());
        let row = record(json!({ "id": "p-1", "name": "Cola", "price": 1.5, "is_active": 1 }));
        queue
            .enqueue(SyncOperation::Insert, SyncTable::Products, "p-1", Some(&row))
            .await
            .unwrap();

        let report = drainer(&client, &remote).drain_batch().await.unwrap();
        assert_eq!(report.synced, 1);

        let stored = remote.row("products", "p-1").unwrap();
        assert_eq!(stored["sale_price"], json!(1.5));
        assert_eq!(stored["active"], json!(true));
        assert_eq!(stored["unit"], json!("unit"));
        assert!(!stored.contains_key("price"));
    }

    #[tokio::test]
    async fn test_delete_of_missing_row_succeeds() {
        let (_host, client, remote) = setup().await;
        let queue = SyncQueueRepository::new(client.clone());
        queue
            .enqueue(SyncOperation::Delete, SyncTable::Customers, "c-9", None)
            .await
            .unwrap();

        let report = drainer(&client, &remote).drain_batch().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_failure_recorded_and_batch_continues() {
        let (_host, client, remote) = setup().await;
        let queue = SyncQueueRepository::new(client.clone());
        remote.fail_table("categories", RemoteError::Transient("reset".into()));

        let category = record(json!({ "id": "c-1", "name": "Drinks" }));
        let product = record(json!({ "id": "p-1", "name": "Cola" }));
        queue
            .enqueue(SyncOperation::Insert, SyncTable::Categories, "c-1", Some(&category))
            .await
            .unwrap();
        queue
            .enqueue(SyncOperation::Insert, SyncTable::Products, "p-1", Some(&product))
            .await
            .unwrap();

        let report = drainer(&client, &remote).drain_batch().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 1);
        assert!(remote.row("products", "p-1").is_some());

        let status = queue.status(3).await.unwrap();
        assert_eq!(status.pending, 1);
        assert_eq!(status.synced, 1);
    }

    #[tokio::test]
    async fn test_update_of_locally_deleted_row_is_superseded() {
        let (_host, client, remote) = setup().await;
        let queue = SyncQueueRepository::new(client.clone());
        let patch = record(json!({ "name": "Gone" }));
        let update = queue
            .enqueue(SyncOperation::Update, SyncTable::CashRegisters, "r-1", Some(&patch))
            .await
            .unwrap();
        queue
            .enqueue(SyncOperation::Delete, SyncTable::CashRegisters, "r-1", None)
            .await
            .unwrap();

        let report = drainer(&client, &remote).drain_batch().await.unwrap();
        assert_eq!((report.synced, report.superseded, report.failed), (2, 1, 0));
        assert!(remote.row("cash_registers", "r-1").is_none());
        assert_eq!(remote.write_count(), 0);

        let stored = queue.get(&update.id).await.unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(stored.attempts, 0);
    }
}
