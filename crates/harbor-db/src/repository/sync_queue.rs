//! # Sync Queue Repository
//!
//! The durable operation log of local mutations awaiting the remote store.
//!
//! ## Append With The Write
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      One Local Batch per Mutation                       │
//! │                                                                         │
//! │  adapter.insert(products, P1)                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. INSERT INTO products (...) VALUES (...)                     │   │
//! │  │  2. INSERT INTO sync_queue (operation, table_name, record_id,   │   │
//! │  │                             data, ...) VALUES ('insert', ...)   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← the row and its queue entry exist together or not at all     │
//! │                                                                         │
//! │  DRAIN (later, online)                                                 │
//! │  1. SELECT pending ORDER BY table priority, created_at LIMIT n         │
//! │  2. replay each entry against the remote store                         │
//! │  3. ok   → synced = 1, synced_at = now                                 │
//! │     fail → attempts += 1, last_error = ?                               │
//! │  entries with attempts >= ceiling are skipped but kept                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use harbor_core::{
    format_timestamp, parse_timestamp, QueueStatus, Record, SyncOperation, SyncQueueEntry,
    SyncTable,
};

use crate::client::{LocalStoreClient, Statement};
use crate::error::{DbError, DbResult};

/// What a cleanup sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Synced entries older than the retention window.
    pub removed_synced: u64,
    /// Pending entries that had exhausted their retries.
    pub removed_exhausted: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.removed_synced + self.removed_exhausted
    }
}

/// Repository for the `sync_queue` table.
#[derive(Debug, Clone)]
pub struct SyncQueueRepository {
    client: LocalStoreClient,
}

impl SyncQueueRepository {
    pub fn new(client: LocalStoreClient) -> Self {
        SyncQueueRepository { client }
    }

    /// Builds the statement appending one entry, without executing it.
    ///
    /// Callers put it in the same batch as the mutation it records.
    pub fn append_statement(
        operation: SyncOperation,
        table: SyncTable,
        record_id: &str,
        data: Option<&Record>,
    ) -> DbResult<(Statement, SyncQueueEntry)> {
        let data = match (operation.carries_payload(), data) {
            (true, Some(record)) => Some(serde_json::to_string(record)?),
            _ => None,
        };

        let entry = SyncQueueEntry {
            id: Uuid::new_v4().to_string(),
            operation,
            table_name: table.as_str().to_string(),
            record_id: record_id.to_string(),
            data,
            synced: false,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            synced_at: None,
        };

        let statement = Statement::new(
            r#"
            INSERT INTO sync_queue (
                id, operation, table_name, record_id, data,
                synced, attempts, last_error, created_at, synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, NULL, ?6, NULL)
            "#,
            vec![
                Value::from(entry.id.clone()),
                Value::from(entry.operation.as_str()),
                Value::from(entry.table_name.clone()),
                Value::from(entry.record_id.clone()),
                entry.data.clone().map_or(Value::Null, Value::from),
                Value::from(format_timestamp(entry.created_at)),
            ],
        );

        Ok((statement, entry))
    }

    /// Appends an entry on its own.
    pub async fn enqueue(
        &self,
        operation: SyncOperation,
        table: SyncTable,
        record_id: &str,
        data: Option<&Record>,
    ) -> DbResult<SyncQueueEntry> {
        let (statement, entry) = Self::append_statement(operation, table, record_id, data)?;

        debug!(
            operation = %operation,
            table = %table,
            record_id = %record_id,
            "Queuing for sync"
        );

        self.client.run(statement.sql, statement.params).await?;
        Ok(entry)
    }

    /// Pending entries still under the retry ceiling.
    ///
    /// Ordered by table priority (parents first), then creation time.
    pub async fn fetch_pending(&self, limit: i64, max_attempts: i64) -> DbResult<Vec<SyncQueueEntry>> {
        let sql = format!(
            r#"
            SELECT * FROM sync_queue
            WHERE synced = 0 AND attempts < ?1
            ORDER BY {}, created_at ASC, rowid ASC
            LIMIT ?2
            "#,
            priority_order_sql()
        );

        let rows = self
            .client
            .query(sql, vec![Value::from(max_attempts), Value::from(limit)])
            .await?;
        rows.into_iter().map(entry_from_record).collect()
    }

    /// Record ids of `table` with a retryable entry not yet synced.
    ///
    /// The local row is ahead of the remote one for these ids.
    pub async fn pending_ids(&self, table: SyncTable, max_attempts: i64) -> DbResult<HashSet<String>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT record_id FROM sync_queue \
                 WHERE table_name = ?1 AND synced = 0 AND attempts < ?2",
                vec![Value::from(table.as_str()), Value::from(max_attempts)],
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("record_id").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<SyncQueueEntry>> {
        let rows = self
            .client
            .query("SELECT * FROM sync_queue WHERE id = ?1", vec![Value::from(id)])
            .await?;
        rows.into_iter().next().map(entry_from_record).transpose()
    }

    /// Marks an entry as confirmed by the remote store.
    ///
    /// Synced entries are never modified again.
    pub async fn mark_synced(&self, id: &str) -> DbResult<()> {
        self.client
            .run(
                "UPDATE sync_queue SET synced = 1, synced_at = ?2, last_error = NULL \
                 WHERE id = ?1 AND synced = 0",
                vec![Value::from(id), Value::from(format_timestamp(Utc::now()))],
            )
            .await?;
        Ok(())
    }

    /// Records a failed attempt.
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        self.client
            .run(
                "UPDATE sync_queue SET attempts = attempts + 1, last_error = ?2 \
                 WHERE id = ?1 AND synced = 0",
                vec![Value::from(id), Value::from(error)],
            )
            .await?;
        Ok(())
    }

    /// Counts pending, synced and exhausted entries.
    pub async fn status(&self, max_attempts: i64) -> DbResult<QueueStatus> {
        let rows = self
            .client
            .query(
                r#"
                SELECT
                    COALESCE(SUM(CASE WHEN synced = 0 AND attempts < ?1 THEN 1 ELSE 0 END), 0) AS pending,
                    COALESCE(SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END), 0) AS synced,
                    COALESCE(SUM(CASE WHEN synced = 0 AND attempts >= ?1 THEN 1 ELSE 0 END), 0) AS failed
                FROM sync_queue
                "#,
                vec![Value::from(max_attempts)],
            )
            .await?;

        let row = rows.into_iter().next().unwrap_or_default();
        let count = |column: &str| row.get(column).and_then(Value::as_i64).unwrap_or(0);

        Ok(QueueStatus {
            pending: count("pending"),
            synced: count("synced"),
            failed: count("failed"),
        })
    }

    /// Entries past the retry ceiling, oldest first.
    pub async fn list_exhausted(&self, max_attempts: i64) -> DbResult<Vec<SyncQueueEntry>> {
        let rows = self
            .client
            .query(
                "SELECT * FROM sync_queue WHERE synced = 0 AND attempts >= ?1 \
                 ORDER BY created_at ASC",
                vec![Value::from(max_attempts)],
            )
            .await?;
        rows.into_iter().map(entry_from_record).collect()
    }

    /// Deletes synced entries older than `retention_days` and every
    /// exhausted entry.
    ///
    /// Dropping exhausted entries abandons those local writes for good.
    pub async fn cleanup(&self, retention_days: i64, max_attempts: i64) -> DbResult<CleanupReport> {
        let cutoff = format_timestamp(Utc::now() - Duration::days(retention_days));

        let results = self
            .client
            .batch(vec![
                Statement::new(
                    "DELETE FROM sync_queue WHERE synced = 1 AND synced_at < ?1",
                    vec![Value::from(cutoff)],
                ),
                Statement::new(
                    "DELETE FROM sync_queue WHERE synced = 0 AND attempts >= ?1",
                    vec![Value::from(max_attempts)],
                ),
            ])
            .await?;

        let report = CleanupReport {
            removed_synced: results.first().map_or(0, |r| r.changes),
            removed_exhausted: results.get(1).map_or(0, |r| r.changes),
        };

        info!(
            removed_synced = report.removed_synced,
            removed_exhausted = report.removed_exhausted,
            "Sync queue cleanup complete"
        );
        Ok(report)
    }

    /// Deletes every pending entry, retryable or not.
    pub async fn reset_pending(&self) -> DbResult<u64> {
        let result = self
            .client
            .run("DELETE FROM sync_queue WHERE synced = 0", vec![])
            .await?;

        info!(removed = result.changes, "Pending sync queue entries cleared");
        Ok(result.changes)
    }
}

/// `CASE table_name WHEN 'settings' THEN 0 ... ELSE n END`
fn priority_order_sql() -> String {
    let arms: String = SyncTable::ALL
        .iter()
        .map(|t| format!(" WHEN '{}' THEN {}", t.as_str(), t.priority()))
        .collect();
    format!("CASE table_name{arms} ELSE {} END", SyncTable::ALL.len())
}

fn entry_from_record(row: Record) -> DbResult<SyncQueueEntry> {
    let text = |column: &str| -> Option<String> {
        row.get(column).and_then(Value::as_str).map(str::to_string)
    };
    let required = |column: &str| -> DbResult<String> {
        text(column).ok_or_else(|| {
            DbError::Serialization(format!("sync_queue row missing column '{column}'"))
        })
    };

    let operation = required("operation")?
        .parse::<SyncOperation>()
        .map_err(|e| DbError::Serialization(e.to_string()))?;
    let created_raw = required("created_at")?;
    let created_at = parse_timestamp(&created_raw).ok_or_else(|| {
        DbError::Serialization(format!("invalid created_at '{created_raw}'"))
    })?;

    Ok(SyncQueueEntry {
        id: required("id")?,
        operation,
        table_name: required("table_name")?,
        record_id: required("record_id")?,
        data: text("data"),
        synced: row.get("synced").and_then(Value::as_i64).unwrap_or(0) != 0,
        attempts: row.get("attempts").and_then(Value::as_i64).unwrap_or(0),
        last_error: text("last_error"),
        created_at,
        synced_at: text("synced_at").as_deref().and_then(parse_timestamp),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    async fn repo() -> (SyncQueueRepository, LocalStoreClient) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (_detached, client) = LocalHost::spawn(&db).await.unwrap();
        (SyncQueueRepository::new(client.clone()), client)
    }

    fn payload(id: &str) -> Record {
        json!({ "id": id }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_priority_sql() {
        let sql = priority_order_sql();
        assert!(sql.starts_with("CASE table_name WHEN 'settings' THEN 0"));
        assert!(sql.contains("WHEN 'inventory_movements' THEN 8"));
        assert!(sql.ends_with("ELSE 9 END"));
    }

    #[tokio::test]
    async fn test_enqueue_and_fetch_by_priority() {
        let (repo, _) = repo().await;

        repo.enqueue(SyncOperation::Insert, SyncTable::SaleItems, "si-1", Some(&payload("si-1")))
            .await
            .unwrap();
        repo.enqueue(SyncOperation::Insert, SyncTable::Sales, "s-1", Some(&payload("s-1")))
            .await
            .unwrap();
        repo.enqueue(SyncOperation::Delete, SyncTable::Products, "p-1", None)
            .await
            .unwrap();

        let pending = repo.fetch_pending(50, 5).await.unwrap();
        let order: Vec<&str> = pending.iter().map(|e| e.record_id.as_str()).collect();
        assert_eq!(order, vec!["p-1", "s-1", "si-1"]);

        assert!(pending[0].data.is_none());
        assert_eq!(pending[1].payload().unwrap()["id"], json!("s-1"));
    }

    #[tokio::test]
    async fn test_mark_synced_is_final() {
        let (repo, _) = repo().await;
        let entry = repo
            .enqueue(SyncOperation::Insert, SyncTable::Products, "p-1", Some(&payload("p-1")))
            .await
            .unwrap();

        repo.mark_synced(&entry.id).await.unwrap();
        repo.mark_failed(&entry.id, "late failure").await.unwrap();

        let stored = repo.get(&entry.id).await.unwrap().unwrap();
        assert!(stored.synced);
        assert!(stored.synced_at.is_some());
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.is_none());
        assert!(repo.fetch_pending(50, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_ceiling_and_status() {
        let (repo, _) = repo().await;
        let entry = repo
            .enqueue(SyncOperation::Update, SyncTable::Products, "p-1", Some(&payload("p-1")))
            .await
            .unwrap();

        for _ in 0..3 {
            repo.mark_failed(&entry.id, "remote unreachable").await.unwrap();
        }

        assert!(repo.fetch_pending(50, 3).await.unwrap().is_empty());
        assert_eq!(repo.fetch_pending(50, 5).await.unwrap().len(), 1);

        let status = repo.status(3).await.unwrap();
        assert_eq!(status, QueueStatus { pending: 0, synced: 0, failed: 1 });

        let exhausted = repo.list_exhausted(3).await.unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].last_error.as_deref(), Some("remote unreachable"));
    }

    #[tokio::test]
    async fn test_pending_ids_per_table() {
        let (repo, _) = repo().await;

        repo.enqueue(SyncOperation::Delete, SyncTable::Customers, "cu-1", None)
            .await
            .unwrap();
        let synced = repo
            .enqueue(SyncOperation::Insert, SyncTable::Customers, "cu-2", Some(&payload("cu-2")))
            .await
            .unwrap();
        repo.mark_synced(&synced.id).await.unwrap();
        let dead = repo
            .enqueue(SyncOperation::Update, SyncTable::Customers, "cu-3", Some(&payload("cu-3")))
            .await
            .unwrap();
        repo.mark_failed(&dead.id, "rejected").await.unwrap();
        repo.enqueue(SyncOperation::Delete, SyncTable::Products, "p-1", None)
            .await
            .unwrap();

        let ids = repo.pending_ids(SyncTable::Customers, 1).await.unwrap();
        assert_eq!(ids, HashSet::from(["cu-1".to_string()]));
        assert_eq!(repo.pending_ids(SyncTable::Customers, 5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_and_reset() {
        let (repo, client) = repo().await;

        let old = repo
            .enqueue(SyncOperation::Insert, SyncTable::Products, "p-1", Some(&payload("p-1")))
            .await
            .unwrap();
        repo.mark_synced(&old.id).await.unwrap();
        client
            .run(
                "UPDATE sync_queue SET synced_at = ?1 WHERE id = ?2",
                vec![json!("2020-01-01T00:00:00.000Z"), json!(old.id)],
            )
            .await
            .unwrap();

        let fresh = repo
            .enqueue(SyncOperation::Insert, SyncTable::Products, "p-2", Some(&payload("p-2")))
            .await
            .unwrap();
        repo.mark_synced(&fresh.id).await.unwrap();

        let dead = repo
            .enqueue(SyncOperation::Insert, SyncTable::Products, "p-3", Some(&payload("p-3")))
            .await
            .unwrap();
        repo.mark_failed(&dead.id, "rejected").await.unwrap();

        repo.enqueue(SyncOperation::Insert, SyncTable::Products, "p-4", Some(&payload("p-4")))
            .await
            .unwrap();

        let report = repo.cleanup(7, 1).await.unwrap();
        assert_eq!(report, CleanupReport { removed_synced: 1, removed_exhausted: 1 });

        let status = repo.status(1).await.unwrap();
        assert_eq!(status, QueueStatus { pending: 1, synced: 1, failed: 0 });

        assert_eq!(repo.reset_pending().await.unwrap(), 1);
        assert_eq!(repo.status(1).await.unwrap().pending, 0);
    }
}
