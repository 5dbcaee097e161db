//! # In-Memory Remote Store
//!
//! A [`RemoteStore`] + [`ChangeFeed`] kept in process memory. It behaves like
//! the hosted store where the engine can observe it (duplicate keys conflict,
//! missing rows update zero rows, every write is pushed on the change feed)
//! and lets tests and dry runs switch reachability, add latency and inject
//! failures per table.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use harbor_core::{Record, SyncTable};

use super::{ChangeEvent, ChangeFeed, ChangeKind, RemoteError, RemoteResult, RemoteStore};

type Tables = BTreeMap<String, BTreeMap<String, Record>>;

struct MemoryInner {
    tables: Mutex<Tables>,
    failures: Mutex<HashMap<String, RemoteError>>,
    latency: Mutex<Option<Duration>>,
    online: AtomicBool,
    writes: AtomicU64,
    changes: broadcast::Sender<ChangeEvent>,
    forwarders: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

/// Remote store held in memory.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("online", &self.is_online())
            .field("writes", &self.write_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn key_column(table: &str) -> &'static str {
    table
        .parse::<SyncTable>()
        .map(|t| t.schema().primary_key)
        .unwrap_or("id")
}

fn key_of(record: &Record, column: &str) -> Option<String> {
    match record.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        MemoryRemote {
            inner: Arc::new(MemoryInner {
                tables: Mutex::new(Tables::new()),
                failures: Mutex::new(HashMap::new()),
                latency: Mutex::new(None),
                online: AtomicBool::new(true),
                writes: AtomicU64::new(0),
                changes,
                forwarders: Mutex::new(HashMap::new()),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Fault Injection
    // -------------------------------------------------------------------------

    /// Makes every call fail as unreachable (or succeed again).
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.inner.latency) = latency;
    }

    /// Fails every write to `table` with `error` until cleared.
    pub fn fail_table(&self, table: &str, error: RemoteError) {
        lock(&self.inner.failures).insert(table.to_string(), error);
    }

    pub fn clear_failures(&self) {
        lock(&self.inner.failures).clear();
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Successful writes served so far.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// All rows of a table, ordered by key.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        lock(&self.inner.tables)
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Record> {
        lock(&self.inner.tables)
            .get(table)
            .and_then(|rows| rows.get(id).cloned())
    }

    /// Stores a row without counting a write or publishing a change.
    pub fn seed(&self, table: &str, record: Record) {
        if let Some(id) = key_of(&record, key_column(table)) {
            lock(&self.inner.tables)
                .entry(table.to_string())
                .or_default()
                .insert(id, record);
        }
    }

    /// Removes a row without counting a write or publishing a change.
    pub fn remove(&self, table: &str, id: &str) -> Option<Record> {
        lock(&self.inner.tables)
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn reachable(&self) -> RemoteResult<()> {
        let latency = *lock(&self.inner.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_online() {
            Ok(())
        } else {
            Err(RemoteError::Transient("remote store offline".into()))
        }
    }

    async fn writable(&self, table: &str) -> RemoteResult<()> {
        self.reachable().await?;
        match lock(&self.inner.failures).get(table) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn publish(&self, table: &str, kind: ChangeKind, record: Record, old: Option<Record>) {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine.
        let _ = self.inner.changes.send(ChangeEvent {
            table: table.to_string(),
            kind,
            record,
            old,
        });
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn insert(&self, table: &str, record: &Record) -> RemoteResult<()> {
        self.writable(table).await?;

        let column = key_column(table);
        let id = key_of(record, column).ok_or_else(|| RemoteError::Rejected {
            status: 400,
            message: format!("missing primary key '{column}'"),
        })?;

        {
            let mut tables = lock(&self.inner.tables);
            let rows = tables.entry(table.to_string()).or_default();
            if rows.contains_key(&id) {
                return Err(RemoteError::Conflict);
            }
            rows.insert(id, record.clone());
        }

        self.publish(table, ChangeKind::Created, record.clone(), None);
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        _key_column: &str,
        id: &str,
        patch: &Record,
    ) -> RemoteResult<u64> {
        self.writable(table).await?;

        let updated = {
            let mut tables = lock(&self.inner.tables);
            match tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
                Some(row) => {
                    let old = row.clone();
                    for (column, value) in patch {
                        row.insert(column.clone(), value.clone());
                    }
                    Some((row.clone(), old))
                }
                None => None,
            }
        };

        match updated {
            Some((row, old)) => {
                self.publish(table, ChangeKind::Updated, row, Some(old));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, table: &str, _key_column: &str, id: &str) -> RemoteResult<u64> {
        self.writable(table).await?;

        match self.remove(table, id) {
            Some(old) => {
                self.publish(table, ChangeKind::Deleted, Record::new(), Some(old));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn select_all(&self, table: &str) -> RemoteResult<Vec<Record>> {
        self.reachable().await?;
        Ok(self.rows(table))
    }

    async fn select_by_id(
        &self,
        table: &str,
        _key_column: &str,
        id: &str,
    ) -> RemoteResult<Option<Record>> {
        self.reachable().await?;
        Ok(self.row(table, id))
    }

    async fn ping(&self) -> RemoteResult<()> {
        self.reachable().await
    }
}

#[async_trait]
impl ChangeFeed for MemoryRemote {
    async fn subscribe(&self, table: &str) -> RemoteResult<mpsc::Receiver<ChangeEvent>> {
        let mut changes = self.inner.changes.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let table = table.to_string();
        let key = table.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) if event.table == table => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(table = %table, skipped = n, "Memory change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        lock(&self.inner.forwarders)
            .entry(key)
            .or_default()
            .push(forwarder);
        Ok(rx)
    }

    async fn unsubscribe(&self, table: &str) -> RemoteResult<()> {
        let forwarders = lock(&self.inner.forwarders).remove(table).unwrap_or_default();
        for forwarder in &forwarders {
            forwarder.abort();
        }
        Ok(())
    }
}
