//! # Realtime Listener
//!
//! Mirrors remote changes into the local store between reconciliation
//! passes.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ChangeFeed.subscribe(table)   one task per table                      │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  Created / Updated ──► to_local() ──► UPSERT by primary key            │
//! │  Deleted           ──► key of old row ──► DELETE (absent is fine)      │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  EventHub.publish_change(TableChange)                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Applied changes are not queued for upload. Outside the desktop context
//! the listener does nothing.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use harbor_core::{Record, RuntimeContext, SyncTable};
use harbor_db::LocalStoreClient;

use crate::error::SyncResult;
use crate::events::{EventHub, TableChange};
use crate::remote::{ChangeEvent, ChangeFeed, ChangeKind};

/// Applies one change to the local store.
pub async fn apply_change(
    local: &LocalStoreClient,
    table: SyncTable,
    event: &ChangeEvent,
) -> SyncResult<TableChange> {
    let schema = table.schema();

    match event.kind {
        ChangeKind::Created | ChangeKind::Updated => {
            let row = schema.to_local(&event.record);
            let id = schema.record_id(&row)?;
            local.upsert(schema.local, schema.primary_key, &row).await?;
            debug!(table = %table, record_id = %id, kind = ?event.kind, "Applied remote change");

            Ok(TableChange {
                table,
                kind: event.kind,
                record_id: id,
                record: row,
            })
        }
        ChangeKind::Deleted => {
            let id = schema.record_id(&schema.to_local(event.keyed_record()))?;
            let removed = local.delete(schema.local, schema.primary_key, &id).await?;
            debug!(table = %table, record_id = %id, removed, "Applied remote delete");

            Ok(TableChange {
                table,
                kind: ChangeKind::Deleted,
                record_id: id,
                record: Record::new(),
            })
        }
    }
}

/// Subscribes to the change feed and keeps local tables current.
pub struct RealtimeListener {
    context: RuntimeContext,
    local: LocalStoreClient,
    feed: Arc<dyn ChangeFeed>,
    events: EventHub,
    tables: Vec<SyncTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeListener {
    /// A listener for the pulled tables.
    pub fn new(
        context: RuntimeContext,
        local: LocalStoreClient,
        feed: Arc<dyn ChangeFeed>,
        events: EventHub,
    ) -> Self {
        Self::with_tables(context, local, feed, events, SyncTable::PULLED.to_vec())
    }

    pub fn with_tables(
        context: RuntimeContext,
        local: LocalStoreClient,
        feed: Arc<dyn ChangeFeed>,
        events: EventHub,
        tables: Vec<SyncTable>,
    ) -> Self {
        RealtimeListener {
            context,
            local,
            feed,
            events,
            tables,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to every table once. Later calls are no-ops.
    pub async fn initialize(&self) -> SyncResult<()> {
        if !self.context.has_local_store() || !self.local.is_available() {
            debug!("Realtime listener inactive without a local store");
            return Ok(());
        }

        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        let mut started = Vec::with_capacity(self.tables.len());
        for &table in &self.tables {
            let receiver = match self.feed.subscribe(table.schema().remote).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    started.iter().for_each(JoinHandle::abort);
                    return Err(e.into());
                }
            };
            started.push(self.spawn_table(table, receiver));
        }

        info!(tables = started.len(), "Realtime listener subscribed");
        *tasks = started;
        Ok(())
    }

    fn spawn_table(
        &self,
        table: SyncTable,
        mut receiver: tokio::sync::mpsc::Receiver<ChangeEvent>,
    ) -> JoinHandle<()> {
        let local = self.local.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match apply_change(&local, table, &event).await {
                    Ok(change) => events.publish_change(change),
                    Err(e) => warn!(table = %table, error = %e, "Failed to apply remote change"),
                }
            }
            debug!(table = %table, "Change stream ended");
        })
    }

    /// Returns true while subscriptions are live.
    pub async fn is_active(&self) -> bool {
        !self.tasks.lock().await.is_empty()
    }

    /// Tears every subscription down.
    pub async fn destroy(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }
        for task in &tasks {
            task.abort();
        }
        for table in &self.tables {
            if let Err(e) = self.feed.unsubscribe(table.schema().remote).await {
                warn!(table = %table, error = %e, "Failed to leave change channel");
            }
        }
        info!(tables = tasks.len(), "Realtime listener stopped");
    }
}
