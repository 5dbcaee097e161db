//! # Event Hub
//!
//! Typed fire-and-forget notifications for the rest of the application.
//!
//! ```text
//! ┌──────────────────────┐   TableChange    ┌──────────────────────────┐
//! │ RealtimeListener     │ ───────────────► │ subscribe_changes()      │
//! │ (remote → local)     │                  │ subscribe_table(table)   │
//! └──────────────────────┘                  └──────────────────────────┘
//! ┌──────────────────────┐   SyncActivity   ┌──────────────────────────┐
//! │ DatabaseAdapter      │ ───────────────► │ subscribe_activity()     │
//! │ (drain, pull, sweep) │                  │                          │
//! └──────────────────────┘                  └──────────────────────────┘
//! ```
//!
//! Publishing never blocks and never fails; with no subscribers the event is
//! dropped. Slow subscribers skip events rather than stall publishers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use harbor_core::{Record, SyncTable};
use harbor_db::CleanupReport;

use crate::connectivity::ConnectivityEvent;
use crate::outbox::DrainReport;
use crate::pull::PullReport;
use crate::remote::ChangeKind;

const CHANGE_BUFFER: usize = 256;
const ACTIVITY_BUFFER: usize = 64;

/// A remote change applied to the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: SyncTable,
    pub kind: ChangeKind,
    pub record_id: String,
    /// Row in the local shape. Empty for deletes.
    pub record: Record,
}

/// Reconciliation progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncActivity {
    Drained(DrainReport),
    Pulled(PullReport),
    QueueCleaned(CleanupReport),
    QueueReset { removed: u64 },
    Connectivity(ConnectivityEvent),
}

/// Broadcast channels for [`TableChange`] and [`SyncActivity`].
#[derive(Debug, Clone)]
pub struct EventHub {
    changes: broadcast::Sender<TableChange>,
    activity: broadcast::Sender<SyncActivity>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let (activity, _) = broadcast::channel(ACTIVITY_BUFFER);
        EventHub { changes, activity }
    }

    pub fn publish_change(&self, change: TableChange) {
        trace!(table = %change.table, record_id = %change.record_id, "Publishing table change");
        let _ = self.changes.send(change);
    }

    pub fn publish_activity(&self, activity: SyncActivity) {
        let _ = self.activity.send(activity);
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }

    /// Changes for one table only.
    pub fn subscribe_table(&self, table: SyncTable) -> TableSubscription {
        TableSubscription {
            table,
            receiver: self.changes.subscribe(),
        }
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<SyncActivity> {
        self.activity.subscribe()
    }
}

/// Receiver filtered to a single table.
#[derive(Debug)]
pub struct TableSubscription {
    table: SyncTable,
    receiver: broadcast::Receiver<TableChange>,
}

impl TableSubscription {
    pub fn table(&self) -> SyncTable {
        self.table
    }

    /// Waits for the next change to this table.
    ///
    /// Returns `None` once the hub is gone. Lagged gaps are skipped.
    pub async fn recv(&mut self) -> Option<TableChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if change.table == self.table => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
