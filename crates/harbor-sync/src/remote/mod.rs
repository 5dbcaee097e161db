//! # Remote Store
//!
//! The contract the engine needs from the hosted relational store: structured
//! table operations and a per-table change feed. Records crossing this
//! boundary are already in the REMOTE shape (remote table and column names).
//!
//! ## Implementations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   trait RemoteStore           trait ChangeFeed                         │
//! │   ─────────────────           ────────────────                         │
//! │   insert / update / delete    subscribe(table) → Receiver<ChangeEvent> │
//! │   select_all / select_by_id                                            │
//! │   ping                                                                 │
//! │        ▲          ▲                  ▲            ▲                     │
//! │        │          │                  │            │                     │
//! │   RestRemote   MemoryRemote ─────────┘      RealtimeFeed               │
//! │   (reqwest)    (tests, dry runs)            (websocket)                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Mapping
//! Every implementation reports failures through [`RemoteError`], so callers
//! never inspect transport-specific errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use harbor_core::Record;

pub mod memory;
pub mod realtime;
pub mod rest;

pub use memory::MemoryRemote;
pub use realtime::RealtimeFeed;
pub use rest::RestRemote;

// =============================================================================
// Errors
// =============================================================================

/// Structured result of a failed remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The addressed row does not exist.
    #[error("Record not found")]
    NotFound,

    /// A row with the same primary key already exists.
    #[error("Record already exists")]
    Conflict,

    /// The remote store could not be reached or is temporarily failing.
    #[error("Remote store unreachable: {0}")]
    Transient(String),

    /// The remote store refused the request.
    #[error("Remote store rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response could not be understood.
    #[error("Unexpected remote response: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

// =============================================================================
// Table Operations
// =============================================================================

/// Structured operations against the remote store.
///
/// There is deliberately no free-form statement method.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts a row. A duplicate primary key yields [`RemoteError::Conflict`].
    async fn insert(&self, table: &str, record: &Record) -> RemoteResult<()>;

    /// Patches the row with `key_column = id`, returning rows affected.
    async fn update(&self, table: &str, key_column: &str, id: &str, patch: &Record)
        -> RemoteResult<u64>;

    /// Deletes the row with `key_column = id`, returning rows affected.
    async fn delete(&self, table: &str, key_column: &str, id: &str) -> RemoteResult<u64>;

    async fn select_all(&self, table: &str) -> RemoteResult<Vec<Record>>;

    async fn select_by_id(&self, table: &str, key_column: &str, id: &str)
        -> RemoteResult<Option<Record>>;

    /// Lightweight reachability check.
    async fn ping(&self) -> RemoteResult<()>;
}

// =============================================================================
// Change Feed
// =============================================================================

/// Kind of row change pushed by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One row change, in the remote shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Remote table name.
    pub table: String,
    pub kind: ChangeKind,
    /// New row (empty for deletes).
    pub record: Record,
    /// Previous row, when the feed provides it (always carries the key on
    /// deletes).
    pub old: Option<Record>,
}

impl ChangeEvent {
    /// The row that identifies the change: `old` for deletes, else `record`.
    pub fn keyed_record(&self) -> &Record {
        match (&self.kind, &self.old) {
            (ChangeKind::Deleted, Some(old)) => old,
            _ => &self.record,
        }
    }
}

/// Per-table push subscriptions.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Starts delivering changes for `table` (remote name).
    ///
    /// The stream ends when the feed is closed.
    async fn subscribe(&self, table: &str) -> RemoteResult<mpsc::Receiver<ChangeEvent>>;

    /// Stops delivering changes for `table`. Its stream ends.
    async fn unsubscribe(&self, table: &str) -> RemoteResult<()>;
}
