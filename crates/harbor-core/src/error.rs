//! # Error Types
//!
//! Domain-specific error types for harbor-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  harbor-core errors (this file)                                        │
//! │  └── CoreError        - Schema lookup and queue decode failures        │
//! │                                                                         │
//! │  harbor-db errors (separate crate)                                     │
//! │  └── DbError          - Local store failures                           │
//! │                                                                         │
//! │  harbor-sync errors (separate crate)                                   │
//! │  ├── RemoteError      - Structured remote store result                 │
//! │  └── SyncError        - What adapter callers see                       │
//! │                                                                         │
//! │  Flow: CoreError → DbError / SyncError → caller                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Core data-model errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A table name does not belong to the syncable set.
    ///
    /// ## When This Occurs
    /// - A queue row written by an older build references a dropped table
    /// - A change-feed message names a table this build does not mirror
    #[error("Unknown syncable table: {0}")]
    UnknownTable(String),

    /// An operation name stored in the queue is not insert/update/delete.
    #[error("Unknown sync operation: {0}")]
    UnknownOperation(String),

    /// A record has no usable primary key value.
    #[error("Record for {table} has no primary key '{key}'")]
    MissingPrimaryKey { table: String, key: String },

    /// An insert/update queue entry carries no payload.
    #[error("Queue entry {id} has no payload")]
    MissingPayload { id: String },

    /// A stored payload could not be decoded into a record.
    #[error("Invalid payload for queue entry {id}: {reason}")]
    InvalidPayload { id: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
