//! # Database Error Types
//!
//! Error types for local store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Local Store Error Flow                            │
//! │                                                                         │
//! │  LocalStoreClient::query / run / batch                                 │
//! │       │                                                                 │
//! │       ├── no host in this context ──────────► DbError::Unavailable     │
//! │       ├── host did not answer in time ──────► DbError::Timeout         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  LocalHost (owns the SQLite connection)                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  sqlx::Error ──► From<sqlx::Error> ──► UniqueViolation / NotFound / ...│
//! │                                                                         │
//! │  The error is sent back through the reply channel unchanged.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use thiserror::Error;

/// Local store operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// No local store in this execution context, or its host has stopped.
    ///
    /// ## When This Occurs
    /// - The client was built with `LocalStoreClient::unavailable()` (browser)
    /// - The host task was shut down
    #[error("Local store unavailable: {0}")]
    Unavailable(String),

    /// The host did not answer within the request timeout.
    #[error("Local store request timed out after {0:?}")]
    Timeout(Duration),

    /// Entity not found in database.
    ///
    /// ## When This Occurs
    /// - A batch statement that must change a row changed none
    /// - `fetch_one` returns no rows
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// A table or column name failed identifier validation.
    #[error("Invalid SQL identifier: '{0}'")]
    InvalidIdentifier(String),

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// A row or parameter could not be converted.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Returns true if the store itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DbError::Unavailable(_) | DbError::Timeout(_))
    }

    /// Returns true for a uniqueness violation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::UniqueViolation { .. })
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
/// sqlx::Error::PoolTimedOut   → DbError::Unavailable
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // "UNIQUE constraint failed: <table>.<column>"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::Unavailable("connection pool timed out".to_string()),

            sqlx::Error::PoolClosed => DbError::Unavailable("pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
