//! # Sync Error Types
//!
//! Error types for the adapter, reconciliation passes and configuration.
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncError Categories                             │
//! │                                                                         │
//! │  STORE UNAVAILABLE        → surfaced immediately, never retried        │
//! │  └── Local(DbError::Unavailable | DbError::Timeout)                    │
//! │                                                                         │
//! │  REMOTE TRANSIENT         → caught during drain, recorded, retried     │
//! │  └── Remote(RemoteError::Transient)                                    │
//! │                                                                         │
//! │  CONFLICT                 → not surfaced: drain converts the operation │
//! │  └── Remote(RemoteError::Conflict), zero-row update                    │
//! │                                                                         │
//! │  PROGRAMMING ERROR        → fail loudly                                │
//! │  └── RemoteQueryUnsupported                                            │
//! │                                                                         │
//! │  CONFIGURATION            → fix config and restart                     │
//! │  └── InvalidConfig / InvalidUrl / ConfigLoadFailed / ConfigSaveFailed  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use harbor_core::CoreError;
use harbor_db::DbError;

use crate::remote::RemoteError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// What callers of the adapter and the sync passes see.
///
/// Direct (non-drain) calls propagate the underlying store error unchanged
/// through the `Local` and `Remote` variants.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Local store failure.
    #[error("Local store error: {0}")]
    Local(#[from] DbError),

    /// Remote store failure.
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// Schema or queue decode failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Free-form statements were sent to the remote store.
    ///
    /// The remote store only accepts structured table operations. Reaching
    /// this is a bug in the caller.
    #[error("Free-form queries are not supported by the remote store: {0}")]
    RemoteQueryUnsupported(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid remote or realtime URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Failed to serialize or deserialize a record.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if a later drain pass may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_transient())
    }

    /// Returns true if the selected store could not be reached at all.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, SyncError::Local(e) if e.is_unavailable())
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
