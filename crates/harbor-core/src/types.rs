//! # Domain Types
//!
//! Core types shared by the local store, the remote client and the adapter.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Record       │   │ SyncQueueEntry  │   │  QueueStatus    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  JSON object    │   │  operation      │   │  pending        │       │
//! │  │  column → value │   │  table_name     │   │  synced         │       │
//! │  │                 │   │  record_id      │   │  failed         │       │
//! │  └─────────────────┘   │  data, attempts │   └─────────────────┘       │
//! │                        └─────────────────┘                              │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ Connectivity    │   │ RuntimeContext  │   │   StoreMode     │       │
//! │  │  Online         │   │  Desktop        │   │   Local         │       │
//! │  │  Offline        │   │  Browser        │   │   Remote        │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::schema::SyncTable;

/// A row as seen on either side of the boundary: column name → JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Sync Operation
// =============================================================================

/// The kind of mutation recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Insert,
    Update,
    Delete,
}

impl SyncOperation {
    /// Returns the value stored in the `operation` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Insert => "insert",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }

    /// Returns true if entries of this kind carry a payload snapshot.
    pub fn carries_payload(&self) -> bool {
        !matches!(self, SyncOperation::Delete)
    }
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncOperation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "insert" | "create" => Ok(SyncOperation::Insert),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Sync Queue Entry
// =============================================================================

/// An entry in the operation log (the sync queue).
///
/// ## Lifecycle
/// ```text
///   local write ──► Pending(attempts=0)
///                      │
///          drain ok ◄──┴──► drain failed: attempts += 1, last_error = ..
///             │                     │
///             ▼                     ▼
///   Synced(synced_at) ◄── ... Pending(attempts < ceiling) ──► Exhausted
///   (immutable)                                  (kept for inspection)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncQueueEntry {
    pub id: String,
    pub operation: SyncOperation,
    /// Local table name of the mutated record.
    pub table_name: String,
    /// Primary key value of the mutated record.
    pub record_id: String,
    /// JSON snapshot of the record (absent for deletes).
    pub data: Option<String>,
    pub synced: bool,
    pub attempts: i64,
    pub last_error: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl SyncQueueEntry {
    /// Resolves the typed table this entry belongs to.
    pub fn table(&self) -> CoreResult<SyncTable> {
        self.table_name.parse()
    }

    /// Decodes the payload snapshot.
    ///
    /// Deletes have no payload and yield an empty record.
    pub fn payload(&self) -> CoreResult<Record> {
        match (&self.data, self.operation.carries_payload()) {
            (Some(data), _) => serde_json::from_str(data).map_err(|e| CoreError::InvalidPayload {
                id: self.id.clone(),
                reason: e.to_string(),
            }),
            (None, false) => Ok(Record::new()),
            (None, true) => Err(CoreError::MissingPayload {
                id: self.id.clone(),
            }),
        }
    }

    /// Returns true once the entry has used up its retry budget.
    pub fn is_exhausted(&self, max_attempts: i64) -> bool {
        !self.synced && self.attempts >= max_attempts
    }
}

// =============================================================================
// Queue Status
// =============================================================================

/// Counts reported by the status query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueueStatus {
    /// Pending entries still eligible for a drain pass.
    pub pending: i64,
    /// Entries confirmed at the remote store.
    pub synced: i64,
    /// Pending entries past the retry ceiling.
    pub failed: i64,
}

// =============================================================================
// Connectivity / Context / Store Mode
// =============================================================================

/// Reachability of the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Online,
    #[default]
    Offline,
}

impl ConnectivityStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityStatus::Online)
    }
}

impl std::fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityStatus::Online => write!(f, "online"),
            ConnectivityStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Where this process runs.
///
/// The desktop context has a privileged process owning the local SQLite file;
/// the browser context has no local store at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeContext {
    #[default]
    Desktop,
    Browser,
}

impl RuntimeContext {
    /// Returns true if a local store can exist in this context.
    pub fn has_local_store(&self) -> bool {
        matches!(self, RuntimeContext::Desktop)
    }
}

impl std::fmt::Display for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeContext::Desktop => write!(f, "desktop"),
            RuntimeContext::Browser => write!(f, "browser"),
        }
    }
}

impl std::str::FromStr for RuntimeContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desktop" | "electron" | "native" => Ok(RuntimeContext::Desktop),
            "browser" | "web" => Ok(RuntimeContext::Browser),
            other => Err(format!(
                "Unknown runtime context: '{}'. Valid options: desktop, browser",
                other
            )),
        }
    }
}

/// Which physical store backs a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Local,
    Remote,
}

impl std::fmt::Display for StoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreMode::Local => write!(f, "local"),
            StoreMode::Remote => write!(f, "remote"),
        }
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Formats a timestamp the way both stores persist it.
///
/// Fixed-width RFC 3339 with millisecond precision and a `Z` suffix, so
/// lexical order equals chronological order in SQL comparisons.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The current time, formatted with [`format_timestamp`].
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parses timestamps written by either store.
///
/// Accepts RFC 3339 and the naive `YYYY-MM-DD HH:MM:SS` form SQLite's
/// `datetime('now')` produces (read as UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(operation: SyncOperation, data: Option<&str>) -> SyncQueueEntry {
        SyncQueueEntry {
            id: "q-1".to_string(),
            operation,
            table_name: "products".to_string(),
            record_id: "p-1".to_string(),
            data: data.map(str::to_string),
            synced: false,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            synced_at: None,
        }
    }

    #[test]
    fn test_operation_parsing() {
        assert_eq!("INSERT".parse::<SyncOperation>().unwrap(), SyncOperation::Insert);
        assert_eq!("update".parse::<SyncOperation>().unwrap(), SyncOperation::Update);
        assert_eq!("Delete".parse::<SyncOperation>().unwrap(), SyncOperation::Delete);
        assert!("upsert".parse::<SyncOperation>().is_err());
    }

    #[test]
    fn test_payload_decoding() {
        let insert = entry(SyncOperation::Insert, Some(r#"{"id":"p-1","name":"Cola"}"#));
        let payload = insert.payload().unwrap();
        assert_eq!(payload["name"], "Cola");

        let delete = entry(SyncOperation::Delete, None);
        assert!(delete.payload().unwrap().is_empty());

        let broken = entry(SyncOperation::Update, None);
        assert!(matches!(broken.payload(), Err(CoreError::MissingPayload { .. })));
    }

    #[test]
    fn test_exhaustion() {
        let mut e = entry(SyncOperation::Insert, Some("{}"));
        e.attempts = 4;
        assert!(!e.is_exhausted(5));
        e.attempts = 5;
        assert!(e.is_exhausted(5));
        e.synced = true;
        assert!(!e.is_exhausted(5));
    }

    #[test]
    fn test_timestamp_formats() {
        let rfc = parse_timestamp("2026-03-01T10:00:00.000Z").unwrap();
        let sqlite = parse_timestamp("2026-03-01 10:00:00").unwrap();
        let offset = parse_timestamp("2026-03-01T12:00:00+02:00").unwrap();
        assert_eq!(rfc, sqlite);
        assert_eq!(rfc, offset);
        assert!(parse_timestamp("yesterday").is_none());

        let formatted = format_timestamp(rfc);
        assert_eq!(formatted, "2026-03-01T10:00:00.000Z");
    }

    #[test]
    fn test_context_parsing() {
        assert_eq!("desktop".parse::<RuntimeContext>().unwrap(), RuntimeContext::Desktop);
        assert_eq!("WEB".parse::<RuntimeContext>().unwrap(), RuntimeContext::Browser);
        assert!(RuntimeContext::Desktop.has_local_store());
        assert!(!RuntimeContext::Browser.has_local_store());
        assert!("tablet".parse::<RuntimeContext>().is_err());
    }
}
