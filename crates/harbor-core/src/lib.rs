//! # harbor-core: Pure Types for the Harbor Sync Engine
//!
//! This crate holds the data model shared by both stores and the engine that
//! reconciles them. It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Harbor POS Sync Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │         Callers (products, sales, registers, users, ...)        │   │
//! │  │        query / insert / update / delete / get_by_id / get_all   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            harbor-sync (adapter, drain, pull, realtime)         │   │
//! │  └──────────────┬──────────────────────────────────┬───────────────┘   │
//! │                 │                                  │                    │
//! │  ┌──────────────▼──────────────┐   ┌───────────────▼───────────────┐   │
//! │  │   harbor-db (local SQLite)  │   │   remote store (REST + feed)  │   │
//! │  └──────────────┬──────────────┘   └───────────────┬───────────────┘   │
//! │                 └───────────────┬──────────────────┘                    │
//! │  ┌──────────────────────────────▼──────────────────────────────────┐   │
//! │  │               ★ harbor-core (THIS CRATE) ★                      │   │
//! │  │    Record • SyncQueueEntry • SyncTable • TableSchema • Field     │   │
//! │  │           NO I/O • NO DATABASE • NO NETWORK                     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, queue entries, connectivity and context enums
//! - [`schema`] - Typed per-table descriptors and local ⇄ remote translation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use harbor_core::{SyncTable, TranslateMode};
//! use serde_json::json;
//!
//! let local = json!({ "id": "p-1", "name": "Cola", "price": 2.5 });
//! let local = local.as_object().unwrap();
//!
//! let remote = SyncTable::Products.schema().to_remote(local, TranslateMode::Partial);
//! assert_eq!(remote["sale_price"], json!(2.5));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod schema;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult};
pub use schema::{DefaultValue, Field, FieldKind, SyncTable, TableSchema, TranslateMode};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum queue entries replayed in one drain pass.
pub const DEFAULT_BATCH_SIZE: i64 = 50;

/// Attempts after which a queue entry stops being retried.
///
/// The entry stays in the queue and is reported as failed until an operator
/// runs cleanup.
pub const MAX_SYNC_ATTEMPTS: i64 = 5;

/// Days a synced queue entry is kept before cleanup removes it.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;
