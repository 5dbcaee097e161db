//! # harbor-db: Local Store for Harbor POS
//!
//! This crate provides the desktop terminal's embedded SQLite store and the
//! message boundary every local call crosses.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Harbor Local Data Flow                           │
//! │                                                                         │
//! │  DatabaseAdapter (harbor-sync)                                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     harbor-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │ LocalStore    │    │  LocalHost    │    │  Database    │  │   │
//! │  │   │ Client        │───►│  (one task)   │───►│  (pool.rs)   │  │   │
//! │  │   │ query / run   │ mpsc owns the conn │    │  migrations  │  │   │
//! │  │   │ batch / tx    │◄───│  oneshot reply│    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │           ▲                                                     │   │
//! │  │   SyncQueueRepository (operation log)                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/com.harbor.pos/harbor.db                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`host`] - The privileged task that owns the connection
//! - [`client`] - The message-passing client and statement builders
//! - [`value`] - JSON ⇄ SQLite value conversion
//! - [`repository`] - Sync queue repository
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harbor_db::{Database, DbConfig, LocalHost, SyncQueueRepository};
//!
//! let db = Database::new(DbConfig::new("path/to/harbor.db")).await?;
//! let (host, client) = LocalHost::spawn(&db).await?;
//!
//! let products = client.get_all("products").await?;
//! let status = SyncQueueRepository::new(client.clone()).status(5).await?;
//!
//! host.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod client;
pub mod error;
pub mod host;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod value;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{LocalStoreClient, RunResult, Statement};
pub use error::{DbError, DbResult};
pub use host::{LocalHost, LocalHostHandle, LocalRequest, DEFAULT_REQUEST_TIMEOUT};
pub use pool::{Database, DbConfig};
pub use repository::{CleanupReport, SyncQueueRepository};
