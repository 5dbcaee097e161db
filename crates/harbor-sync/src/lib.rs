//! # harbor-sync: Dual-Store Sync Engine for Harbor POS
//!
//! This crate lets the POS run against an embedded SQLite store on desktop
//! terminals and a hosted remote store in the browser, and keeps the two
//! converged.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncAgent (Main Orchestrator)               │  │
//! │  │                                                                  │  │
//! │  │  Built from SyncConfig, owns every background task              │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ DatabaseAdapter│  │ Connectivity   │  │  RealtimeListener      │    │
//! │  │                │  │ Monitor        │  │                        │    │
//! │  │ Routes calls   │  │ Probes remote  │  │ Mirrors remote changes │    │
//! │  │ Queues local   │  │ Online/Offline │  │ into SQLite            │    │
//! │  │ writes         │  │ transitions    │  │                        │    │
//! │  └───────┬────────┘  └────────────────┘  └────────────────────────┘    │
//! │          │                                                              │
//! │          ├──► OutboxDrainer: replays sync_queue against the remote      │
//! │          └──► Puller: copies newer remote rows into SQLite              │
//! │                                                                         │
//! │  NOTIFICATIONS (EventHub):                                             │
//! │  • TableChange  - a remote change was applied locally                  │
//! │  • SyncActivity - drain / pull / cleanup / connectivity progress       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - Main `SyncAgent` orchestrator and builder
//! - [`adapter`] - The persistence contract and store selection
//! - [`config`] - Sync configuration (TOML file + environment)
//! - [`connectivity`] - Remote reachability monitor
//! - [`outbox`] - Sync queue drain
//! - [`pull`] - Remote to local reconciliation
//! - [`inbound`] - Realtime change application
//! - [`events`] - Change and activity notifications
//! - [`remote`] - Remote store clients (REST, websocket feed, in-memory)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harbor_sync::{SyncAgentBuilder, SyncConfig, SyncTable};
//!
//! let config = SyncConfig::load_or_default(None);
//! let mut agent = SyncAgentBuilder::new(config).build().await?;
//! agent.start().await?;
//!
//! let id = agent.adapter().insert(SyncTable::Customers, &customer).await?;
//! let status = agent.status().await?;
//! println!("Pending: {}", status.queue.pending);
//!
//! agent.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod adapter;
pub mod agent;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod inbound;
pub mod outbox;
pub mod pull;
pub mod remote;

// =============================================================================
// Re-exports
// =============================================================================

pub use adapter::{AdapterSettings, DatabaseAdapter, SyncReport};
pub use agent::{SyncAgent, SyncAgentBuilder, SyncStatus};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, MonitorConfig, Subscription};
pub use error::{SyncError, SyncResult};
pub use events::{EventHub, SyncActivity, TableChange, TableSubscription};
pub use inbound::{apply_change, RealtimeListener};
pub use outbox::{DrainReport, DrainSkip, OutboxDrainer};
pub use pull::{PullReport, Puller, TablePull};
pub use remote::realtime::{ConnectionState, RealtimeConfig};
pub use remote::{
    ChangeEvent, ChangeFeed, ChangeKind, MemoryRemote, RealtimeFeed, RemoteError, RemoteStore,
    RestRemote,
};

pub use harbor_core::{
    ConnectivityStatus, QueueStatus, Record, RuntimeContext, StoreMode, SyncOperation,
    SyncQueueEntry, SyncTable,
};
