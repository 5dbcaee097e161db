//! # Repository Module
//!
//! Repositories built on the [`LocalStoreClient`](crate::client::LocalStoreClient),
//! so they work from any task on the caller side of the boundary.
//!
//! ## Available Repositories
//!
//! - [`SyncQueueRepository`] - The operation log (sync queue)

pub mod sync_queue;

pub use sync_queue::{CleanupReport, SyncQueueRepository};
