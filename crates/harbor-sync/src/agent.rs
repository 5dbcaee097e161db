//! # Sync Agent
//!
//! Main orchestrator for the sync engine. Assembles the stores, the
//! connectivity monitor, the adapter and the realtime listener from a
//! [`SyncConfig`] and owns their background tasks.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             SyncAgent                                   │
//! │                                                                         │
//! │  ┌──────────────┐  events   ┌──────────────────────────────────────┐   │
//! │  │ Connectivity │ ────────► │ reconnect trigger → adapter.sync()   │   │
//! │  │ Monitor      │           └──────────────────────────────────────┘   │
//! │  │ (probe loop) │           ┌──────────────────────────────────────┐   │
//! │  └──────────────┘           │ periodic drain (every 30s, online)   │   │
//! │                             └──────────────────────────────────────┘   │
//! │  ┌──────────────┐           ┌──────────────┐     ┌────────────────┐   │
//! │  │ LocalHost    │ ◄──────── │ Database     │ ──► │ RemoteStore    │   │
//! │  │ (SQLite)     │  client   │ Adapter      │     │ (REST / memory)│   │
//! │  └──────────────┘           └──────────────┘     └────────────────┘   │
//! │         ▲                                                               │
//! │         │ upsert / delete   ┌──────────────┐     ┌────────────────┐   │
//! │         └────────────────── │ Realtime     │ ◄── │ ChangeFeed     │   │
//! │                             │ Listener     │     │ (ws / memory)  │   │
//! │                             └──────────────┘     └────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use harbor_core::{ConnectivityStatus, QueueStatus, RuntimeContext, StoreMode};
use harbor_db::{Database, DbConfig, LocalHost, LocalHostHandle, LocalStoreClient};

use crate::adapter::{AdapterSettings, DatabaseAdapter};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, MonitorConfig};
use crate::error::{SyncError, SyncResult};
use crate::events::EventHub;
use crate::inbound::RealtimeListener;
use crate::remote::realtime::RealtimeConfig;
use crate::remote::{ChangeFeed, MemoryRemote, RealtimeFeed, RemoteStore, RestRemote};

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot of the engine for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub context: RuntimeContext,
    /// What callers see (forced Online on desktop).
    pub status: ConnectivityStatus,
    /// Last probe of the remote store.
    pub remote_status: ConnectivityStatus,
    /// Store the next call would use.
    pub store: StoreMode,
    pub queue: QueueStatus,
    pub realtime_active: bool,
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Owns every sync component and its background tasks.
pub struct SyncAgent {
    config: SyncConfig,
    adapter: Arc<DatabaseAdapter>,
    monitor: ConnectivityMonitor,
    events: EventHub,
    listener: Option<RealtimeListener>,
    realtime: Option<RealtimeFeed>,
    host: Option<LocalHostHandle>,
    database: Option<Database>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncAgent {
    pub fn adapter(&self) -> &Arc<DatabaseAdapter> {
        &self.adapter
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        let realtime_active = match &self.listener {
            Some(listener) => listener.is_active().await,
            None => false,
        };

        Ok(SyncStatus {
            context: self.adapter.context(),
            status: self.monitor.status(),
            remote_status: self.monitor.remote_status(),
            store: self.adapter.select_store(),
            queue: self.adapter.queue_status().await?,
            realtime_active,
        })
    }

    /// Starts the background work: reconnect trigger, first probe, probe
    /// loop, periodic drain and the realtime listener.
    ///
    /// The trigger is subscribed before the first probe so that an initially
    /// reachable remote store starts a sync right away.
    pub async fn start(&mut self) -> SyncResult<()> {
        if !self.tasks.is_empty() {
            return Ok(());
        }

        info!(
            context = %self.adapter.context(),
            store = %self.adapter.select_store(),
            "Starting sync agent"
        );

        if self.adapter.has_local_store() {
            self.tasks.push(
                self.adapter
                    .spawn_reconnect_trigger(self.config.sync.pull_on_reconnect),
            );
        }

        self.monitor.check_now().await;
        self.monitor.start();

        if self.adapter.has_local_store() {
            if let Some(interval) = self.config.drain_interval() {
                self.tasks.push(self.adapter.spawn_periodic_drain(interval));
            }
        }

        if let Some(listener) = &self.listener {
            if let Err(e) = listener.initialize().await {
                warn!(error = %e, "Realtime listener failed to start; relying on pull");
            }
        }

        info!("Sync agent started");
        Ok(())
    }

    /// Stops every task and closes the stores.
    pub async fn shutdown(mut self) {
        info!("Shutting down sync agent");

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.monitor.stop();

        if let Some(listener) = &self.listener {
            listener.destroy().await;
        }
        if let Some(feed) = &self.realtime {
            feed.close().await;
        }
        if let Some(host) = self.host.take() {
            host.shutdown().await;
        }
        if let Some(database) = self.database.take() {
            database.close().await;
        }

        info!("Sync agent stopped");
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a [`SyncAgent`] with injected collaborators.
pub struct SyncAgentBuilder {
    config: SyncConfig,
    remote: Option<Arc<dyn RemoteStore>>,
    feed: Option<Arc<dyn ChangeFeed>>,
    local: Option<LocalStoreClient>,
    database: Option<DbConfig>,
}

impl SyncAgentBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            remote: None,
            feed: None,
            local: None,
            database: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Uses one in-memory store as both remote store and change feed.
    pub fn with_memory_remote(self, remote: MemoryRemote) -> Self {
        let feed: Arc<dyn ChangeFeed> = Arc::new(remote.clone());
        self.with_remote(Arc::new(remote)).with_change_feed(feed)
    }

    /// Uses an already running local store host.
    pub fn with_local_store(mut self, client: LocalStoreClient) -> Self {
        self.local = Some(client);
        self
    }

    /// Opens this database instead of the configured path.
    pub fn with_database_config(mut self, config: DbConfig) -> Self {
        self.database = Some(config);
        self
    }

    /// Opens the stores and wires the components. Nothing runs until
    /// [`SyncAgent::start`].
    pub async fn build(self) -> SyncResult<SyncAgent> {
        let config = self.config;
        config.validate()?;
        let context = config.runtime_context();

        let remote: Arc<dyn RemoteStore> = match self.remote {
            Some(remote) => remote,
            None => {
                let url = config.remote.url.as_deref().ok_or_else(|| {
                    SyncError::InvalidConfig("remote.url is required".into())
                })?;
                Arc::new(RestRemote::new(
                    url,
                    config.remote.api_key.clone(),
                    config.request_timeout(),
                )?)
            }
        };

        let mut host = None;
        let mut database = None;
        let local = if !context.has_local_store() {
            LocalStoreClient::unavailable()
        } else if let Some(client) = self.local {
            client
        } else {
            let db_config = self
                .database
                .unwrap_or_else(|| DbConfig::new(config.database_path()));
            let db = Database::new(db_config).await?;
            let (handle, client) = LocalHost::spawn(&db).await?;
            host = Some(handle);
            database = Some(db);
            client
        };

        let monitor = ConnectivityMonitor::new(
            context,
            Some(remote.clone()),
            MonitorConfig {
                probe_interval: config.probe_interval(),
                probe_timeout: config.probe_timeout(),
            },
        );
        let events = EventHub::new();

        let adapter = Arc::new(DatabaseAdapter::new(
            context,
            local.clone(),
            remote,
            monitor.clone(),
            events.clone(),
            AdapterSettings::from(&config),
        ));
        adapter.set_forced_mode(config.context.force_store);

        let mut realtime = None;
        let feed: Option<Arc<dyn ChangeFeed>> =
            if !config.sync.realtime_enabled || !context.has_local_store() {
                None
            } else if let Some(feed) = self.feed {
                Some(feed)
            } else if let Some(url) = config.realtime_url() {
                let feed = RealtimeFeed::spawn(RealtimeConfig {
                    url,
                    api_key: config.remote.api_key.clone(),
                    ..Default::default()
                })?;
                realtime = Some(feed.clone());
                Some(Arc::new(feed))
            } else {
                warn!("No realtime URL configured; remote changes arrive only through pull");
                None
            };

        let listener =
            feed.map(|feed| RealtimeListener::new(context, local, feed, events.clone()));

        Ok(SyncAgent {
            config,
            adapter,
            monitor,
            events,
            listener,
            realtime,
            host,
            database,
            tasks: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_requires_remote_url() {
        let result = SyncAgentBuilder::new(SyncConfig::default()).build().await;
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_desktop_agent_lifecycle() {
        let remote = MemoryRemote::new();
        let mut agent = SyncAgentBuilder::new(SyncConfig::default())
            .with_memory_remote(remote)
            .with_database_config(DbConfig::in_memory())
            .build()
            .await
            .unwrap();

        agent.start().await.unwrap();
        let status = agent.status().await.unwrap();
        assert_eq!(status.context, RuntimeContext::Desktop);
        assert_eq!(status.store, StoreMode::Local);
        assert_eq!(status.remote_status, ConnectivityStatus::Online);
        assert!(status.realtime_active);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_browser_agent_has_no_local_store() {
        let mut config = SyncConfig::default();
        config.context.mode = RuntimeContext::Browser;

        let agent = SyncAgentBuilder::new(config)
            .with_memory_remote(MemoryRemote::new())
            .build()
            .await
            .unwrap();

        assert!(!agent.adapter().has_local_store());
        assert_eq!(agent.adapter().select_store(), StoreMode::Remote);
        assert_eq!(agent.status().await.unwrap().queue, QueueStatus::default());
        agent.shutdown().await;
    }
}
