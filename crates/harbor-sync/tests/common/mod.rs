//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use harbor_db::{Database, DbConfig, LocalHost, LocalHostHandle, LocalStoreClient};
use harbor_sync::{
    AdapterSettings, ConnectivityMonitor, ConnectivityStatus, DatabaseAdapter, EventHub,
    MemoryRemote, MonitorConfig, Record, RuntimeContext,
};

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("fixture must be a JSON object")
}

pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        probe_interval: Duration::from_secs(60),
        probe_timeout: Duration::from_millis(100),
    }
}

/// A desktop adapter over an in-memory SQLite file and an in-memory remote.
pub struct Desktop {
    pub adapter: Arc<DatabaseAdapter>,
    pub local: LocalStoreClient,
    pub remote: MemoryRemote,
    pub monitor: ConnectivityMonitor,
    pub events: EventHub,
    host: LocalHostHandle,
    db: Database,
}

impl Desktop {
    pub async fn new() -> Self {
        Self::with_settings(AdapterSettings::default()).await
    }

    pub async fn with_settings(settings: AdapterSettings) -> Self {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (host, local) = LocalHost::spawn(&db).await.unwrap();
        let remote = MemoryRemote::new();
        let monitor = ConnectivityMonitor::new(
            RuntimeContext::Desktop,
            Some(Arc::new(remote.clone())),
            monitor_config(),
        );
        let events = EventHub::new();
        let adapter = Arc::new(DatabaseAdapter::new(
            RuntimeContext::Desktop,
            local.clone(),
            Arc::new(remote.clone()),
            monitor.clone(),
            events.clone(),
            settings,
        ));

        Desktop {
            adapter,
            local,
            remote,
            monitor,
            events,
            host,
            db,
        }
    }

    pub async fn go_online(&self) {
        self.remote.set_online(true);
        assert_eq!(self.monitor.check_now().await, ConnectivityStatus::Online);
    }

    pub async fn go_offline(&self) {
        self.remote.set_online(false);
        assert_eq!(self.monitor.check_now().await, ConnectivityStatus::Offline);
    }

    /// Raw queue rows in insertion order.
    pub async fn queue_rows(&self) -> Vec<Record> {
        self.local
            .query("SELECT * FROM sync_queue ORDER BY rowid", vec![])
            .await
            .unwrap()
    }

    pub async fn close(self) {
        self.host.shutdown().await;
        self.db.close().await;
    }
}

/// A browser adapter: no local store, every call goes to the remote.
pub fn browser(remote: &MemoryRemote) -> DatabaseAdapter {
    let monitor = ConnectivityMonitor::new(
        RuntimeContext::Browser,
        Some(Arc::new(remote.clone())),
        monitor_config(),
    );
    DatabaseAdapter::new(
        RuntimeContext::Browser,
        LocalStoreClient::unavailable(),
        Arc::new(remote.clone()),
        monitor,
        EventHub::new(),
        AdapterSettings::default(),
    )
}
