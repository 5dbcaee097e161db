//! # Connectivity Monitor
//!
//! Tracks whether the remote store is reachable and tells subscribers when
//! that changes.
//!
//! ## Status per Context
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  DESKTOP (local store present)                                         │
//! │  ─────────────────────────────                                         │
//! │  status()         → always Online: local work never waits on network   │
//! │  remote_status()  → probe result, drives drain triggers                │
//! │                                                                         │
//! │  BROWSER (remote only)                                                 │
//! │  ─────────────────────                                                 │
//! │  status()         → platform signal AND probe result                   │
//! │  remote_status()  → same                                               │
//! │                                                                         │
//! │  Probe: remote.ping() bounded by probe_timeout                         │
//! │         every probe_interval + on each platform "online" event         │
//! │         error or timeout → Offline, never surfaced to callers          │
//! │                                                                         │
//! │  Every remote_status transition is broadcast as a ConnectivityEvent.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use harbor_core::{ConnectivityStatus, RuntimeContext};

use crate::remote::RemoteStore;

/// Buffered connectivity events per subscriber.
const EVENT_BUFFER: usize = 32;

/// One status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    pub previous: ConnectivityStatus,
    pub current: ConnectivityStatus,
    pub at: DateTime<Utc>,
}

impl ConnectivityEvent {
    /// Returns true for an Offline → Online transition.
    pub fn came_online(&self) -> bool {
        !self.previous.is_online() && self.current.is_online()
    }
}

/// Probe timing.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

struct MonitorInner {
    context: RuntimeContext,
    remote: Option<Arc<dyn RemoteStore>>,
    config: MonitorConfig,
    remote_status: RwLock<ConnectivityStatus>,
    platform_online: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorInner {
    fn remote_status(&self) -> ConnectivityStatus {
        *self
            .remote_status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a new status and broadcasts it if it changed.
    fn transition(&self, next: ConnectivityStatus) {
        let previous = {
            let mut status = self
                .remote_status
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *status, next)
        };

        if previous == next {
            return;
        }

        info!(from = %previous, to = %next, "Remote connectivity changed");
        let _ = self.events.send(ConnectivityEvent {
            previous,
            current: next,
            at: Utc::now(),
        });
    }

    async fn probe(&self) -> ConnectivityStatus {
        let status = match &self.remote {
            None => ConnectivityStatus::Offline,
            Some(_) if !self.platform_online.load(Ordering::SeqCst) => ConnectivityStatus::Offline,
            Some(remote) => match tokio::time::timeout(self.config.probe_timeout, remote.ping()).await {
                Ok(Ok(())) => ConnectivityStatus::Online,
                Ok(Err(e)) => {
                    debug!(error = %e, "Connectivity probe failed");
                    ConnectivityStatus::Offline
                }
                Err(_) => {
                    debug!(timeout = ?self.config.probe_timeout, "Connectivity probe timed out");
                    ConnectivityStatus::Offline
                }
            },
        };

        self.transition(status);
        status
    }
}

/// Cancels an [`ConnectivityMonitor::on_change`] callback when dropped.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reachability tracker shared by the adapter and its triggers.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("context", &self.inner.context)
            .field("remote_status", &self.remote_status())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Creates a monitor. It starts Offline until the first probe.
    pub fn new(
        context: RuntimeContext,
        remote: Option<Arc<dyn RemoteStore>>,
        config: MonitorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        ConnectivityMonitor {
            inner: Arc::new(MonitorInner {
                context,
                remote,
                config,
                remote_status: RwLock::new(ConnectivityStatus::Offline),
                platform_online: AtomicBool::new(true),
                events,
                probe_task: Mutex::new(None),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Status as seen by callers deciding whether work can proceed.
    pub fn status(&self) -> ConnectivityStatus {
        if self.inner.context.has_local_store() {
            ConnectivityStatus::Online
        } else {
            self.remote_status()
        }
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// Last probe result for the remote store.
    pub fn remote_status(&self) -> ConnectivityStatus {
        self.inner.remote_status()
    }

    pub fn context(&self) -> RuntimeContext {
        self.inner.context
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Calls `callback` on every transition until the returned handle drops.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectivityEvent) + Send + Sync + 'static,
    {
        let mut events = self.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Connectivity subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    // -------------------------------------------------------------------------
    // Probing
    // -------------------------------------------------------------------------

    /// Probes the remote store now and returns the new remote status.
    pub async fn check_now(&self) -> ConnectivityStatus {
        self.inner.probe().await
    }

    /// Feeds the platform's reachability signal.
    ///
    /// Going offline takes effect immediately; going online only schedules a
    /// probe, since the platform signal alone is not trusted.
    pub async fn set_platform_online(&self, online: bool) {
        self.inner.platform_online.store(online, Ordering::SeqCst);
        if online {
            self.check_now().await;
        } else {
            self.inner.transition(ConnectivityStatus::Offline);
        }
    }

    /// Starts the periodic probe. Calling it again is a no-op.
    pub fn start(&self) {
        let mut slot = self
            .inner
            .probe_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.probe_interval;
        info!(interval = ?interval, context = %self.inner.context, "Connectivity monitor started");

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.probe().await;
            }
        }));
    }

    /// Stops the periodic probe.
    pub fn stop(&self) {
        let task = self
            .inner
            .probe_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            debug!("Connectivity monitor stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    fn monitor(context: RuntimeContext, remote: &MemoryRemote) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            context,
            Some(Arc::new(remote.clone())),
            MonitorConfig {
                probe_interval: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn test_desktop_status_forced_online() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let monitor = monitor(RuntimeContext::Desktop, &remote);

        assert_eq!(monitor.check_now().await, ConnectivityStatus::Offline);
        assert_eq!(monitor.status(), ConnectivityStatus::Online);
        assert_eq!(monitor.remote_status(), ConnectivityStatus::Offline);
    }

    #[tokio::test]
    async fn test_browser_status_follows_probe() {
        let remote = MemoryRemote::new();
        let monitor = monitor(RuntimeContext::Browser, &remote);
        assert!(!monitor.is_online());

        monitor.check_now().await;
        assert!(monitor.is_online());

        remote.set_online(false);
        monitor.check_now().await;
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_probe_timeout_means_offline() {
        let remote = MemoryRemote::new();
        let monitor = monitor(RuntimeContext::Browser, &remote);
        monitor.check_now().await;
        assert!(monitor.is_online());

        remote.set_latency(Some(Duration::from_millis(500)));
        assert_eq!(monitor.check_now().await, ConnectivityStatus::Offline);
    }

    #[tokio::test]
    async fn test_platform_offline_overrides_probe() {
        let remote = MemoryRemote::new();
        let monitor = monitor(RuntimeContext::Browser, &remote);
        monitor.check_now().await;

        monitor.set_platform_online(false).await;
        assert!(!monitor.is_online());
        assert_eq!(monitor.check_now().await, ConnectivityStatus::Offline);

        monitor.set_platform_online(true).await;
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast_once() {
        let remote = MemoryRemote::new();
        let monitor = monitor(RuntimeContext::Desktop, &remote);
        let mut events = monitor.subscribe();

        monitor.check_now().await;
        monitor.check_now().await;
        remote.set_online(false);
        monitor.check_now().await;

        let first = events.recv().await.unwrap();
        assert!(first.came_online());
        let second = events.recv().await.unwrap();
        assert_eq!(second.current, ConnectivityStatus::Offline);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_on_change_and_periodic_probe() {
        let remote = MemoryRemote::new();
        let monitor = monitor(RuntimeContext::Browser, &remote);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = monitor.on_change(move |event| {
            let _ = tx.send(event.current);
        });

        monitor.start();
        monitor.start();
        let status = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ConnectivityStatus::Online);

        monitor.stop();
        drop(subscription);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_callbacks() {
        let remote = MemoryRemote::new();
        let monitor = monitor(RuntimeContext::Browser, &remote);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = monitor.on_change(move |event| {
            let _ = tx.send(event.current);
        });

        monitor.check_now().await;
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(ConnectivityStatus::Online));

        subscription.unsubscribe();
        remote.set_online(false);
        assert_eq!(monitor.check_now().await, ConnectivityStatus::Offline);

        // The aborted task drops its sender, so the channel closes empty.
        let after = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(after, None);
    }
}
