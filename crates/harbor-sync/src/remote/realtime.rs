//! # Realtime Change Feed
//!
//! [`ChangeFeed`] over the remote store's websocket channel protocol.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  DISCONNECTED ──► CONNECTING ──► CONNECTED ──► (lost) ──► BACKOFF       │
//! │        ▲                             │                       │          │
//! │        │                             │ join every routed     │ sleep    │
//! │        │ close()                     │ table, heartbeat      │ 0.5s..60s│
//! │        └─────────────────────────────┴───────────────────────┘          │
//! │                                                                         │
//! │  Frames (JSON, protocol vsn 1.0.0)                                     │
//! │  ─────────────────────────────────                                     │
//! │  → {"topic":"realtime:public:products","event":"phx_join",...}         │
//! │  → {"topic":"phoenix","event":"heartbeat","payload":{},...}            │
//! │  ← {"event":"postgres_changes","payload":{"data":{"type":"UPDATE",     │
//! │       "table":"products","record":{..},"old_record":{..}}}}            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Subscriptions survive reconnects: every table with a live receiver is
//! joined again on each new connection. Changes made while the socket was
//! down are not replayed; the next pull covers them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use harbor_core::Record;

use super::{ChangeEvent, ChangeFeed, ChangeKind, RemoteError, RemoteResult};
use crate::error::{SyncError, SyncResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Protocol version sent in the connect URL.
const PROTOCOL_VSN: &str = "1.0.0";

/// Buffered changes per table before the feed waits on the consumer.
const TABLE_BUFFER: usize = 64;

// =============================================================================
// Connection State
// =============================================================================

/// Websocket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next reconnect attempt.
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Change feed connection settings.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base URL of the realtime endpoint (`wss://project.example.co`).
    pub url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            url: "ws://localhost:54321".into(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RealtimeConfig {
    /// The full websocket URL including api key and protocol version.
    pub fn socket_url(&self) -> SyncResult<Url> {
        let mut url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "Realtime URL must start with ws:// or wss://, got: {}",
                self.url
            )));
        }

        let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
        {
            let mut query = url.query_pairs_mut();
            if let Some(key) = &self.api_key {
                query.append_pair("apikey", key);
            }
            query.append_pair("vsn", PROTOCOL_VSN);
        }
        Ok(url)
    }
}

// =============================================================================
// Frames
// =============================================================================

fn topic(table: &str) -> String {
    format!("realtime:public:{table}")
}

fn join_frame(table: &str, reference: u64) -> String {
    json!({
        "topic": topic(table),
        "event": "phx_join",
        "payload": {
            "config": {
                "postgres_changes": [
                    { "event": "*", "schema": "public", "table": table }
                ]
            }
        },
        "ref": reference.to_string(),
    })
    .to_string()
}

fn leave_frame(table: &str, reference: u64) -> String {
    json!({
        "topic": topic(table),
        "event": "phx_leave",
        "payload": {},
        "ref": reference.to_string(),
    })
    .to_string()
}

fn heartbeat_frame(reference: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: String,
    table: String,
    #[serde(default)]
    record: Option<Record>,
    #[serde(default)]
    old_record: Option<Record>,
}

/// Decodes a change notification. Replies, heartbeats and system frames
/// yield `None`.
fn parse_change(text: &str) -> Option<ChangeEvent> {
    let envelope: Envelope = serde_json::from_str(text).ok()?;
    if envelope.event != "postgres_changes" {
        return None;
    }

    let data: ChangeData = serde_json::from_value(envelope.payload.get("data")?.clone()).ok()?;
    let kind = match data.kind.as_str() {
        "INSERT" => ChangeKind::Created,
        "UPDATE" => ChangeKind::Updated,
        "DELETE" => ChangeKind::Deleted,
        other => {
            debug!(kind = %other, "Ignoring unknown change type");
            return None;
        }
    };

    Some(ChangeEvent {
        table: data.table,
        kind,
        record: data.record.unwrap_or_default(),
        old: data.old_record,
    })
}

// =============================================================================
// Feed Handle
// =============================================================================

enum FeedCommand {
    Join(String),
    Leave(String),
}

type Routes = HashMap<String, mpsc::Sender<ChangeEvent>>;

struct FeedShared {
    routes: Mutex<Routes>,
    state: RwLock<ConnectionState>,
    refs: AtomicU64,
}

impl FeedShared {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_ref(&self) -> u64 {
        self.refs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Tables with a live consumer. Closed routes are dropped.
    fn live_tables(&self) -> Vec<String> {
        let mut routes = self.routes();
        routes.retain(|_, tx| !tx.is_closed());
        routes.keys().cloned().collect()
    }

    /// Hands a change to its table's consumer.
    async fn route(&self, event: ChangeEvent) {
        let sender = self.routes().get(&event.table).cloned();
        match sender {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    trace!("Change consumer went away");
                }
            }
            None => trace!(table = %event.table, "Change for unrouted table"),
        }
    }
}

/// Websocket change feed with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let feed = RealtimeFeed::spawn(RealtimeConfig {
///     url: "wss://project.example.co".into(),
///     api_key: Some(key),
///     ..Default::default()
/// })?;
///
/// let mut products = feed.subscribe("products").await?;
/// while let Some(change) = products.recv().await {
///     println!("{:?} {}", change.kind, change.table);
/// }
/// ```
#[derive(Clone)]
pub struct RealtimeFeed {
    shared: Arc<FeedShared>,
    commands: mpsc::Sender<FeedCommand>,
    shutdown_tx: mpsc::Sender<()>,
}

impl std::fmt::Debug for RealtimeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeFeed").finish_non_exhaustive()
    }
}

impl RealtimeFeed {
    /// Validates the config and spawns the connection task.
    pub fn spawn(config: RealtimeConfig) -> SyncResult<Self> {
        let url = config.socket_url()?;
        let (commands, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let shared = Arc::new(FeedShared {
            routes: Mutex::new(Routes::new()),
            state: RwLock::new(ConnectionState::Disconnected),
            refs: AtomicU64::new(0),
        });

        let connection = Connection {
            config,
            url,
            shared: shared.clone(),
            commands: command_rx,
            shutdown_rx,
        };
        tokio::spawn(connection.run());

        Ok(RealtimeFeed {
            shared,
            commands,
            shutdown_tx,
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Stops the connection task. Every subscription stream ends.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(()).await;
        self.shared.routes().clear();
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, table: &str) -> RemoteResult<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(TABLE_BUFFER);
        self.shared.routes().insert(table.to_string(), tx);

        self.commands
            .send(FeedCommand::Join(table.to_string()))
            .await
            .map_err(|_| RemoteError::Transient("change feed closed".into()))?;

        debug!(table = %table, "Change feed subscription registered");
        Ok(rx)
    }

    async fn unsubscribe(&self, table: &str) -> RemoteResult<()> {
        if self.shared.routes().remove(table).is_none() {
            return Ok(());
        }

        // A closed feed has already left every channel.
        if self
            .commands
            .send(FeedCommand::Leave(table.to_string()))
            .await
            .is_err()
        {
            trace!(table = %table, "Change feed closed before leave");
        }

        debug!(table = %table, "Change feed subscription removed");
        Ok(())
    }
}

// =============================================================================
// Connection Task
// =============================================================================

struct Connection {
    config: RealtimeConfig,
    url: Url,
    shared: Arc<FeedShared>,
    commands: mpsc::Receiver<FeedCommand>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Connection {
    async fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write().await = state;
    }

    async fn run(mut self) {
        info!(url = %self.config.url, "Change feed starting");
        let mut backoff = self.create_backoff();

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                break;
            }

            self.set_state(ConnectionState::Connecting).await;

            match self.connect_with_timeout().await {
                Ok(stream) => {
                    info!("Change feed connected");
                    self.set_state(ConnectionState::Connected).await;
                    backoff.reset();

                    match self.connection_loop(stream).await {
                        Ok(true) => break,
                        Ok(false) => info!("Change feed connection closed by server"),
                        Err(e) => warn!(error = %e, "Change feed connection lost"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Change feed connect failed");
                }
            }

            self.set_state(ConnectionState::Backoff).await;

            let Some(delay) = backoff.next_backoff() else {
                error!("Change feed backoff exhausted");
                break;
            };
            debug!(?delay, "Waiting before change feed reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.recv() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        self.shared.routes().clear();
        info!("Change feed stopped");
    }

    async fn connect_with_timeout(&self) -> RemoteResult<WsStream> {
        match timeout(self.config.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, response))) => {
                debug!(status = ?response.status(), "Websocket handshake complete");
                Ok(stream)
            }
            Ok(Err(e)) => Err(RemoteError::Transient(e.to_string())),
            Err(_) => Err(RemoteError::Transient(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    /// Serves one connection. Returns `Ok(true)` on shutdown.
    async fn connection_loop(&mut self, stream: WsStream) -> RemoteResult<bool> {
        let (mut write, mut read) = stream.split();
        let transport = |e: tokio_tungstenite::tungstenite::Error| RemoteError::Transient(e.to_string());

        for table in self.shared.live_tables() {
            let frame = join_frame(&table, self.shared.next_ref());
            write.send(WsMessage::Text(frame.into())).await.map_err(transport)?;
            debug!(table = %table, "Joined change channel");
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    match command {
                        FeedCommand::Join(table) => {
                            let frame = join_frame(&table, self.shared.next_ref());
                            write.send(WsMessage::Text(frame.into())).await.map_err(transport)?;
                            debug!(table = %table, "Joined change channel");
                        }
                        FeedCommand::Leave(table) => {
                            let frame = leave_frame(&table, self.shared.next_ref());
                            write.send(WsMessage::Text(frame.into())).await.map_err(transport)?;
                            debug!(table = %table, "Left change channel");
                        }
                    }
                }

                message = read.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(event) = parse_change(text.as_str()) {
                                trace!(table = %event.table, kind = ?event.kind, "Change received");
                                self.shared.route(event).await;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            write.send(WsMessage::Pong(data)).await.map_err(transport)?;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!(?frame, "Received close frame");
                            return Ok(false);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(transport(e)),
                        None => return Ok(false),
                    }
                }

                _ = heartbeat.tick() => {
                    let frame = heartbeat_frame(self.shared.next_ref());
                    write.send(WsMessage::Text(frame.into())).await.map_err(transport)?;
                    trace!("Sent heartbeat");
                }

                _ = self.shutdown_rx.recv() => {
                    for table in self.shared.live_tables() {
                        let frame = leave_frame(&table, self.shared.next_ref());
                        let _ = write.send(WsMessage::Text(frame.into())).await;
                    }
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(true);
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url() {
        let config = RealtimeConfig {
            url: "wss://pos.example.co".into(),
            api_key: Some("anon".into()),
            ..Default::default()
        };
        assert_eq!(
            config.socket_url().unwrap().as_str(),
            "wss://pos.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let http = RealtimeConfig {
            url: "https://pos.example.co".into(),
            ..Default::default()
        };
        assert!(http.socket_url().is_err());
    }

    #[test]
    fn test_join_frame() {
        let frame: Value = serde_json::from_str(&join_frame("products", 7)).unwrap();
        assert_eq!(frame["topic"], "realtime:public:products");
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["ref"], "7");
        assert_eq!(
            frame["payload"]["config"]["postgres_changes"][0]["table"],
            "products"
        );
    }

    #[test]
    fn test_parse_update() {
        let text = r#"{
            "topic": "realtime:public:products",
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "UPDATE",
                    "table": "products",
                    "record": { "id": "p-1", "sale_price": 2.5 },
                    "old_record": { "id": "p-1" }
                },
                "ids": [1]
            },
            "ref": null
        }"#;

        let event = parse_change(text).unwrap();
        assert_eq!(event.table, "products");
        assert_eq!(event.kind, ChangeKind::Updated);
        assert_eq!(event.record["sale_price"], json!(2.5));
    }

    #[test]
    fn test_parse_delete_keyed_by_old_record() {
        let text = r#"{"event":"postgres_changes","payload":{"data":{
            "type":"DELETE","table":"categories","old_record":{"id":"c-1"}}}}"#;

        let event = parse_change(text).unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
        assert!(event.record.is_empty());
        assert_eq!(event.keyed_record()["id"], json!("c-1"));
    }

    #[test]
    fn test_ignores_non_change_frames() {
        assert!(parse_change(r#"{"event":"phx_reply","payload":{"status":"ok"}}"#).is_none());
        assert!(parse_change(r#"{"event":"heartbeat","topic":"phoenix"}"#).is_none());
        assert!(parse_change("not json").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_feed_backs_off() {
        let feed = RealtimeFeed::spawn(RealtimeConfig {
            url: "ws://127.0.0.1:1".into(),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();

        let _rx = feed.subscribe("products").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_ne!(feed.state().await, ConnectionState::Connected);
        feed.close().await;
    }

    #[test]
    fn test_leave_frame() {
        let frame: Value = serde_json::from_str(&leave_frame("products", 3)).unwrap();
        assert_eq!(frame["topic"], "realtime:public:products");
        assert_eq!(frame["event"], "phx_leave");
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_route() {
        let feed = RealtimeFeed::spawn(RealtimeConfig {
            url: "ws://127.0.0.1:1".into(),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();

        let mut products = feed.subscribe("products").await.unwrap();
        let _categories = feed.subscribe("categories").await.unwrap();

        feed.unsubscribe("products").await.unwrap();
        feed.unsubscribe("products").await.unwrap();
        assert_eq!(feed.shared.live_tables(), vec!["categories".to_string()]);
        assert!(products.recv().await.is_none());

        feed.close().await;
    }
}
