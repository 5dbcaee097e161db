//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Load Order                             │
//! │                                                                         │
//! │  1. Defaults          batch 50, ceiling 5, probe 5s / 3s, drain 30s    │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  2. sync.toml         ProjectDirs("com", "harbor", "pos")/sync.toml    │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  3. Environment       HARBOR_CONTEXT, HARBOR_REMOTE_URL, ...           │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  4. validate()        URL schemes, positive sizes, probe timing        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [context]
//! mode = "desktop"  # desktop | browser
//!
//! [remote]
//! url = "https://project.example.co"
//! api_key = "anon-key"
//! realtime_url = "wss://project.example.co"
//!
//! [connectivity]
//! probe_interval_secs = 5
//! probe_timeout_ms = 3000
//!
//! [sync]
//! batch_size = 50
//! max_attempts = 5
//! drain_interval_secs = 30
//!
//! [database]
//! path = "/var/lib/harbor/harbor.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use harbor_core::{RuntimeContext, StoreMode};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Context
// =============================================================================

/// Where this process runs and which store backs its calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Desktop (local store present) or browser (remote only).
    #[serde(default)]
    pub mode: RuntimeContext,

    /// Pins every call to one store. Meant for tests and diagnostics.
    #[serde(default)]
    pub force_store: Option<StoreMode>,
}

// =============================================================================
// Remote Store
// =============================================================================

/// Where the hosted store lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the table API (`https://...`).
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL of the change feed (`wss://...`). Derived from `url` when
    /// unset.
    #[serde(default)]
    pub realtime_url: Option<String>,

    /// Timeout for every table request (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            url: None,
            api_key: None,
            realtime_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Connectivity
// =============================================================================

/// Reachability probe timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// A probe slower than this counts as offline.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_probe_interval() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    3000
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        ConnectivityConfig {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Reconciliation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Queue entries replayed per drain pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Attempts after which an entry is left alone.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Days synced entries are kept before cleanup removes them.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Drain while online every N seconds. 0 disables the periodic drain.
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,

    /// Mirror remote changes into the local store as they happen.
    #[serde(default = "default_true")]
    pub realtime_enabled: bool,

    /// Run a full sync (drain + pull) on every reconnect instead of a drain.
    #[serde(default = "default_true")]
    pub pull_on_reconnect: bool,
}

fn default_batch_size() -> u32 {
    harbor_core::DEFAULT_BATCH_SIZE as u32
}
fn default_max_attempts() -> u32 {
    harbor_core::MAX_SYNC_ATTEMPTS as u32
}
fn default_retention_days() -> u32 {
    harbor_core::DEFAULT_RETENTION_DAYS as u32
}
fn default_drain_interval() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retention_days: default_retention_days(),
            drain_interval_secs: default_drain_interval(),
            realtime_enabled: true,
            pull_on_reconnect: true,
        }
    }
}

// =============================================================================
// Database
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(ref url) = self.remote.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SyncError::InvalidUrl(format!(
                    "Remote URL must start with http:// or https://, got: {}",
                    url
                )));
            }
        }

        if let Some(ref url) = self.remote.realtime_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(SyncError::InvalidUrl(format!(
                    "Realtime URL must start with ws:// or wss://, got: {}",
                    url
                )));
            }
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.connectivity.probe_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "probe_interval_secs must be greater than 0".into(),
            ));
        }

        if self.connectivity.probe_timeout_ms >= self.connectivity.probe_interval_secs * 1000 {
            return Err(SyncError::InvalidConfig(format!(
                "probe_timeout_ms ({}) must be shorter than the probe interval ({}s)",
                self.connectivity.probe_timeout_ms, self.connectivity.probe_interval_secs
            )));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(mode) = var("HARBOR_CONTEXT") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(context = %mode, "Overriding runtime context from environment");
                    self.context.mode = parsed;
                }
                Err(e) => warn!(error = %e, "Ignoring HARBOR_CONTEXT"),
            }
        }

        if let Some(url) = var("HARBOR_REMOTE_URL") {
            debug!(url = %url, "Overriding remote URL from environment");
            self.remote.url = Some(url);
        }

        if let Some(key) = var("HARBOR_API_KEY") {
            self.remote.api_key = Some(key);
        }

        if let Some(url) = var("HARBOR_REALTIME_URL") {
            self.remote.realtime_url = Some(url);
        }

        if let Some(path) = var("HARBOR_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }

        if let Some(size) = var("HARBOR_BATCH_SIZE") {
            if let Ok(n) = size.parse::<u32>() {
                self.sync.batch_size = n;
            }
        }

        if let Some(max) = var("HARBOR_MAX_ATTEMPTS") {
            if let Ok(n) = max.parse::<u32>() {
                self.sync.max_attempts = n;
            }
        }

        if let Some(secs) = var("HARBOR_PROBE_INTERVAL_SECS") {
            if let Ok(n) = secs.parse::<u64>() {
                self.connectivity.probe_interval_secs = n;
            }
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "harbor", "pos")
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn runtime_context(&self) -> RuntimeContext {
        self.context.mode
    }

    /// The SQLite file to open.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("harbor.db")))
            .unwrap_or_else(|| PathBuf::from("harbor.db"))
    }

    /// The change feed URL: configured, or the remote URL with a ws scheme.
    pub fn realtime_url(&self) -> Option<String> {
        if let Some(url) = &self.remote.realtime_url {
            return Some(url.clone());
        }
        let url = self.remote.url.as_deref()?;
        if let Some(rest) = url.strip_prefix("https://") {
            Some(format!("wss://{rest}"))
        } else {
            url.strip_prefix("http://").map(|rest| format!("ws://{rest}"))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity.probe_timeout_ms)
    }

    /// `None` when the periodic drain is disabled.
    pub fn drain_interval(&self) -> Option<Duration> {
        match self.sync.drain_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn batch_size(&self) -> i64 {
        i64::from(self.sync.batch_size)
    }

    pub fn max_attempts(&self) -> i64 {
        i64::from(self.sync.max_attempts)
    }

    pub fn retention_days(&self) -> i64 {
        i64::from(self.sync.retention_days)
    }
}
