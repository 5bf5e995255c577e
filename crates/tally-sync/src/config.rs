//! # Sync Configuration
//!
//! Configuration management for the background worker and its clients.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_BACKEND_URL=https://erp.example.com                          │
//! │     TALLY_POS_PROFILE="Main POS"                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/pos/sync.toml (Linux)                                    │
//! │     ~/Library/Application Support/com.tally.pos/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     30 s ping, 60 s stock refresh, 3 retries, 7 day retention          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [backend]
//! base_url = "https://erp.example.com"
//! api_key = "abc"
//! api_secret = "xyz"
//!
//! [profile]
//! pos_profile = "Main POS"
//! warehouse = "Stores - T"
//!
//! [worker]
//! ping_interval_secs = 30
//! stock_refresh_interval_secs = 60
//!
//! [queue]
//! max_retries = 3
//! retention_days = 7
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Backend
// =============================================================================

/// Where the backend lives and how to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Site root, e.g. `https://erp.example.com`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key for token auth. Sent as `token key:secret`.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub api_secret: Option<String>,

    /// Per-request HTTP timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            base_url: default_base_url(),
            api_key: None,
            api_secret: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// POS Profile
// =============================================================================

/// The POS profile this terminal sells under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSettings {
    #[serde(default)]
    pub pos_profile: Option<String>,

    /// Warehouse stock is tracked and refreshed for.
    #[serde(default)]
    pub warehouse: Option<String>,

    #[serde(default)]
    pub company: Option<String>,

    #[serde(default)]
    pub price_list: Option<String>,

    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub default_customer: Option<String>,
}

// =============================================================================
// Worker
// =============================================================================

/// Background worker timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Interval between liveness probes (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Hard timeout on a single probe (seconds).
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// How long a caller waits for a reply envelope (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Interval between periodic stock refreshes (seconds). 0 disables.
    #[serde(default = "default_stock_refresh_interval")]
    pub stock_refresh_interval_secs: u64,

    /// Hard timeout on one stock refresh fetch (seconds).
    #[serde(default = "default_stock_refresh_timeout")]
    pub stock_refresh_timeout_secs: u64,

    /// Start in manual offline mode.
    #[serde(default)]
    pub manual_offline: bool,
}

fn default_ping_interval() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    3
}

fn default_stock_refresh_interval() -> u64 {
    60
}

fn default_stock_refresh_timeout() -> u64 {
    10
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            request_timeout_secs: default_request_timeout(),
            stock_refresh_interval_secs: default_stock_refresh_interval(),
            stock_refresh_timeout_secs: default_stock_refresh_timeout(),
            manual_offline: false,
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Progressive catalog loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    /// Size of the page fetched to refresh the visible grid.
    #[serde(default = "default_first_page_size")]
    pub first_page_size: u32,

    /// Size of each background page.
    #[serde(default = "default_catalog_batch_size")]
    pub batch_size: u32,

    /// Pause between background pages (milliseconds).
    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,

    /// Background paging starts when the cache holds fewer items than this.
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: i64,

    /// Progress is reported every N batches.
    #[serde(default = "default_stats_every")]
    pub stats_every_batches: u32,

    /// A full preload is due when the last one is older than this.
    #[serde(default = "default_preload_max_age")]
    pub preload_max_age_hours: u64,
}

fn default_first_page_size() -> u32 {
    50
}

fn default_catalog_batch_size() -> u32 {
    200
}

fn default_batch_interval() -> u64 {
    2000
}

fn default_low_water_mark() -> i64 {
    100
}

fn default_stats_every() -> u32 {
    5
}

fn default_preload_max_age() -> u64 {
    24
}

impl Default for CatalogSettings {
    fn default() -> Self {
        CatalogSettings {
            first_page_size: default_first_page_size(),
            batch_size: default_catalog_batch_size(),
            batch_interval_ms: default_batch_interval(),
            low_water_mark: default_low_water_mark(),
            stats_every_batches: default_stats_every(),
            preload_max_age_hours: default_preload_max_age(),
        }
    }
}

// =============================================================================
// Realtime
// =============================================================================

/// Batching of `pos_stock_update` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    /// Window a batch stays open after its first event (milliseconds).
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,

    /// A batch holding this many distinct keys is flushed immediately.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_batch_delay() -> u64 {
    500
}

fn default_max_batch_size() -> usize {
    100
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        RealtimeSettings {
            batch_delay_ms: default_batch_delay(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

// =============================================================================
// Offline Queue
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Failed attempts before an entry is quarantined.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Synced entries older than this are purged (days).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Age passed to `cleanup_old_drafts` when a cart is cleared (hours).
    #[serde(default = "default_draft_cleanup_age")]
    pub draft_cleanup_max_age_hours: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    7
}

fn default_draft_cleanup_age() -> u32 {
    1
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_retries: default_max_retries(),
            retention_days: default_retention_days(),
            draft_cleanup_max_age_hours: default_draft_cleanup_age(),
        }
    }
}

// =============================================================================
// Search
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Keystroke debounce (milliseconds).
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Page size for server-side search.
    #[serde(default = "default_server_limit")]
    pub server_limit: u32,

    /// Rows returned from the local cache.
    #[serde(default = "default_cache_limit")]
    pub cache_limit: u32,
}

fn default_debounce() -> u64 {
    300
}

fn default_server_limit() -> u32 {
    500
}

fn default_cache_limit() -> u32 {
    50
}

impl Default for SearchSettings {
    fn default() -> Self {
        SearchSettings {
            debounce_ms: default_debounce(),
            server_limit: default_server_limit(),
            cache_limit: default_cache_limit(),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Cache file. Defaults to `<data dir>/tally.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete worker configuration.
///
/// Every section is optional in the file; missing keys take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub profile: ProfileSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub catalog: CatalogSettings,

    #[serde(default)]
    pub realtime: RealtimeSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub search: SearchSettings,

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
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let url = url::Url::parse(&self.backend.base_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {}",
                self.backend.base_url
            )));
        }

        if self.catalog.first_page_size == 0 || self.catalog.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "catalog page and batch sizes must be greater than 0".into(),
            ));
        }

        if self.realtime.max_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "realtime max_batch_size must be greater than 0".into(),
            ));
        }

        if self.worker.ping_timeout_secs >= self.worker.ping_interval_secs {
            return Err(SyncError::InvalidConfig(format!(
                "ping_timeout_secs ({}) must be less than ping_interval_secs ({})",
                self.worker.ping_timeout_secs, self.worker.ping_interval_secs
            )));
        }

        if self.queue.max_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "queue max_retries must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("TALLY_BACKEND_URL") {
            debug!(url = %url, "Overriding backend URL from environment");
            self.backend.base_url = url;
        }

        if let Some(key) = var("TALLY_API_KEY") {
            self.backend.api_key = Some(key);
        }

        if let Some(secret) = var("TALLY_API_SECRET") {
            self.backend.api_secret = Some(secret);
        }

        if let Some(profile) = var("TALLY_POS_PROFILE") {
            debug!(profile = %profile, "Overriding POS profile from environment");
            self.profile.pos_profile = Some(profile);
        }

        if let Some(warehouse) = var("TALLY_WAREHOUSE") {
            self.profile.warehouse = Some(warehouse);
        }

        if let Some(flag) = var("TALLY_MANUAL_OFFLINE") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.worker.manual_offline = true,
                "0" | "false" | "no" | "off" => self.worker.manual_offline = false,
                _ => warn!(value = %flag, "Unknown TALLY_MANUAL_OFFLINE value"),
            }
        }

        if let Some(secs) = var("TALLY_STOCK_REFRESH_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.worker.stock_refresh_interval_secs = s,
                Err(_) => warn!(value = %secs, "Invalid TALLY_STOCK_REFRESH_SECS"),
            }
        }

        if let Some(path) = var("TALLY_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Cache database path, falling back to the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "tally", "pos")
                .map(|dirs| dirs.data_dir().join("tally.db"))
                .unwrap_or_else(|| PathBuf::from("tally.db"))
        })
    }

    pub fn pos_profile(&self) -> Option<&str> {
        self.profile.pos_profile.as_deref()
    }

    pub fn warehouse(&self) -> Option<&str> {
        self.profile.warehouse.as_deref()
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.worker.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.ping_timeout_secs)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.request_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    /// `None` when periodic refresh is disabled.
    pub fn stock_refresh_interval(&self) -> Option<Duration> {
        (self.worker.stock_refresh_interval_secs > 0)
            .then(|| Duration::from_secs(self.worker.stock_refresh_interval_secs))
    }

    pub fn stock_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.stock_refresh_timeout_secs)
    }

    pub fn catalog_batch_interval(&self) -> Duration {
        Duration::from_millis(self.catalog.batch_interval_ms)
    }

    pub fn realtime_batch_delay(&self) -> Duration {
        Duration::from_millis(self.realtime.batch_delay_ms)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.worker.ping_interval_secs, 30);
        assert_eq!(config.worker.ping_timeout_secs, 3);
        assert_eq!(config.catalog.first_page_size, 50);
        assert_eq!(config.catalog.batch_size, 200);
        assert_eq!(config.realtime.batch_delay_ms, 500);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.retention_days, 7);
        assert_eq!(config.search.debounce_ms, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.backend.base_url = "ws://localhost:8000".into();
        assert!(config.validate().unwrap_err().is_config_error());

        config.backend.base_url = "not a url".into();
        assert!(config.validate().is_err());

        config.backend.base_url = "https://erp.example.com".into();
        assert!(config.validate().is_ok());

        config.worker.ping_timeout_secs = 30;
        assert!(config.validate().is_err());
        config.worker.ping_timeout_secs = 3;

        config.catalog.batch_size = 0;
        assert!(config.validate().is_err());
        config.catalog.batch_size = 200;

        config.queue.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TALLY_BACKEND_URL", "https://pos.example.com"),
            ("TALLY_POS_PROFILE", "Front Desk"),
            ("TALLY_WAREHOUSE", "Stores - T"),
            ("TALLY_MANUAL_OFFLINE", "true"),
            ("TALLY_STOCK_REFRESH_SECS", "0"),
            ("TALLY_DB_PATH", "/tmp/t.db"),
        ]);

        let mut config = SyncConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.backend.base_url, "https://pos.example.com");
        assert_eq!(config.pos_profile(), Some("Front Desk"));
        assert_eq!(config.warehouse(), Some("Stores - T"));
        assert!(config.worker.manual_offline);
        assert_eq!(config.stock_refresh_interval(), None);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/t.db"));
    }

    #[test]
    fn test_partial_toml() {
        let config: SyncConfig = toml::from_str(
            r#"
            [backend]
            base_url = "https://erp.example.com"

            [queue]
            retention_days = 14
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.retention_days, 14);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.worker.ping_interval_secs, 30);
    }

    #[test]
    fn test_toml_serialization() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[backend]"));
        assert!(toml_str.contains("[queue]"));
    }
}
