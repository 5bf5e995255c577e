//! # Database Pool Management
//!
//! Connection pool creation, startup bookkeeping and corruption recovery.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Startup                                   │
//! │                                                                         │
//! │  DbConfig::new(path) ← Configure pool settings                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::open_with_recovery(config)                                  │
//! │       │                                                                 │
//! │       ├── Database::new(config)                                        │
//! │       │     ├── connect (WAL, synchronous=NORMAL, foreign keys)        │
//! │       │     ├── run migrations                                         │
//! │       │     ├── sync schema fingerprint → schema_version               │
//! │       │     ├── cache_version mismatch? clear cached catalog           │
//! │       │     └── write health sentinel                                  │
//! │       │                                                                 │
//! │       ├── check_health(): sentinel read + PRAGMA quick_check           │
//! │       │     └── ok ──────────────────────────────► Healthy             │
//! │       │                                                                 │
//! │       └── failed: close, delete db / -wal / -shm, Database::new        │
//! │             └── ok ──────────────────────────────► Recreated           │
//! │             └── err ─────────────────────────────► DbError (reload)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL (Write-Ahead Logging) mode is enabled so that cache reads from
//! the UI side never wait on the worker's bulk writes.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::customers::CustomerRepository;
use crate::repository::drafts::DraftRepository;
use crate::repository::item_prices::ItemPriceRepository;
use crate::repository::items::ItemRepository;
use crate::repository::payment_methods::PaymentMethodRepository;
use crate::repository::queue::QueueRepository;
use crate::repository::settings::{keys, SettingsRepository};
use crate::repository::stock::StockRepository;
use crate::CACHE_VERSION;
use tally_core::CacheStats;

/// Path that selects an in-memory database.
const IN_MEMORY_PATH: &str = ":memory:";

/// Catalog tables dropped on cache invalidation.
const CATALOG_TABLES: [&str; 6] = [
    "item_barcodes",
    "items",
    "customers",
    "item_prices",
    "stock",
    "payment_methods",
];

/// Settings that describe the store itself and survive a settings wipe.
const INTERNAL_SETTINGS: [&str; 4] = [
    keys::HEALTH_CHECK,
    keys::SCHEMA_HASH,
    keys::SCHEMA_VERSION,
    keys::CACHE_VERSION,
];

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/tally.db")
///     .max_connections(5)
///     .min_connections(1);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 5
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection timeout duration.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection.
    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a new database configuration with the given path.
    ///
    /// ## Arguments
    /// * `path` - Path to the SQLite database file. Will be created if it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            max_connections: 1, // In-memory requires single connection
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            run_migrations: true,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path == Path::new(IN_MEMORY_PATH)
    }
}

// =============================================================================
// Recovery & Clearing Options
// =============================================================================

/// How the store was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Existing database passed the health check.
    Healthy,
    /// Database failed the health check and was recreated empty.
    Recreated,
}

/// What `clear_cached_data` keeps. Everything is preserved by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOptions {
    pub preserve_invoices: bool,
    pub preserve_drafts: bool,
    pub preserve_settings: bool,
}

impl Default for ClearOptions {
    fn default() -> Self {
        ClearOptions {
            preserve_invoices: true,
            preserve_drafts: true,
            preserve_settings: true,
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle providing repository access.
///
/// Cheap to clone; every clone shares the same pool.
///
/// ## Usage
/// ```rust,ignore
/// let (db, outcome) = Database::open_with_recovery(DbConfig::new("./tally.db")).await?;
/// let hits = db.items().search("coke", 20).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    /// The SQLite connection pool.
    pool: SqlitePool,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures SQLite (WAL, NORMAL synchronous, foreign keys)
    /// 3. Creates the connection pool
    /// 4. Runs migrations and startup bookkeeping (if enabled)
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing database connection"
        );

        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        debug!("Connection options configured");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Database pool created"
        );

        let db = Database { pool };

        if config.run_migrations {
            db.run_migrations().await?;
            migrations::sync_schema_version(&db.pool).await?;
            db.ensure_cache_version().await?;
            db.write_health_sentinel().await?;
        }

        Ok(db)
    }

    /// Opens the store, recreating it from scratch if the health check fails.
    ///
    /// ## Returns
    /// * `Ok((db, Healthy))` - Existing database is usable
    /// * `Ok((db, Recreated))` - Database was deleted and rebuilt empty
    /// * `Err(DbError)` - Recreation failed too; the user must reload
    pub async fn open_with_recovery(config: DbConfig) -> DbResult<(Self, RecoveryOutcome)> {
        match Database::new(config.clone()).await {
            Ok(db) if db.check_health().await => return Ok((db, RecoveryOutcome::Healthy)),
            Ok(db) => {
                warn!("Database failed health check, recreating");
                db.close().await;
            }
            Err(e) => {
                warn!(error = %e, "Database failed to open, recreating");
            }
        }

        if !config.is_in_memory() {
            remove_database_files(&config.database_path).await?;
        }

        match Database::new(config).await {
            Ok(db) => {
                info!("Database recreated");
                Ok((db, RecoveryOutcome::Recreated))
            }
            Err(e) => {
                error!(error = %e, "Database recreation failed");
                Err(e)
            }
        }
    }

    /// Runs database migrations.
    ///
    /// ## When To Call
    /// - Automatically called by `new()` if `run_migrations` is true
    /// - Manually call when migrations are disabled in config
    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await?;
        info!("Migrations complete");
        Ok(())
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    pub fn items(&self) -> ItemRepository {
        ItemRepository::new(self.pool.clone())
    }

    pub fn customers(&self) -> CustomerRepository {
        CustomerRepository::new(self.pool.clone())
    }

    pub fn settings(&self) -> SettingsRepository {
        SettingsRepository::new(self.pool.clone())
    }

    /// Offline invoice queue.
    pub fn invoice_queue(&self) -> QueueRepository {
        QueueRepository::invoices(self.pool.clone())
    }

    /// Offline payment queue.
    pub fn payment_queue(&self) -> QueueRepository {
        QueueRepository::payments(self.pool.clone())
    }

    pub fn stock(&self) -> StockRepository {
        StockRepository::new(self.pool.clone())
    }

    pub fn item_prices(&self) -> ItemPriceRepository {
        ItemPriceRepository::new(self.pool.clone())
    }

    pub fn payment_methods(&self) -> PaymentMethodRepository {
        PaymentMethodRepository::new(self.pool.clone())
    }

    pub fn drafts(&self) -> DraftRepository {
        DraftRepository::new(self.pool.clone())
    }

    // =========================================================================
    // Health & Lifecycle
    // =========================================================================

    /// Closes the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks if the database is healthy.
    ///
    /// Reads the sentinel setting written at startup and runs
    /// `PRAGMA quick_check`.
    pub async fn check_health(&self) -> bool {
        let sentinel: DbResult<Option<String>> = self.settings().get(keys::HEALTH_CHECK).await;
        match sentinel {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("Health sentinel missing");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Health sentinel unreadable");
                return false;
            }
        }

        let check: Result<String, sqlx::Error> = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await;
        match check {
            Ok(result) if result == "ok" => true,
            Ok(result) => {
                warn!(result = %result, "quick_check reported problems");
                false
            }
            Err(e) => {
                warn!(error = %e, "quick_check failed");
                false
            }
        }
    }

    async fn write_health_sentinel(&self) -> DbResult<()> {
        self.settings()
            .set(keys::HEALTH_CHECK, &Utc::now().to_rfc3339())
            .await
    }

    /// Clears cached catalog data when the stored cache version differs.
    ///
    /// Returns true if the cache was cleared.
    pub async fn ensure_cache_version(&self) -> DbResult<bool> {
        let settings = self.settings();
        let stored: Option<u32> = settings.get(keys::CACHE_VERSION).await?;
        if stored == Some(CACHE_VERSION) {
            return Ok(false);
        }

        if let Some(old) = stored {
            info!(old, new = CACHE_VERSION, "Cache version changed, clearing catalog");
        }
        self.clear_cached_data(ClearOptions::default()).await?;
        settings.set(keys::CACHE_VERSION, &CACHE_VERSION).await?;
        Ok(stored.is_some())
    }

    /// Clears the cached catalog, and optionally queues, drafts and settings.
    ///
    /// Store bookkeeping settings (sentinel, schema and cache versions) are
    /// always kept.
    pub async fn clear_cached_data(&self, options: ClearOptions) -> DbResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        for table in CATALOG_TABLES {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        if !options.preserve_invoices {
            sqlx::query("DELETE FROM invoice_queue").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM payment_queue").execute(&mut *tx).await?;
        }
        if !options.preserve_drafts {
            sqlx::query("DELETE FROM drafts").execute(&mut *tx).await?;
        }
        if !options.preserve_settings {
            sqlx::query("DELETE FROM settings WHERE key NOT IN (?1, ?2, ?3, ?4)")
                .bind(INTERNAL_SETTINGS[0])
                .bind(INTERNAL_SETTINGS[1])
                .bind(INTERNAL_SETTINGS[2])
                .bind(INTERNAL_SETTINGS[3])
                .execute(&mut *tx)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        info!(?options, "Cached data cleared");
        Ok(())
    }

    /// Clears every table, then restores the store bookkeeping.
    pub async fn nuke(&self) -> DbResult<()> {
        self.clear_cached_data(ClearOptions {
            preserve_invoices: false,
            preserve_drafts: false,
            preserve_settings: false,
        })
        .await?;
        sqlx::query("DELETE FROM settings").execute(&self.pool).await?;

        migrations::sync_schema_version(&self.pool).await?;
        self.settings()
            .set(keys::CACHE_VERSION, &CACHE_VERSION)
            .await?;
        self.write_health_sentinel().await?;
        warn!("All local data deleted");
        Ok(())
    }

    /// Item, customer and queue counts plus the last catalog sync.
    pub async fn cache_stats(&self) -> DbResult<CacheStats> {
        let item_count = self.items().count().await?;
        Ok(CacheStats {
            item_count,
            customer_count: self.customers().count().await?,
            queued_invoice_count: self.invoice_queue().count_unsynced().await?,
            cache_ready: item_count > 0,
            last_sync: self.settings().get(keys::ITEMS_LAST_SYNC).await?,
        })
    }
}

/// Deletes the database file and its WAL/SHM siblings. Missing files are fine.
async fn remove_database_files(path: &Path) -> DbResult<()> {
    let mut paths = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut sibling = path.as_os_str().to_owned();
        sibling.push(suffix);
        paths.push(PathBuf::from(sibling));
    }

    for file in paths {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => debug!(path = %file.display(), "Removed database file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
