//! # Database Migrations
//!
//! Embedded SQL migrations for Tally POS, plus schema fingerprint tracking.
//!
//! ## How Migrations Work
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Migration Process                                  │
//! │                                                                         │
//! │  App Startup                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Check _sqlx_migrations table                                          │
//! │       │                                                                 │
//! │       ├── Table doesn't exist? Create it                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Compare embedded migrations vs applied                                │
//! │       │                                                                 │
//! │       ├── 001_initial_schema.sql ✓ (already applied)                  │
//! │       └── 002_next_change.sql    ⬜ (NEW - needs to run)               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Run pending migrations in order                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Record in _sqlx_migrations                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Fingerprint embedded set ≠ settings.schema_hash?                      │
//! │       └── yes: schema_version += 1, store new hash                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  App continues startup                                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/sqlite/` with the next sequence number
//! 2. Name format: `NNN_description.sql` (e.g., `004_add_customer_table.sql`)
//! 3. Write idempotent SQL (use `IF NOT EXISTS` where possible)
//! 4. **NEVER** modify existing migrations - always add new ones
//! 5. The schema fingerprint changes automatically with the new file

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;
use crate::repository::settings::{keys, SettingsRepository};

/// Embedded migrations from the `migrations/sqlite` directory.
///
/// ## How This Works
/// The `sqlx::migrate!()` macro embeds all SQL files from the specified
/// directory into the binary at compile time. No runtime file access needed.
///
/// ## Directory Structure
/// ```text
/// migrations/sqlite/
/// ├── 001_initial_schema.sql  # Catalog, queues, settings, drafts
/// └── ...
/// ```
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations.
///
/// ## What This Does
/// - Creates `_sqlx_migrations` table if not exists
/// - Compares embedded migrations with applied migrations
/// - Runs any pending migrations in order
/// - Records each migration's checksum and timestamp
///
/// ## Safety
/// - Idempotent: safe to run multiple times
/// - Transactional: each migration runs in a transaction
/// - Ordered: migrations run in filename order (001, 002, ...)
///
/// ## Example
/// ```rust,ignore
/// run_migrations(&pool).await?;
/// ```
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// Returns information about migrations.
///
/// ## Returns
/// Tuple of (total_migrations, applied_migrations)
///
/// ## Usage
/// For diagnostics and health checks.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    // Query applied migrations
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    Ok((total, applied as usize))
}

// =============================================================================
// Schema Fingerprint
// =============================================================================

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Content hash of the embedded migration set (versions and checksums).
pub fn schema_fingerprint() -> String {
    let mut hash = FNV_OFFSET;
    for migration in MIGRATOR.migrations.iter() {
        let version = migration.version.to_le_bytes();
        for byte in version.iter().chain(migration.checksum.iter()) {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    format!("{hash:016x}")
}

/// Recorded schema state after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaState {
    pub version: u32,
    pub fingerprint: String,
    /// The fingerprint differed from the stored one.
    pub changed: bool,
}

/// Compares the embedded schema with the stored fingerprint and bumps
/// `schema_version` when it changed.
pub async fn sync_schema_version(pool: &SqlitePool) -> DbResult<SchemaState> {
    let settings = SettingsRepository::new(pool.clone());
    let fingerprint = schema_fingerprint();

    let stored: Option<String> = settings.get(keys::SCHEMA_HASH).await?;
    let mut version: u32 = settings.get(keys::SCHEMA_VERSION).await?.unwrap_or(0);
    let changed = stored.as_deref() != Some(fingerprint.as_str());

    if changed {
        version += 1;
        settings.set(keys::SCHEMA_VERSION, &version).await?;
        settings.set(keys::SCHEMA_HASH, &fingerprint).await?;
        info!(version, fingerprint = %fingerprint, "Schema change detected, version bumped");
    }

    Ok(SchemaState {
        version,
        fingerprint,
        changed,
    })
}
