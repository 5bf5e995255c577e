//! # tally-db: Persistent Store for Tally POS
//!
//! Local SQLite cache of the backend catalog plus the durable offline
//! queues. Uses sqlx for async access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Data Flow                              │
//! │                                                                         │
//! │  Background worker request (SearchItems, SaveInvoice, ...)             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ ItemRepo      │    │ 001_initial  │  │   │
//! │  │   │ SqlitePool    │◄───│ CustomerRepo  │    │ fingerprint  │  │   │
//! │  │   │ Health check  │    │ QueueRepo     │    │ + version    │  │   │
//! │  │   │ Recovery      │    │ StockRepo ... │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/tally/tally.db                                     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, health check, recovery, cache clearing
//! - [`migrations`] - Embedded migrations and schema fingerprint
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations (items, queues, etc.)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let (db, outcome) = Database::open_with_recovery(DbConfig::new("tally.db")).await?;
//!
//! db.items().bulk_put(&items).await?;
//! let hits = db.items().search("coke", 20).await?;
//! let queued = db.invoice_queue().count_unsynced().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use migrations::SchemaState;
pub use pool::{ClearOptions, Database, DbConfig, RecoveryOutcome};

pub use repository::customers::CustomerRepository;
pub use repository::drafts::DraftRepository;
pub use repository::item_prices::ItemPriceRepository;
pub use repository::items::ItemRepository;
pub use repository::payment_methods::PaymentMethodRepository;
pub use repository::queue::QueueRepository;
pub use repository::settings::{keys, SettingsRepository};
pub use repository::stock::{StockMovement, StockRepository};

/// Version of the cached data layout. A stored value that differs causes
/// catalog tables to be cleared on open.
pub const CACHE_VERSION: u32 = 1;
