//! # tally-sync: Background Sync Worker for Tally POS
//!
//! Everything that talks to the backend or runs on a timer: the worker that
//! owns the local cache, the offline invoice queue, stock reconciliation and
//! the invoice session that ties the cart to all of them.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Worker Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncWorker (single task, sole writer)            │  │
//! │  │                                                                  │  │
//! │  │  Request ──► correlation id ──► Envelope { Ok | WorkerFailure }  │  │
//! │  │  Timers: liveness ping, optional stock refresh                  │  │
//! │  └──────────────┬───────────────────┬───────────────────┬───────────┘  │
//! │                 ▼                   ▼                   ▼              │
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌──────────────────┐  │
//! │  │  OfflineQueue      │  │  StockReconciler   │  │  CatalogLoader   │  │
//! │  │                    │  │                    │  │                  │  │
//! │  │  Two-phase replay  │  │  server - reserved │  │  First page now, │  │
//! │  │  Bounded retries   │  │  Realtime batcher  │  │  rest in batches │  │
//! │  │  Quarantine        │  │  Generation guard  │  │  Debounced search│  │
//! │  └────────────────────┘  └────────────────────┘  └──────────────────┘  │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  InvoiceSession: cart edits → reservations, offers, submit      │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  EVENTS (broadcast): Ready, ServerStatusChanged, QueueDrained,         │
//! │  CatalogProgress, CatalogComplete, StockApplied                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`backend`] - Backend method API (`PosBackend`) and its HTTP client
//! - [`catalog`] - Progressive catalog load and debounced item search
//! - [`config`] - Sync configuration (TOML)
//! - [`connectivity`] - Online/offline state and the liveness probe
//! - [`error`] - Sync error types
//! - [`invoice`] - Invoice session: cart, offers, two-phase submit
//! - [`normalize`] - Backend response normalization
//! - [`protocol`] - Worker request, reply and event types
//! - [`queue`] - Offline invoice queue and drain
//! - [`stock`] - Stock reconciler and realtime update batcher
//! - [`worker`] - The background worker and its handle
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{HttpBackend, StockReconciler, SyncConfig, SyncWorker};
//! use tally_db::Database;
//!
//! let config = Arc::new(SyncConfig::load_or_default(None));
//! let backend = Arc::new(HttpBackend::new(&config)?);
//!
//! let (worker, handle) = SyncWorker::new(config.clone(), database, backend.clone());
//! let reconciler = StockReconciler::from_config(backend, &config).with_worker(handle.clone());
//! worker.with_reconciler(reconciler).start();
//!
//! let pending = handle.offline_invoice_count().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backend;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod invoice;
pub mod normalize;
pub mod protocol;
pub mod queue;
pub mod stock;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use backend::{BackendInvoice, HttpBackend, ItemDetailsQuery, ItemGroup, ItemQuery, PosBackend};
pub use catalog::{CatalogLoad, CatalogLoader, ItemSearch};
pub use config::SyncConfig;
pub use connectivity::Connectivity;
pub use error::{BackendError, SyncError, SyncResult};
pub use invoice::{InvoiceSession, SubmitOutcome, SubmitRetry};
pub use protocol::{FailureKind, Request, WorkerEvent, WorkerFailure, WorkerReply};
pub use queue::{DrainReport, OfflineQueue};
pub use stock::{StockBatcher, StockBatcherHandle, StockReconciler};
pub use worker::{SyncWorker, WorkerHandle};
