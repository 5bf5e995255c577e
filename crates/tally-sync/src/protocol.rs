//! # Worker Protocol
//!
//! Messages exchanged between callers and the [`SyncWorker`](crate::worker::SyncWorker).
//!
//! ## Message Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Worker Protocol                                 │
//! │                                                                         │
//! │   Caller (WorkerHandle)                         SyncWorker              │
//! │   ─────────────────────                         ──────────              │
//! │                                                                         │
//! │   pending[id] = oneshot ──── Command{id, Request} ────►                 │
//! │                                                         handle()        │
//! │   pending.remove(id) ◄──── Envelope{id, Result<Reply, Failure>} ────    │
//! │                                                                         │
//! │   subscribe() ◄─────────────── WorkerEvent (broadcast) ────────────    │
//! │                                 Ready, ServerStatusChanged,             │
//! │                                 QueueDrained, CatalogProgress, ...      │
//! │                                                                         │
//! │   No envelope within request_timeout → SyncError::Timeout, entry gone.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything crossing the boundary is owned; nothing is shared mutably.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tally_core::{
    CacheStats, CatalogItem, CoreError, Customer, InvoiceDocument, ItemPrice, LocalDraft,
    OfflineQueueEntry, PaymentMethod, StockUpdate,
};
use tally_db::ClearOptions;

use crate::error::{BackendError, SyncError};
use crate::queue::DrainReport;

// =============================================================================
// Requests
// =============================================================================

/// Everything a caller can ask the worker to do.
#[derive(Debug, Clone)]
pub enum Request {
    // Connectivity
    PingServer,
    CheckOffline { browser_online: bool },
    SetManualOffline { value: bool },
    NetworkChanged { online: bool },

    // Offline queue
    GetInvoiceCount,
    GetInvoices,
    SaveInvoice { invoice: InvoiceDocument },
    DeleteInvoice { id: i64 },
    RetryFailed { id: i64 },
    SyncInvoices,
    SavePayment { payment: Value },

    // Catalog
    SearchItems { term: String, limit: u32 },
    SearchByBarcode { barcode: String },
    SearchCustomers { term: String, limit: u32 },
    CacheItems { items: Vec<CatalogItem> },
    CacheCustomers { customers: Vec<Customer> },
    IsCacheReady,
    GetCacheStats,
    UpdateStockQuantities { updates: Vec<StockUpdate> },
    CacheItemPrices { prices: Vec<ItemPrice> },
    CachePaymentMethods { pos_profile: String, methods: Vec<PaymentMethod> },
    GetPaymentMethods { pos_profile: String },

    // Local drafts
    SaveDraft { draft_id: String, payload: Value },
    ListDrafts,
    TakeDraft { draft_id: String },

    // Maintenance
    ClearCache { options: ClearOptions },
}

impl Request {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::PingServer => "ping_server",
            Request::CheckOffline { .. } => "check_offline",
            Request::SetManualOffline { .. } => "set_manual_offline",
            Request::NetworkChanged { .. } => "network_changed",
            Request::GetInvoiceCount => "get_invoice_count",
            Request::GetInvoices => "get_invoices",
            Request::SaveInvoice { .. } => "save_invoice",
            Request::DeleteInvoice { .. } => "delete_invoice",
            Request::RetryFailed { .. } => "retry_failed",
            Request::SyncInvoices => "sync_invoices",
            Request::SavePayment { .. } => "save_payment",
            Request::SearchItems { .. } => "search_items",
            Request::SearchByBarcode { .. } => "search_by_barcode",
            Request::SearchCustomers { .. } => "search_customers",
            Request::CacheItems { .. } => "cache_items",
            Request::CacheCustomers { .. } => "cache_customers",
            Request::IsCacheReady => "is_cache_ready",
            Request::GetCacheStats => "get_cache_stats",
            Request::UpdateStockQuantities { .. } => "update_stock_quantities",
            Request::CacheItemPrices { .. } => "cache_item_prices",
            Request::CachePaymentMethods { .. } => "cache_payment_methods",
            Request::GetPaymentMethods { .. } => "get_payment_methods",
            Request::SaveDraft { .. } => "save_draft",
            Request::ListDrafts => "list_drafts",
            Request::TakeDraft { .. } => "take_draft",
            Request::ClearCache { .. } => "clear_cache",
        }
    }
}

/// A request tagged with its correlation id.
#[derive(Debug)]
pub struct Command {
    pub id: Uuid,
    pub request: Request,
}

// =============================================================================
// Replies
// =============================================================================

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    /// Liveness probe result.
    ServerOnline(bool),
    /// Combined offline state.
    Offline(bool),
    Ack,
    Count(i64),
    Entries(Vec<OfflineQueueEntry>),
    Queued(OfflineQueueEntry),
    /// Whether the addressed row existed.
    Removed(bool),
    /// Whether a quarantined entry was reset.
    Retried(bool),
    Drained(DrainReport),
    Items(Vec<CatalogItem>),
    Item(Option<CatalogItem>),
    Customers(Vec<Customer>),
    /// Rows written.
    Cached(usize),
    CacheReady(bool),
    Stats(CacheStats),
    PaymentMethods(Vec<PaymentMethod>),
    Draft(LocalDraft),
    Drafts(Vec<LocalDraft>),
    TakenDraft(Option<LocalDraft>),
}

/// Failure categories that survive the trip back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EmptyInvoice,
    Validation,
    Offline,
    CacheNotReady,
    Connectivity,
    Timeout,
    Backend,
    Storage,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::EmptyInvoice => "empty_invoice",
            FailureKind::Validation => "validation",
            FailureKind::Offline => "offline",
            FailureKind::CacheNotReady => "cache_not_ready",
            FailureKind::Connectivity => "connectivity",
            FailureKind::Timeout => "timeout",
            FailureKind::Backend => "backend",
            FailureKind::Storage => "storage",
            FailureKind::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

/// Error half of an envelope. Backend payloads are carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub backend: Option<BackendError>,
}

impl From<&SyncError> for WorkerFailure {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::Core(CoreError::EmptyInvoice) => FailureKind::EmptyInvoice,
            SyncError::Core(_) => FailureKind::Validation,
            SyncError::Offline => FailureKind::Offline,
            SyncError::CacheNotReady => FailureKind::CacheNotReady,
            SyncError::ConnectionFailed(_) => FailureKind::Connectivity,
            SyncError::Timeout { .. } => FailureKind::Timeout,
            SyncError::Backend(_) | SyncError::InvalidResponse(_) => FailureKind::Backend,
            SyncError::Storage(_) => FailureKind::Storage,
            _ => FailureKind::Internal,
        };
        WorkerFailure {
            kind,
            message: err.to_string(),
            backend: err.backend().cloned(),
        }
    }
}

impl From<WorkerFailure> for SyncError {
    fn from(failure: WorkerFailure) -> Self {
        match (failure.kind, failure.backend) {
            (_, Some(backend)) => SyncError::Backend(backend),
            (FailureKind::EmptyInvoice, None) => SyncError::Core(CoreError::EmptyInvoice),
            (FailureKind::Offline, None) => SyncError::Offline,
            (FailureKind::CacheNotReady, None) => SyncError::CacheNotReady,
            (FailureKind::Connectivity, None) => SyncError::ConnectionFailed(failure.message),
            (FailureKind::Timeout, None) => SyncError::Timeout {
                operation: failure.message,
                millis: 0,
            },
            (kind, None) => SyncError::Worker {
                kind: kind.to_string(),
                message: failure.message,
            },
        }
    }
}

/// Reply for one command, keyed by its correlation id.
#[derive(Debug)]
pub struct Envelope {
    pub id: Uuid,
    pub result: Result<WorkerReply, WorkerFailure>,
}

// =============================================================================
// Events
// =============================================================================

/// Unsolicited notifications from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Worker finished startup.
    Ready { server_online: bool },
    /// Liveness probe result changed.
    ServerStatusChanged { server_online: bool },
    /// An offline queue drain finished.
    QueueDrained { success: u32, failed: u32 },
    /// Background catalog paging progress.
    CatalogProgress { cached: i64, batches: u32 },
    /// Background catalog paging reached the end of data.
    CatalogComplete { total: i64 },
    /// A batch of authoritative stock quantities was applied.
    StockApplied { count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_round_trips_payload() {
        let backend = BackendError {
            exc_type: Some("ValidationError".into()),
            server_messages: vec!["Credit limit exceeded".into()],
            http_status: Some(417),
            ..BackendError::new("Credit limit exceeded")
        };
        let failure = WorkerFailure::from(&SyncError::Backend(backend.clone()));
        assert_eq!(failure.kind, FailureKind::Backend);

        match SyncError::from(failure) {
            SyncError::Backend(err) => assert_eq!(err, backend),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failure_kinds_map_back() {
        let empty = WorkerFailure::from(&SyncError::Core(CoreError::EmptyInvoice));
        assert!(matches!(
            SyncError::from(empty),
            SyncError::Core(CoreError::EmptyInvoice)
        ));

        let offline = WorkerFailure::from(&SyncError::Offline);
        assert!(SyncError::from(offline).is_connectivity());

        let storage = WorkerFailure::from(&SyncError::Internal("x".into()));
        assert!(matches!(SyncError::from(storage), SyncError::Worker { .. }));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(WorkerEvent::QueueDrained {
            success: 2,
            failed: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "queue_drained");
        assert_eq!(json["success"], 2);
    }
}
