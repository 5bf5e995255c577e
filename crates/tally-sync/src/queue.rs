//! # Offline Queue
//!
//! Holds completed invoices created while the backend was unreachable and
//! replays them once it is back.
//!
//! ## Drain Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Offline Queue Drain                              │
//! │                                                                         │
//! │  offline? ──yes──► no-op                                               │
//! │     │ no                                                                │
//! │     ▼                                                                   │
//! │  pending() = unsynced AND NOT sync_failed, oldest first                │
//! │     │                                                                   │
//! │     ▼  for each entry                                                   │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ draft_name stored?                                               │  │
//! │  │   no  ──► update_invoice(doc) ──► set_draft_name(id, name)       │  │
//! │  │   yes ──► reuse it (phase 1 never runs twice)                    │  │
//! │  │                                                                  │  │
//! │  │ submit_invoice(name, change_amount)                              │  │
//! │  │   ok   ──► mark_synced(id)                                       │  │
//! │  │   err  ──► record_failure(id, err, max_retries)                  │  │
//! │  │             connectivity error stops the drain                   │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  cleanup_old_entries(retention_days)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only one drain runs at a time. A trigger that arrives mid-drain returns
//! an empty report.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tally_core::{CoreError, InvoiceDocument, OfflineQueueEntry};
use tally_db::{Database, StockMovement};

use crate::backend::PosBackend;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub success: u32,
    pub failed: u32,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.success == 0 && self.failed == 0
    }
}

/// Durable queue of invoices and payments awaiting submission.
#[derive(Clone)]
pub struct OfflineQueue {
    db: Database,
    backend: Arc<dyn PosBackend>,
    config: Arc<SyncConfig>,
    drain_lock: Arc<Mutex<()>>,
}

impl OfflineQueue {
    pub fn new(db: Database, backend: Arc<dyn PosBackend>, config: Arc<SyncConfig>) -> Self {
        OfflineQueue {
            db,
            backend,
            config,
            drain_lock: Arc::new(Mutex::new(())),
        }
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Queues a completed invoice and takes its quantities out of the local
    /// stock ledger. The entry and the decrement commit together.
    pub async fn enqueue(&self, document: InvoiceDocument) -> SyncResult<OfflineQueueEntry> {
        if document.is_empty() {
            return Err(SyncError::Core(CoreError::EmptyInvoice));
        }

        let payload = serde_json::to_value(&document)?;
        let movements = self.movements_for(&document);
        let entry = self
            .db
            .invoice_queue()
            .enqueue_with_movements(&payload, &movements)
            .await?;

        info!(
            id = entry.id,
            lines = document.items.len(),
            grand_total = document.grand_total,
            "Invoice queued offline"
        );
        Ok(entry)
    }

    fn movements_for(&self, document: &InvoiceDocument) -> Vec<StockMovement> {
        let fallback = self.config.warehouse();
        document
            .stock_movements()
            .into_iter()
            .filter_map(|(code, warehouse, qty)| {
                match warehouse.as_deref().or(fallback) {
                    Some(wh) => Some(StockMovement::new(code, wh, qty)),
                    None => {
                        debug!(item_code = %code, "No warehouse for queued line, stock not decremented");
                        None
                    }
                }
            })
            .collect()
    }

    /// Queues a payment for later submission.
    pub async fn save_offline_payment(&self, payment: Value) -> SyncResult<OfflineQueueEntry> {
        let entry = self.db.payment_queue().enqueue(&payment).await?;
        info!(id = entry.id, "Payment queued offline");
        Ok(entry)
    }

    // =========================================================================
    // Queries & User Actions
    // =========================================================================

    /// Every unsynced invoice, quarantined ones included.
    pub async fn get_offline_invoices(&self) -> SyncResult<Vec<OfflineQueueEntry>> {
        Ok(self.db.invoice_queue().unsynced().await?)
    }

    pub async fn count(&self) -> SyncResult<i64> {
        Ok(self.db.invoice_queue().count_unsynced().await?)
    }

    pub async fn delete(&self, id: i64) -> SyncResult<bool> {
        Ok(self.db.invoice_queue().delete(id).await?)
    }

    /// Lifts a quarantine so the next drain picks the entry up again.
    pub async fn retry_failed(&self, id: i64) -> SyncResult<bool> {
        Ok(self.db.invoice_queue().retry_failed(id).await?)
    }

    // =========================================================================
    // Drain
    // =========================================================================

    /// Replays pending invoices. A no-op when offline or when nothing is
    /// pending.
    pub async fn drain(&self, connectivity: &Connectivity) -> SyncResult<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already running, skipping");
            return Ok(DrainReport::default());
        };

        if !connectivity.is_online() {
            debug!("Offline, skipping drain");
            return Ok(DrainReport::default());
        }

        let queue = self.db.invoice_queue();
        let pending = queue.pending().await?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }

        info!(count = pending.len(), "Draining offline invoices");
        let mut report = DrainReport::default();

        for entry in pending {
            match self.replay(&entry).await {
                Ok(name) => {
                    queue.mark_synced(entry.id).await?;
                    report.success += 1;
                    info!(id = entry.id, invoice = %name, "Offline invoice submitted");
                }
                Err(e) => {
                    report.failed += 1;
                    let updated = queue
                        .record_failure(entry.id, &e.to_string(), self.config.queue.max_retries)
                        .await?;
                    warn!(
                        id = entry.id,
                        retries = updated.retry_count,
                        quarantined = updated.sync_failed,
                        error = %e,
                        "Offline invoice failed"
                    );
                    if e.is_connectivity() {
                        warn!("Backend unreachable, stopping drain");
                        break;
                    }
                }
            }
        }

        queue.cleanup_old_entries(self.config.queue.retention_days).await?;

        info!(success = report.success, failed = report.failed, "Drain finished");
        Ok(report)
    }

    /// Runs both submission phases for one entry and returns the backend name.
    async fn replay(&self, entry: &OfflineQueueEntry) -> SyncResult<String> {
        let mut document: InvoiceDocument = serde_json::from_value(entry.payload.clone())
            .map_err(|e| SyncError::SerializationFailed(format!("queued invoice: {e}")))?;

        let name = match &entry.draft_name {
            Some(name) => name.clone(),
            None => {
                let draft = self.backend.update_invoice(&document).await?;
                self.db
                    .invoice_queue()
                    .set_draft_name(entry.id, &draft.name)
                    .await?;
                debug!(id = entry.id, draft = %draft.name, "Draft stored for queued invoice");
                draft.name
            }
        };

        document.name = Some(name);
        let submitted = self
            .backend
            .submit_invoice(&document, document.change_amount)
            .await?;
        Ok(submitted.name)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
