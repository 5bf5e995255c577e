//! # Invoice Session
//!
//! Binds the pure [`Invoice`] engine to the backend, the stock reconciler
//! and the offline queue.
//!
//! ## Submission
//! ```text
//! submit_or_enqueue()
//!      │
//!      ├── offline ──────────────────────────► worker.save_invoice()
//!      │                                         (local stock decremented)
//!      ▼
//! Phase 1: update_invoice(doc)  ──► draft name stored on the cart
//!      │
//!      ▼
//! Phase 2: submit_invoice(name, change)
//!      │   connectivity error → exponential backoff, same draft name
//!      │   backend error      → returned verbatim, cart kept
//!      ▼
//! cart cleared, reservations released
//! ```
//!
//! Every cart mutation pushes the cart's per-item quantities to the
//! reconciler so display stock follows the cart without a server round trip.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::{
    CartValidationIssue, CatalogItem, CoreError, CouponDiscount, Invoice, InvoiceDocument,
    LocalDraft, OfflineQueueEntry, PaymentEntry, StockUpdate, TaxMode, Totals,
};

use crate::backend::{BackendInvoice, ItemDetailsQuery, PosBackend};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::stock::StockReconciler;
use crate::worker::WorkerHandle;

// =============================================================================
// Submit Retry Policy
// =============================================================================

/// Backoff applied to phase 2 when the backend cannot be reached.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRetry {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total phase-2 attempts, including the first.
    pub max_attempts: u32,
}

impl Default for SubmitRetry {
    fn default() -> Self {
        SubmitRetry {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            max_attempts: 4,
        }
    }
}

impl SubmitRetry {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Where a completed cart ended up.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Submitted(BackendInvoice),
    Queued(OfflineQueueEntry),
}

// =============================================================================
// Invoice Session
// =============================================================================

/// The active cart plus everything it talks to.
pub struct InvoiceSession {
    invoice: Arc<Mutex<Invoice>>,
    /// Bumped on every cart edit. Server pricing computed against an older
    /// revision is discarded.
    revision: Arc<AtomicU64>,
    backend: Arc<dyn PosBackend>,
    reconciler: StockReconciler,
    worker: WorkerHandle,
    config: Arc<SyncConfig>,
    retry: SubmitRetry,
}

impl InvoiceSession {
    pub fn new(
        invoice: Invoice,
        backend: Arc<dyn PosBackend>,
        reconciler: StockReconciler,
        worker: WorkerHandle,
        config: Arc<SyncConfig>,
    ) -> Self {
        InvoiceSession {
            invoice: Arc::new(Mutex::new(invoice)),
            revision: Arc::new(AtomicU64::new(0)),
            backend,
            reconciler,
            worker,
            config,
            retry: SubmitRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: SubmitRetry) -> Self {
        self.retry = retry;
        self
    }

    fn read<R>(&self, f: impl FnOnce(&Invoice) -> R) -> R {
        let invoice = self.invoice.lock().unwrap_or_else(PoisonError::into_inner);
        f(&invoice)
    }

    /// Runs a cart edit and republishes the reservations.
    fn edit<R>(&self, f: impl FnOnce(&mut Invoice) -> R) -> R {
        self.edit_tracked(f).0
    }

    /// Like [`edit`](Self::edit), also returning the revision the edit
    /// produced. The revision is bumped while the lock is held.
    fn edit_tracked<R>(&self, f: impl FnOnce(&mut Invoice) -> R) -> (R, u64) {
        let (result, revision, reservations) = {
            let mut invoice = self.invoice.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut invoice);
            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            (result, revision, invoice.reservations())
        };
        self.reconciler.reserve(reservations);
        (result, revision)
    }

    /// Runs `f` only if no edit landed after `revision`. The comparison and
    /// the edit happen under one lock.
    fn edit_at<R>(&self, revision: u64, f: impl FnOnce(&mut Invoice) -> R) -> Option<R> {
        let (result, reservations) = {
            let mut invoice = self.invoice.lock().unwrap_or_else(PoisonError::into_inner);
            if self.revision.load(Ordering::SeqCst) != revision {
                return None;
            }
            let result = f(&mut invoice);
            self.revision.fetch_add(1, Ordering::SeqCst);
            (result, invoice.reservations())
        };
        self.reconciler.reserve(reservations);
        Some(result)
    }

    // =========================================================================
    // Read Access
    // =========================================================================

    /// A copy of the cart as it is now.
    pub fn snapshot(&self) -> Invoice {
        self.read(Invoice::clone)
    }

    pub fn totals(&self) -> Totals {
        self.read(Invoice::totals)
    }

    pub fn document(&self) -> InvoiceDocument {
        self.read(Invoice::to_document)
    }

    pub fn is_empty(&self) -> bool {
        self.read(Invoice::is_empty)
    }

    pub fn reconciler(&self) -> &StockReconciler {
        &self.reconciler
    }

    // =========================================================================
    // Cart Edits
    // =========================================================================

    pub fn set_customer(&self, customer: Option<String>) {
        self.edit(|inv| inv.set_customer(customer));
    }

    /// Adds an item without a stock check.
    pub fn add_item(&self, item: &CatalogItem, quantity: f64) -> SyncResult<usize> {
        Ok(self.edit(|inv| inv.add_item(item, quantity))?)
    }

    /// Adds an item, rejecting quantities above display stock.
    ///
    /// Items the reconciler has never seen a quantity for are not checked.
    pub fn add_item_checked(&self, item: &CatalogItem, quantity: f64) -> SyncResult<usize> {
        let info = self.reconciler.stock_info(&item.item_code);
        if info.last_update.is_none() {
            return self.add_item(item, quantity);
        }
        Ok(self.edit(|inv| inv.add_item_checked(item, quantity, info.display_qty))?)
    }

    pub fn remove_line(&self, index: usize) -> SyncResult<()> {
        self.edit(|inv| inv.remove_line(index))?;
        Ok(())
    }

    pub fn set_quantity(&self, index: usize, quantity: f64) -> SyncResult<()> {
        Ok(self.edit(|inv| inv.set_quantity(index, quantity))?)
    }

    pub fn set_rate(&self, index: usize, rate: f64) -> SyncResult<()> {
        Ok(self.edit(|inv| inv.set_rate(index, rate))?)
    }

    pub fn set_discount_percentage(&self, index: usize, pct: f64) -> SyncResult<()> {
        Ok(self.edit(|inv| inv.set_discount_percentage(index, pct))?)
    }

    pub fn set_discount_amount(&self, index: usize, amount: f64) -> SyncResult<()> {
        Ok(self.edit(|inv| inv.set_discount_amount(index, amount))?)
    }

    pub fn apply_coupon(&self, coupon: CouponDiscount) -> SyncResult<f64> {
        Ok(self.edit(|inv| inv.apply_coupon(coupon))?)
    }

    pub fn remove_coupon(&self) {
        self.edit(Invoice::remove_coupon);
    }

    pub fn set_additional_discount(&self, amount: f64) -> SyncResult<f64> {
        Ok(self.edit(|inv| inv.set_additional_discount(amount))?)
    }

    pub fn add_payment(&self, payment: PaymentEntry) -> SyncResult<usize> {
        Ok(self.edit(|inv| inv.add_payment(payment))?)
    }

    pub fn remove_payment(&self, index: usize) -> SyncResult<()> {
        self.edit(|inv| inv.remove_payment(index))?;
        Ok(())
    }

    pub fn update_payment(&self, index: usize, amount: f64) -> SyncResult<()> {
        Ok(self.edit(|inv| inv.update_payment(index, amount))?)
    }

    /// Switches a line's UOM using the backend's quote for it.
    pub async fn change_uom(&self, index: usize, uom: &str) -> SyncResult<()> {
        let query = self.read(|inv| {
            let line = inv.line(index).ok_or(CoreError::LineNotFound {
                index,
                len: inv.len(),
            })?;
            Ok::<_, CoreError>(ItemDetailsQuery {
                item_code: line.item_code.clone(),
                pos_profile: inv.pos_profile().unwrap_or_default().to_string(),
                customer: inv.customer().map(str::to_string),
                qty: line.quantity,
                uom: Some(uom.to_string()),
            })
        })?;

        let details = self.backend.get_item_details(&query).await?;
        Ok(self.edit(|inv| inv.set_uom(index, &details))?)
    }

    // =========================================================================
    // Taxes & Server Pricing
    // =========================================================================

    /// Loads the profile's tax template and fixes the tax regime.
    pub async fn load_tax_rules(&self, pos_profile: &str, tax_inclusive: bool) -> SyncResult<usize> {
        let rules = self.backend.get_taxes(pos_profile).await?;
        let count = rules.len();
        self.edit(|inv| {
            inv.set_tax_rules(&rules);
            inv.set_tax_mode(TaxMode::from_inclusive(tax_inclusive));
        });
        debug!(count, tax_inclusive, "Tax rules loaded");
        Ok(count)
    }

    /// Selects an offer and recomputes server pricing.
    ///
    /// A newly selected offer the backend rejects is deselected again. It
    /// stays selected when the backend could not be reached.
    pub async fn apply_offer(&self, code: &str) -> SyncResult<usize> {
        let added = self.edit(|inv| inv.add_offer(code))?;
        if !added {
            debug!(offer = code, "Offer already selected");
        }
        match self.reapply_offers().await {
            Err(e) if added && !e.is_connectivity() => {
                warn!(offer = code, error = %e, "Offer rejected, deselecting");
                self.edit(|inv| inv.remove_offer(code));
                Err(e)
            }
            result => result,
        }
    }

    /// Deselects an offer. Pricing is re-requested for what remains, or all
    /// server discounts are dropped when nothing remains.
    pub async fn remove_offer(&self, code: &str) -> SyncResult<usize> {
        let (removed, remaining) = self.edit(|inv| (inv.remove_offer(code), inv.offers().len()));
        if !removed {
            return Ok(0);
        }
        if remaining == 0 {
            self.edit(Invoice::clear_server_pricing);
            return Ok(0);
        }
        self.reapply_offers().await
    }

    /// Re-runs server pricing for the selected offers after a cart edit.
    ///
    /// Returns the number of lines the server matched. A result computed
    /// against a cart that changed in the meantime is discarded.
    pub async fn reapply_offers(&self) -> SyncResult<usize> {
        let ((document, offers), revision) = self.edit_tracked(|inv| {
            inv.clear_free_items();
            (inv.to_document(), inv.offers().to_vec())
        });
        if offers.is_empty() || document.is_empty() {
            return Ok(0);
        }

        let pricing = self.backend.apply_offers(&document, &offers).await?;

        let applied = self.edit_at(revision, |inv| {
            let matched = inv.apply_server_pricing(&pricing.items);
            inv.set_free_items(&pricing.free_items);
            inv.set_applied_pricing_rules(pricing.applied_pricing_rules.clone());
            matched
        });
        let Some(matched) = applied else {
            debug!("Cart changed while pricing was in flight, result dropped");
            return Ok(0);
        };
        debug!(matched, free = pricing.free_items.len(), "Server pricing applied");
        Ok(matched)
    }

    /// Asks the backend for stock problems in the current cart.
    ///
    /// Transport failures are treated as "no problems known".
    pub async fn validate_stock(&self) -> SyncResult<Vec<CartValidationIssue>> {
        let (items, profile) = self.read(|inv| {
            (
                inv.to_document().items,
                inv.pos_profile().unwrap_or_default().to_string(),
            )
        });
        if items.is_empty() {
            return Ok(Vec::new());
        }
        match self.backend.validate_cart_items(&items, &profile).await {
            Ok(issues) => Ok(issues),
            Err(e) if e.is_connectivity() => {
                warn!(error = %e, "Cart validation unavailable");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    fn submittable_document(&self) -> SyncResult<InvoiceDocument> {
        self.read(|inv| {
            if inv.is_empty() {
                return Err(CoreError::EmptyInvoice.into());
            }
            if !inv.can_submit() {
                return Err(CoreError::NotFullyPaid {
                    remaining: inv.remaining(),
                }
                .into());
            }
            Ok(inv.to_document())
        })
    }

    /// Two-phase submit against the backend.
    ///
    /// The draft name from phase 1 stays on the cart on failure, so a second
    /// attempt updates the same draft.
    pub async fn submit(&self) -> SyncResult<BackendInvoice> {
        let mut document = self.submittable_document()?;

        let draft = self.backend.update_invoice(&document).await?;
        debug!(draft = %draft.name, "Draft saved");
        let name = draft.name;
        {
            let mut invoice = self.invoice.lock().unwrap_or_else(PoisonError::into_inner);
            invoice.set_draft_name(Some(name.clone()));
        }
        document.name = Some(name.clone());

        let submitted = self.finalize(&document).await?;
        info!(invoice = %submitted.name, grand_total = document.grand_total, "Invoice submitted");

        self.edit(Invoice::clear);
        self.reconciler.clear_reservations();
        Ok(submitted)
    }

    async fn finalize(&self, document: &InvoiceDocument) -> SyncResult<BackendInvoice> {
        let mut backoff = self.retry.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self
                .backend
                .submit_invoice(document, document.change_amount)
                .await
            {
                Ok(invoice) => return Ok(invoice),
                Err(e) if e.is_connectivity() && attempt < self.retry.max_attempts => {
                    let Some(delay) = backoff.next_backoff() else {
                        return Err(e);
                    };
                    warn!(error = %e, attempt, ?delay, "Submit failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Submit failed");
                    return Err(e);
                }
            }
        }
    }

    /// Submits online, or hands the invoice to the offline queue.
    ///
    /// An online submit that loses the connection also falls back to the
    /// queue; backend rejections are returned as-is.
    pub async fn submit_or_enqueue(&self) -> SyncResult<SubmitOutcome> {
        if !self.worker.is_online() {
            return self.enqueue().await.map(SubmitOutcome::Queued);
        }
        match self.submit().await {
            Ok(invoice) => Ok(SubmitOutcome::Submitted(invoice)),
            Err(e) if e.is_connectivity() => {
                warn!(error = %e, "Backend unreachable, queuing invoice");
                self.enqueue().await.map(SubmitOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    async fn enqueue(&self) -> SyncResult<OfflineQueueEntry> {
        let document = self.submittable_document()?;
        let entry = self.worker.save_invoice(document).await?;

        // The store was decremented by the queue; mirror it in the ledger.
        let reserved = self.reconciler.reservations();
        let tracked: HashSet<String> = self.reconciler.tracked_codes().into_iter().collect();
        let warehouse = self.reconciler.warehouse().unwrap_or_default();
        let updates: Vec<StockUpdate> = reserved
            .into_iter()
            .filter(|(code, _)| tracked.contains(code))
            .map(|(code, qty)| {
                let remaining = self.reconciler.server_qty(&code) - qty;
                StockUpdate::new(code, warehouse.clone(), remaining)
            })
            .collect();
        self.reconciler.apply_update(&updates);

        info!(id = entry.id, "Invoice queued offline");
        self.edit(Invoice::clear);
        self.reconciler.clear_reservations();
        Ok(entry)
    }

    /// Resets the cart. When online, stale backend drafts are cleaned up
    /// in the background of this call; failures there are ignored.
    pub async fn clear_cart(&self) {
        let profile = self.edit(|inv| {
            inv.clear();
            inv.pos_profile().map(str::to_string)
        });
        self.reconciler.clear_reservations();

        let Some(profile) = profile else { return };
        if !self.worker.is_online() {
            return;
        }
        let max_age = self.config.queue.draft_cleanup_max_age_hours;
        if let Err(e) = self.backend.cleanup_old_drafts(&profile, max_age).await {
            debug!(error = %e, "Draft cleanup skipped");
        }
    }

    // =========================================================================
    // Local Drafts
    // =========================================================================

    /// Parks the cart locally under a new id and clears it.
    pub async fn save_local_draft(&self) -> SyncResult<LocalDraft> {
        let payload = self.read(|inv| {
            if inv.is_empty() {
                return Err(SyncError::from(CoreError::EmptyInvoice));
            }
            Ok(serde_json::to_value(inv)?)
        })?;
        let draft_id = Uuid::new_v4().to_string();
        let draft = self.worker.save_draft(&draft_id, payload).await?;

        self.edit(Invoice::clear);
        self.reconciler.clear_reservations();
        Ok(draft)
    }

    /// Restores a parked cart, replacing the current one.
    ///
    /// Returns false if no such draft exists.
    pub async fn load_local_draft(&self, draft_id: &str) -> SyncResult<bool> {
        let Some(draft) = self.worker.take_draft(draft_id).await? else {
            return Ok(false);
        };
        let restored = Invoice::restore(draft.payload)?;
        self.edit(|inv| *inv = restored);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockError};
    use crate::protocol::WorkerEvent;
    use crate::worker::SyncWorker;
    use tally_core::{FreeItem, PricingResult, ServerLineResult, TaxRule};
    use tally_db::{Database, DbConfig};

    struct Fixture {
        session: InvoiceSession,
        backend: Arc<MockBackend>,
        db: Database,
    }

    async fn fixture(backend: Arc<MockBackend>) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut config = SyncConfig::default();
        config.profile.warehouse = Some("Stores".into());
        let config = Arc::new(config);

        let (worker, handle) = SyncWorker::new(config.clone(), db.clone(), backend.clone());
        let mut events = handle.subscribe();
        let reconciler = StockReconciler::from_config(backend.clone(), &config)
            .with_worker(handle.clone());
        worker.with_reconciler(reconciler.clone()).start();
        while !matches!(events.recv().await, Ok(WorkerEvent::Ready { .. })) {}

        let session = InvoiceSession::new(
            Invoice::for_profile("Main POS", None),
            backend.clone(),
            reconciler,
            handle,
            config,
        )
        .with_retry(SubmitRetry {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            max_attempts: 3,
        });
        Fixture {
            session,
            backend,
            db,
        }
    }

    fn apple() -> CatalogItem {
        CatalogItem::new("APPLE", "Apple", 10.0)
    }

    fn paid_cart(session: &InvoiceSession) {
        session.add_item(&apple(), 2.0).unwrap();
        session.add_payment(PaymentEntry::new("Cash", 25.0)).unwrap();
    }

    #[tokio::test]
    async fn test_cart_edits_follow_into_reservations() {
        let f = fixture(Arc::new(MockBackend::new())).await;
        let reconciler = f.session.reconciler();
        reconciler.apply_update(&[StockUpdate::new("APPLE", "Stores", 5.0)]);

        f.session.add_item_checked(&apple(), 3.0).unwrap();
        assert_eq!(reconciler.display_stock("APPLE"), 2.0);

        let err = f.session.add_item_checked(&apple(), 3.0).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Core(CoreError::InsufficientStock { .. })
        ));

        f.session.set_quantity(0, 1.0).unwrap();
        assert_eq!(reconciler.display_stock("APPLE"), 4.0);

        f.session.remove_line(0).unwrap();
        assert_eq!(reconciler.display_stock("APPLE"), 5.0);
    }

    #[tokio::test]
    async fn test_untracked_item_skips_stock_check() {
        let f = fixture(Arc::new(MockBackend::new())).await;
        f.session
            .add_item_checked(&CatalogItem::new("SERVICE", "Gift wrap", 2.0), 10.0)
            .unwrap();
        assert_eq!(f.session.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_and_unpaid() {
        let f = fixture(Arc::new(MockBackend::new())).await;
        let err = f.session.submit().await.unwrap_err();
        assert!(matches!(err, SyncError::Core(CoreError::EmptyInvoice)));

        f.session.add_item(&apple(), 1.0).unwrap();
        let err = f.session.submit().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Core(CoreError::NotFullyPaid { .. })
        ));
        assert_eq!(f.backend.calls("update_invoice"), 0);
    }

    #[tokio::test]
    async fn test_submit_two_phase_clears_cart() {
        let f = fixture(Arc::new(MockBackend::new())).await;
        f.session
            .reconciler()
            .apply_update(&[StockUpdate::new("APPLE", "Stores", 5.0)]);
        paid_cart(&f.session);

        let submitted = f.session.submit().await.unwrap();
        assert_eq!(submitted.name, "DRAFT-0001");
        assert_eq!(f.backend.submitted(), vec!["DRAFT-0001".to_string()]);
        assert!(f.session.is_empty());
        assert!(f.session.reconciler().reservations().is_empty());
    }

    #[tokio::test]
    async fn test_submit_retries_connectivity_with_same_draft() {
        let f = fixture(Arc::new(MockBackend::new())).await;
        paid_cart(&f.session);
        f.backend.fail_next("submit_invoice", MockError::Offline);

        let submitted = f.session.submit().await.unwrap();
        assert_eq!(submitted.name, "DRAFT-0001");
        assert_eq!(f.backend.calls("submit_invoice"), 2);
        assert_eq!(f.backend.calls("update_invoice"), 1);
    }

    #[tokio::test]
    async fn test_submit_surfaces_backend_error_and_keeps_draft() {
        let f = fixture(Arc::new(MockBackend::new())).await;
        paid_cart(&f.session);
        f.backend.fail_next(
            "submit_invoice",
            MockError::business("ValidationError", "Not enough stock for APPLE"),
        );

        let err = f.session.submit().await.unwrap_err();
        let backend = err.backend().unwrap();
        assert_eq!(backend.exc_type.as_deref(), Some("ValidationError"));
        assert_eq!(backend.server_messages, vec!["Not enough stock for APPLE"]);
        assert_eq!(f.backend.calls("submit_invoice"), 1);

        let cart = f.session.snapshot();
        assert_eq!(cart.draft_name(), Some("DRAFT-0001"));
        assert_eq!(cart.len(), 1);

        // The retry upserts the same draft.
        f.session.submit().await.unwrap();
        let updated = f.backend.updated();
        assert_eq!(updated[1].name.as_deref(), Some("DRAFT-0001"));
    }

    #[tokio::test]
    async fn test_submit_or_enqueue_offline_queues_and_decrements() {
        let backend = Arc::new(MockBackend::new());
        backend.set_online(false);
        let f = fixture(backend).await;
        f.db.stock()
            .apply_quantities(&[StockUpdate::new("APPLE", "Stores", 10.0)])
            .await
            .unwrap();
        f.session
            .reconciler()
            .apply_update(&[StockUpdate::new("APPLE", "Stores", 10.0)]);
        paid_cart(&f.session);

        let outcome = f.session.submit_or_enqueue().await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert!(f.session.is_empty());
        assert_eq!(f.backend.calls("update_invoice"), 0);
        assert_eq!(f.db.stock().get("APPLE", "Stores").await.unwrap(), Some(8.0));
        assert_eq!(f.session.reconciler().display_stock("APPLE"), 8.0);
    }

    #[tokio::test]
    async fn test_offer_lifecycle() {
        let backend = Arc::new(MockBackend::new());
        backend.set_pricing(PricingResult {
            items: vec![ServerLineResult {
                discount_percentage: 10.0,
                pricing_rules: vec!["PR-1".into()],
                ..Default::default()
            }],
            applied_pricing_rules: vec!["PR-1".into()],
            free_items: vec![FreeItem {
                item_code: "GIFT".into(),
                item_name: "Gift".into(),
                qty: 1.0,
                uom: None,
                pricing_rule: Some("PR-1".into()),
            }],
        });
        let f = fixture(backend).await;
        f.session.add_item(&apple(), 2.0).unwrap();

        assert_eq!(f.session.apply_offer("SUMMER").await.unwrap(), 1);
        let cart = f.session.snapshot();
        assert_eq!(cart.len(), 2);
        assert!((cart.totals().grand_total - 18.0).abs() < 1e-9);

        // Reapplying replaces the free line instead of adding another.
        f.session.reapply_offers().await.unwrap();
        assert_eq!(f.session.snapshot().len(), 2);

        f.session.remove_offer("SUMMER").await.unwrap();
        let cart = f.session.snapshot();
        assert_eq!(cart.len(), 1);
        assert!((cart.totals().grand_total - 20.0).abs() < 1e-9);
        assert_eq!(
            f.backend.offer_requests(),
            vec![vec!["SUMMER".to_string()], vec!["SUMMER".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_pricing_dropped_when_cart_changes_in_flight() {
        let backend = Arc::new(MockBackend::new());
        backend.set_pricing(PricingResult {
            items: vec![ServerLineResult {
                discount_percentage: 10.0,
                ..Default::default()
            }],
            ..Default::default()
        });
        backend.set_offers_delay(Duration::from_millis(300));
        let Fixture { session, .. } = fixture(backend).await;
        let session = Arc::new(session);
        session.add_item(&apple(), 2.0).unwrap();

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.apply_offer("SUMMER").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.set_quantity(0, 3.0).unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), 0);
        let cart = session.snapshot();
        assert!((cart.totals().grand_total - 30.0).abs() < 1e-9);
        assert_eq!(cart.offers(), ["SUMMER".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_offer_is_deselected() {
        let backend = Arc::new(MockBackend::new());
        let f = fixture(backend.clone()).await;
        f.session.add_item(&apple(), 1.0).unwrap();

        backend.fail_next("apply_offers", MockError::business("ValidationError", "Offer expired"));
        assert!(f.session.apply_offer("EXPIRED").await.is_err());
        assert!(f.session.snapshot().offers().is_empty());

        backend.fail_next("apply_offers", MockError::Offline);
        assert!(f.session.apply_offer("SUMMER").await.is_err());
        assert_eq!(f.session.snapshot().offers(), ["SUMMER".to_string()]);
    }

    #[tokio::test]
    async fn test_validate_stock_absorbs_transport_errors() {
        let backend = Arc::new(MockBackend::new());
        let f = fixture(backend.clone()).await;
        f.session.add_item(&apple(), 1.0).unwrap();

        backend.fail_next("validate_cart_items", MockError::Offline);
        assert!(f.session.validate_stock().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_tax_rules_sets_regime() {
        let backend = Arc::new(MockBackend::new());
        backend.set_taxes(vec![TaxRule::new("On Net Total", 10.0)]);
        let f = fixture(backend).await;
        f.session.add_item(&apple(), 1.0).unwrap();

        assert_eq!(f.session.load_tax_rules("Main POS", false).await.unwrap(), 1);
        let totals = f.session.totals();
        assert!((totals.grand_total - 11.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_local_draft_round_trip() {
        let f = fixture(Arc::new(MockBackend::new())).await;
        f.session.add_item(&apple(), 3.0).unwrap();

        let draft = f.session.save_local_draft().await.unwrap();
        assert!(f.session.is_empty());

        assert!(f.session.load_local_draft(&draft.draft_id).await.unwrap());
        assert_eq!(f.session.snapshot().len(), 1);
        assert_eq!(f.session.reconciler().reservations().get("APPLE"), Some(&3.0));
        assert!(!f.session.load_local_draft(&draft.draft_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_cart_cleans_backend_drafts() {
        let f = fixture(Arc::new(MockBackend::new())).await;
        f.session.add_item(&apple(), 1.0).unwrap();
        f.session.clear_cart().await;
        assert!(f.session.is_empty());
        assert_eq!(f.backend.calls("cleanup_old_drafts"), 1);
    }
}
