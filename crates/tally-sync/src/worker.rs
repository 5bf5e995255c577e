//! # Background Sync Worker
//!
//! Owns the persistent store and every timer. Callers talk to it only
//! through a [`WorkerHandle`].
//!
//! ## Worker Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncWorker                                      │
//! │                                                                         │
//! │  tokio::select! {                                                      │
//! │      ping.tick()          ──► spawn probe ──► status changed?          │
//! │                                               offline → online: drain  │
//! │      stock_refresh.tick() ──► spawn reconciler.refresh(tracked codes)  │
//! │      cmd_rx.recv()        ──► handle(request) ──► Envelope{id, result} │
//! │      shutdown_rx.recv()   ──► break                                    │
//! │  }                                                                      │
//! │                                                                         │
//! │  Storage requests are handled in arrival order on the loop.            │
//! │  Network-bound requests (ping, drain) run detached so they never       │
//! │  hold up cache reads.                                                  │
//! │                                                                         │
//! │  ┌──────────────┐  Envelope   ┌────────────┐  oneshot   ┌──────────┐  │
//! │  │ SyncWorker   │ ──────────► │ dispatcher │ ─────────► │ caller   │  │
//! │  └──────────────┘             └────────────┘            └──────────┘  │
//! │                        pending: HashMap<Uuid, oneshot::Sender>         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tally_core::{
    CacheStats, CatalogItem, Customer, InvoiceDocument, ItemPrice, LocalDraft, OfflineQueueEntry,
    PaymentMethod, StockUpdate,
};
use tally_db::{keys, ClearOptions, Database};

use crate::backend::PosBackend;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Command, Envelope, Request, WorkerEvent, WorkerFailure, WorkerReply};
use crate::queue::{DrainReport, OfflineQueue};
use crate::stock::StockReconciler;

type ReplySender = oneshot::Sender<Result<WorkerReply, WorkerFailure>>;
type PendingTable = Arc<Mutex<HashMap<Uuid, ReplySender>>>;

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 64;

fn lock_pending(pending: &PendingTable) -> MutexGuard<'_, HashMap<Uuid, ReplySender>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Worker Handle
// =============================================================================

/// Cloneable handle to a running [`SyncWorker`].
#[derive(Clone)]
pub struct WorkerHandle {
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
    pending: PendingTable,
    events: broadcast::Sender<WorkerEvent>,
    connectivity: Connectivity,
    timeout: Duration,
}

impl WorkerHandle {
    /// Sends a request and waits for its envelope.
    ///
    /// Fails with [`SyncError::Timeout`] if no reply arrives within the
    /// configured request timeout. The pending entry is removed either way.
    pub async fn request(&self, request: Request) -> SyncResult<WorkerReply> {
        let id = Uuid::new_v4();
        let name = request.name();
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        if self.cmd_tx.send(Command { id, request }).await.is_err() {
            lock_pending(&self.pending).remove(&id);
            return Err(SyncError::ChannelError("Worker channel closed".into()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result.map_err(SyncError::from),
            Ok(Err(_)) => Err(SyncError::ShuttingDown),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                warn!(request = name, %id, "Worker request timed out");
                Err(SyncError::timeout(name, self.timeout))
            }
        }
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<WorkerEvent> {
        self.events.clone()
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    /// Current offline state without a round trip.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))
    }

    // ---- connectivity ---------------------------------------------------

    pub async fn ping_server(&self) -> SyncResult<bool> {
        match self.request(Request::PingServer).await? {
            WorkerReply::ServerOnline(online) => Ok(online),
            other => Err(unexpected("ping_server", other)),
        }
    }

    pub async fn check_offline(&self, browser_online: bool) -> SyncResult<bool> {
        match self.request(Request::CheckOffline { browser_online }).await? {
            WorkerReply::Offline(offline) => Ok(offline),
            other => Err(unexpected("check_offline", other)),
        }
    }

    pub async fn set_manual_offline(&self, value: bool) -> SyncResult<()> {
        self.request(Request::SetManualOffline { value }).await?;
        Ok(())
    }

    /// Reports a network change. Returns the combined offline state.
    pub async fn network_changed(&self, online: bool) -> SyncResult<bool> {
        match self.request(Request::NetworkChanged { online }).await? {
            WorkerReply::Offline(offline) => Ok(offline),
            other => Err(unexpected("network_changed", other)),
        }
    }

    // ---- offline queue --------------------------------------------------

    pub async fn offline_invoice_count(&self) -> SyncResult<i64> {
        match self.request(Request::GetInvoiceCount).await? {
            WorkerReply::Count(count) => Ok(count),
            other => Err(unexpected("get_invoice_count", other)),
        }
    }

    pub async fn offline_invoices(&self) -> SyncResult<Vec<OfflineQueueEntry>> {
        match self.request(Request::GetInvoices).await? {
            WorkerReply::Entries(entries) => Ok(entries),
            other => Err(unexpected("get_invoices", other)),
        }
    }

    pub async fn save_invoice(&self, invoice: InvoiceDocument) -> SyncResult<OfflineQueueEntry> {
        match self.request(Request::SaveInvoice { invoice }).await? {
            WorkerReply::Queued(entry) => Ok(entry),
            other => Err(unexpected("save_invoice", other)),
        }
    }

    pub async fn delete_offline_invoice(&self, id: i64) -> SyncResult<bool> {
        match self.request(Request::DeleteInvoice { id }).await? {
            WorkerReply::Removed(removed) => Ok(removed),
            other => Err(unexpected("delete_invoice", other)),
        }
    }

    pub async fn retry_failed(&self, id: i64) -> SyncResult<bool> {
        match self.request(Request::RetryFailed { id }).await? {
            WorkerReply::Retried(reset) => Ok(reset),
            other => Err(unexpected("retry_failed", other)),
        }
    }

    pub async fn sync_invoices(&self) -> SyncResult<DrainReport> {
        match self.request(Request::SyncInvoices).await? {
            WorkerReply::Drained(report) => Ok(report),
            other => Err(unexpected("sync_invoices", other)),
        }
    }

    pub async fn save_payment(&self, payment: Value) -> SyncResult<OfflineQueueEntry> {
        match self.request(Request::SavePayment { payment }).await? {
            WorkerReply::Queued(entry) => Ok(entry),
            other => Err(unexpected("save_payment", other)),
        }
    }

    // ---- catalog --------------------------------------------------------

    pub async fn search_items(&self, term: &str, limit: u32) -> SyncResult<Vec<CatalogItem>> {
        let request = Request::SearchItems {
            term: term.to_string(),
            limit,
        };
        match self.request(request).await? {
            WorkerReply::Items(items) => Ok(items),
            other => Err(unexpected("search_items", other)),
        }
    }

    pub async fn search_by_barcode(&self, barcode: &str) -> SyncResult<Option<CatalogItem>> {
        let request = Request::SearchByBarcode {
            barcode: barcode.to_string(),
        };
        match self.request(request).await? {
            WorkerReply::Item(item) => Ok(item),
            other => Err(unexpected("search_by_barcode", other)),
        }
    }

    pub async fn search_customers(&self, term: &str, limit: u32) -> SyncResult<Vec<Customer>> {
        let request = Request::SearchCustomers {
            term: term.to_string(),
            limit,
        };
        match self.request(request).await? {
            WorkerReply::Customers(customers) => Ok(customers),
            other => Err(unexpected("search_customers", other)),
        }
    }

    pub async fn cache_items(&self, items: Vec<CatalogItem>) -> SyncResult<usize> {
        self.cached("cache_items", Request::CacheItems { items }).await
    }

    pub async fn cache_customers(&self, customers: Vec<Customer>) -> SyncResult<usize> {
        self.cached("cache_customers", Request::CacheCustomers { customers })
            .await
    }

    pub async fn is_cache_ready(&self) -> SyncResult<bool> {
        match self.request(Request::IsCacheReady).await? {
            WorkerReply::CacheReady(ready) => Ok(ready),
            other => Err(unexpected("is_cache_ready", other)),
        }
    }

    pub async fn cache_stats(&self) -> SyncResult<CacheStats> {
        match self.request(Request::GetCacheStats).await? {
            WorkerReply::Stats(stats) => Ok(stats),
            other => Err(unexpected("get_cache_stats", other)),
        }
    }

    pub async fn update_stock_quantities(&self, updates: Vec<StockUpdate>) -> SyncResult<usize> {
        self.cached(
            "update_stock_quantities",
            Request::UpdateStockQuantities { updates },
        )
        .await
    }

    pub async fn cache_item_prices(&self, prices: Vec<ItemPrice>) -> SyncResult<usize> {
        self.cached("cache_item_prices", Request::CacheItemPrices { prices })
            .await
    }

    pub async fn cache_payment_methods(
        &self,
        pos_profile: &str,
        methods: Vec<PaymentMethod>,
    ) -> SyncResult<usize> {
        let request = Request::CachePaymentMethods {
            pos_profile: pos_profile.to_string(),
            methods,
        };
        self.cached("cache_payment_methods", request).await
    }

    pub async fn payment_methods(&self, pos_profile: &str) -> SyncResult<Vec<PaymentMethod>> {
        let request = Request::GetPaymentMethods {
            pos_profile: pos_profile.to_string(),
        };
        match self.request(request).await? {
            WorkerReply::PaymentMethods(methods) => Ok(methods),
            other => Err(unexpected("get_payment_methods", other)),
        }
    }

    async fn cached(&self, name: &'static str, request: Request) -> SyncResult<usize> {
        match self.request(request).await? {
            WorkerReply::Cached(count) => Ok(count),
            other => Err(unexpected(name, other)),
        }
    }

    // ---- drafts & maintenance -------------------------------------------

    pub async fn save_draft(&self, draft_id: &str, payload: Value) -> SyncResult<LocalDraft> {
        let request = Request::SaveDraft {
            draft_id: draft_id.to_string(),
            payload,
        };
        match self.request(request).await? {
            WorkerReply::Draft(draft) => Ok(draft),
            other => Err(unexpected("save_draft", other)),
        }
    }

    pub async fn list_drafts(&self) -> SyncResult<Vec<LocalDraft>> {
        match self.request(Request::ListDrafts).await? {
            WorkerReply::Drafts(drafts) => Ok(drafts),
            other => Err(unexpected("list_drafts", other)),
        }
    }

    /// Removes a draft and returns it.
    pub async fn take_draft(&self, draft_id: &str) -> SyncResult<Option<LocalDraft>> {
        let request = Request::TakeDraft {
            draft_id: draft_id.to_string(),
        };
        match self.request(request).await? {
            WorkerReply::TakenDraft(draft) => Ok(draft),
            other => Err(unexpected("take_draft", other)),
        }
    }

    pub async fn clear_cache(&self, options: ClearOptions) -> SyncResult<()> {
        self.request(Request::ClearCache { options }).await?;
        Ok(())
    }
}

fn unexpected(request: &str, reply: WorkerReply) -> SyncError {
    SyncError::Internal(format!("unexpected reply to {request}: {reply:?}"))
}

// =============================================================================
// Worker Context
// =============================================================================

/// State shared by the loop and its detached tasks.
#[derive(Clone)]
struct WorkerContext {
    config: Arc<SyncConfig>,
    db: Database,
    backend: Arc<dyn PosBackend>,
    connectivity: Connectivity,
    queue: OfflineQueue,
    events: broadcast::Sender<WorkerEvent>,
    reconciler: Option<StockReconciler>,
    refresh_in_flight: Arc<AtomicBool>,
}

impl WorkerContext {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    /// Restores persisted flags and takes the first server reading.
    async fn startup(&self) {
        match self.db.ensure_cache_version().await {
            Ok(true) => info!("Catalog cache cleared after version change"),
            Ok(false) => {}
            Err(e) => error!(error = %e, "Failed to check cache version"),
        }

        match self.db.settings().get::<bool>(keys::MANUAL_OFFLINE).await {
            Ok(Some(value)) => self.connectivity.set_manual_offline(value),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read manual offline flag"),
        }

        let server_online = self
            .connectivity
            .probe(self.backend.as_ref(), self.config.ping_timeout())
            .await
            .unwrap_or_else(|| self.connectivity.server_online());
        info!(
            server_online,
            manual_offline = self.connectivity.manual_offline(),
            "Sync worker ready"
        );
        self.emit(WorkerEvent::Ready { server_online });

        if self.connectivity.is_online() {
            self.spawn_drain();
        }
    }

    /// Probes the server and emits an event if the status changed.
    ///
    /// Returns the current server status and whether it changed.
    async fn refresh_server_status(&self) -> (bool, bool) {
        let before = self.connectivity.server_online();
        let now = self
            .connectivity
            .probe(self.backend.as_ref(), self.config.ping_timeout())
            .await
            .unwrap_or(before);

        let changed = now != before;
        if changed {
            info!(server_online = now, "Server status changed");
            self.emit(WorkerEvent::ServerStatusChanged { server_online: now });
        }
        (now, changed)
    }

    /// Interval probe. An offline to online transition drains the queue.
    async fn ping_cycle(&self) -> bool {
        let (online, changed) = self.refresh_server_status().await;
        if online && changed && self.connectivity.is_online() {
            self.drain().await;
        }
        online
    }

    async fn drain(&self) -> DrainReport {
        match self.queue.drain(&self.connectivity).await {
            Ok(report) => {
                if !report.is_empty() {
                    self.emit(WorkerEvent::QueueDrained {
                        success: report.success,
                        failed: report.failed,
                    });
                }
                report
            }
            Err(e) => {
                error!(error = %e, "Offline queue drain failed");
                DrainReport::default()
            }
        }
    }

    fn spawn_drain(&self) {
        let ctx = self.clone();
        tokio::spawn(async move {
            ctx.drain().await;
        });
    }

    fn spawn_probe(&self) {
        let ctx = self.clone();
        tokio::spawn(async move {
            ctx.ping_cycle().await;
        });
    }

    fn spawn_stock_refresh(&self) {
        let Some(reconciler) = self.reconciler.clone() else {
            return;
        };
        if !self.connectivity.is_online() {
            debug!("Offline, skipping stock refresh");
            return;
        }
        if self.refresh_in_flight.swap(true, Ordering::SeqCst) {
            debug!("Stock refresh already running");
            return;
        }

        let in_flight = self.refresh_in_flight.clone();
        tokio::spawn(async move {
            match reconciler.refresh(None).await {
                Ok(applied) => debug!(applied, "Periodic stock refresh done"),
                Err(e) => warn!(error = %e, "Periodic stock refresh failed"),
            }
            in_flight.store(false, Ordering::SeqCst);
        });
    }

    // =========================================================================
    // Request Handling
    // =========================================================================

    async fn handle(&self, request: Request) -> SyncResult<WorkerReply> {
        match request {
            Request::PingServer => Ok(WorkerReply::ServerOnline(self.ping_cycle().await)),

            Request::CheckOffline { browser_online } => Ok(WorkerReply::Offline(
                self.connectivity.is_offline(browser_online),
            )),

            Request::SetManualOffline { value } => {
                self.connectivity.set_manual_offline(value);
                self.db.settings().set(keys::MANUAL_OFFLINE, &value).await?;
                info!(manual_offline = value, "Manual offline toggled");
                if !value && self.connectivity.is_online() {
                    self.spawn_drain();
                }
                Ok(WorkerReply::Ack)
            }

            Request::NetworkChanged { online } => {
                debug!(online, "Network changed");
                if online {
                    self.refresh_server_status().await;
                    self.drain().await;
                }
                Ok(WorkerReply::Offline(self.connectivity.is_offline(online)))
            }

            Request::GetInvoiceCount => Ok(WorkerReply::Count(self.queue.count().await?)),

            Request::GetInvoices => Ok(WorkerReply::Entries(
                self.queue.get_offline_invoices().await?,
            )),

            Request::SaveInvoice { invoice } => {
                Ok(WorkerReply::Queued(self.queue.enqueue(invoice).await?))
            }

            Request::DeleteInvoice { id } => Ok(WorkerReply::Removed(self.queue.delete(id).await?)),

            Request::RetryFailed { id } => {
                Ok(WorkerReply::Retried(self.queue.retry_failed(id).await?))
            }

            Request::SyncInvoices => Ok(WorkerReply::Drained(self.drain().await)),

            Request::SavePayment { payment } => Ok(WorkerReply::Queued(
                self.queue.save_offline_payment(payment).await?,
            )),

            Request::SearchItems { term, limit } => Ok(WorkerReply::Items(
                self.db.items().search(&term, limit).await?,
            )),

            Request::SearchByBarcode { barcode } => Ok(WorkerReply::Item(
                self.db.items().find_by_barcode(&barcode).await?,
            )),

            Request::SearchCustomers { term, limit } => Ok(WorkerReply::Customers(
                self.db.customers().search(&term, limit).await?,
            )),

            Request::CacheItems { items } => {
                let written = self.db.items().bulk_put(&items).await?;
                self.db
                    .settings()
                    .set(keys::ITEMS_LAST_SYNC, &Utc::now())
                    .await?;
                if let Some(reconciler) = &self.reconciler {
                    reconciler.init(&items);
                }
                debug!(written, "Items cached");
                Ok(WorkerReply::Cached(written))
            }

            Request::CacheCustomers { customers } => {
                let written = self.db.customers().bulk_put(&customers).await?;
                self.db
                    .settings()
                    .set(keys::CUSTOMERS_LAST_SYNC, &Utc::now())
                    .await?;
                debug!(written, "Customers cached");
                Ok(WorkerReply::Cached(written))
            }

            Request::IsCacheReady => Ok(WorkerReply::CacheReady(
                self.db.items().count().await? > 0,
            )),

            Request::GetCacheStats => Ok(WorkerReply::Stats(self.db.cache_stats().await?)),

            Request::UpdateStockQuantities { updates } => {
                let updated = self.db.items().update_stock(&updates).await?;
                self.db.stock().apply_quantities(&updates).await?;
                Ok(WorkerReply::Cached(updated))
            }

            Request::CacheItemPrices { prices } => Ok(WorkerReply::Cached(
                self.db.item_prices().bulk_put(&prices).await?,
            )),

            Request::CachePaymentMethods {
                pos_profile,
                methods,
            } => Ok(WorkerReply::Cached(
                self.db
                    .payment_methods()
                    .replace_for_profile(&pos_profile, &methods)
                    .await?,
            )),

            Request::GetPaymentMethods { pos_profile } => Ok(WorkerReply::PaymentMethods(
                self.db.payment_methods().list(&pos_profile).await?,
            )),

            Request::SaveDraft { draft_id, payload } => Ok(WorkerReply::Draft(
                self.db.drafts().save(&draft_id, &payload).await?,
            )),

            Request::ListDrafts => Ok(WorkerReply::Drafts(self.db.drafts().list().await?)),

            Request::TakeDraft { draft_id } => Ok(WorkerReply::TakenDraft(
                self.db.drafts().take(&draft_id).await?,
            )),

            Request::ClearCache { options } => {
                self.db.clear_cached_data(options).await?;
                if let Some(reconciler) = &self.reconciler {
                    reconciler.reset();
                }
                Ok(WorkerReply::Ack)
            }
        }
    }
}

/// Requests that wait on the network run off the loop.
fn runs_detached(request: &Request) -> bool {
    matches!(
        request,
        Request::PingServer | Request::NetworkChanged { .. } | Request::SyncInvoices
    )
}

async fn send_reply(
    reply_tx: &mpsc::Sender<Envelope>,
    id: Uuid,
    name: &'static str,
    result: SyncResult<WorkerReply>,
) {
    let result = result.map_err(|e| {
        warn!(request = name, %id, error = %e, "Worker request failed");
        WorkerFailure::from(&e)
    });
    if reply_tx.send(Envelope { id, result }).await.is_err() {
        debug!(request = name, %id, "Reply dropped, dispatcher gone");
    }
}

// =============================================================================
// Sync Worker
// =============================================================================

/// The background worker. Create with [`SyncWorker::new`], then
/// [`start`](SyncWorker::start).
pub struct SyncWorker {
    ctx: WorkerContext,
    cmd_rx: mpsc::Receiver<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    reply_tx: mpsc::Sender<Envelope>,
    reply_rx: mpsc::Receiver<Envelope>,
    pending: PendingTable,
}

impl SyncWorker {
    pub fn new(
        config: Arc<SyncConfig>,
        db: Database,
        backend: Arc<dyn PosBackend>,
    ) -> (Self, WorkerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let connectivity = Connectivity::new(config.worker.manual_offline);

        let queue = OfflineQueue::new(db.clone(), backend.clone(), config.clone());
        let handle = WorkerHandle {
            cmd_tx,
            shutdown_tx,
            pending: pending.clone(),
            events: events.clone(),
            connectivity: connectivity.clone(),
            timeout: config.reply_timeout(),
        };

        let worker = SyncWorker {
            ctx: WorkerContext {
                config,
                db,
                backend,
                connectivity,
                queue,
                events,
                reconciler: None,
                refresh_in_flight: Arc::new(AtomicBool::new(false)),
            },
            cmd_rx,
            shutdown_rx,
            reply_tx,
            reply_rx,
            pending,
        };

        (worker, handle)
    }

    /// Enables periodic stock refresh and seeds the reconciler on caching.
    pub fn with_reconciler(mut self, reconciler: StockReconciler) -> Self {
        self.ctx.reconciler = Some(reconciler);
        self
    }

    /// Spawns the dispatcher and the worker loop.
    pub fn start(self) -> JoinHandle<()> {
        let SyncWorker {
            ctx,
            cmd_rx,
            shutdown_rx,
            reply_tx,
            reply_rx,
            pending,
        } = self;

        tokio::spawn(dispatch_replies(reply_rx, pending.clone()));
        tokio::spawn(run(ctx, cmd_rx, shutdown_rx, reply_tx, pending))
    }
}

/// Routes envelopes to the waiting callers.
async fn dispatch_replies(mut reply_rx: mpsc::Receiver<Envelope>, pending: PendingTable) {
    while let Some(envelope) = reply_rx.recv().await {
        let waiter = lock_pending(&pending).remove(&envelope.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(envelope.result);
            }
            None => debug!(id = %envelope.id, "Reply for expired request"),
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn every(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run(
    ctx: WorkerContext,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut shutdown_rx: mpsc::Receiver<()>,
    reply_tx: mpsc::Sender<Envelope>,
    pending: PendingTable,
) {
    info!("Sync worker starting");
    ctx.startup().await;

    let mut ping = every(ctx.config.ping_interval());
    let mut stock_refresh = match (&ctx.reconciler, ctx.config.stock_refresh_interval()) {
        (Some(_), Some(period)) => Some(every(period)),
        _ => None,
    };

    loop {
        tokio::select! {
            _ = ping.tick() => ctx.spawn_probe(),

            _ = tick(&mut stock_refresh) => ctx.spawn_stock_refresh(),

            Some(Command { id, request }) = cmd_rx.recv() => {
                let name = request.name();
                debug!(request = name, %id, "Worker request");
                if runs_detached(&request) {
                    let (ctx, reply_tx) = (ctx.clone(), reply_tx.clone());
                    tokio::spawn(async move {
                        let result = ctx.handle(request).await;
                        send_reply(&reply_tx, id, name, result).await;
                    });
                } else {
                    let result = ctx.handle(request).await;
                    send_reply(&reply_tx, id, name, result).await;
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Sync worker shutting down");
                break;
            }
        }
    }

    // Dropping the waiters wakes their callers with ShuttingDown.
    lock_pending(&pending).clear();
    info!("Sync worker stopped");
}

// =============================================================================
// Unit Tests
// =============================================================================
