//! # Stock Reconciliation
//!
//! [`StockReconciler`] wraps the [`StockLedger`] with the async parts: direct
//! refresh from the backend and persistence through the worker.
//! [`StockBatcher`] coalesces realtime `pos_stock_update` pushes before they
//! reach the ledger.
//!
//! ## Refresh Without Flicker
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          refresh(codes)                                 │
//! │                                                                         │
//! │  snapshot = (reservations, generation)                                 │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  get_stock_quantities(codes, warehouse)  ── bounded by timeout ──┐     │
//! │        │ ok                                                      │ err │
//! │        ▼                                                         │     │
//! │  apply_update(updates)                                           │     │
//! │        │                                                         │     │
//! │        ▼                                                         ▼     │
//! │  generation unchanged? ──yes──► reserve(snapshot)    (restore)         │
//! │                        └─no───► keep the newer cart snapshot           │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  worker.update_stock_quantities(updates)   failures are only logged    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Realtime Batching
//! ```text
//! push ──► pending[item_code|warehouse] = update     (last write wins)
//!            │
//!            ├── first update starts the window (batch_delay)
//!            ├── window elapsed            ──► flush
//!            └── pending ≥ max_batch_size  ──► flush now
//!
//! flush ──► drop other warehouses ──► apply + persist ──► StockApplied
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use tally_core::{CatalogItem, StockInfo, StockLedger, StockUpdate};

use crate::backend::PosBackend;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::normalize;
use crate::protocol::WorkerEvent;
use crate::worker::WorkerHandle;

// =============================================================================
// Stock Reconciler
// =============================================================================

/// Shared stock view. Clones share the same ledger.
#[derive(Clone)]
pub struct StockReconciler {
    ledger: Arc<Mutex<StockLedger>>,
    backend: Arc<dyn PosBackend>,
    worker: Option<WorkerHandle>,
    timeout: Duration,
}

impl StockReconciler {
    pub fn new(backend: Arc<dyn PosBackend>, warehouse: Option<String>, timeout: Duration) -> Self {
        let ledger = match warehouse {
            Some(wh) => StockLedger::with_warehouse(wh),
            None => StockLedger::new(),
        };
        StockReconciler {
            ledger: Arc::new(Mutex::new(ledger)),
            backend,
            worker: None,
            timeout,
        }
    }

    pub fn from_config(backend: Arc<dyn PosBackend>, config: &SyncConfig) -> Self {
        Self::new(
            backend,
            config.profile.warehouse.clone(),
            config.stock_refresh_timeout(),
        )
    }

    /// Persists refreshed and pushed quantities through the worker.
    pub fn with_worker(mut self, worker: WorkerHandle) -> Self {
        self.worker = Some(worker);
        self
    }

    fn ledger(&self) -> MutexGuard<'_, StockLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- ledger passthrough ---------------------------------------------

    pub fn init(&self, items: &[CatalogItem]) -> usize {
        self.ledger().init(items)
    }

    /// Replaces all reservations with the cart snapshot.
    pub fn reserve(&self, reservations: HashMap<String, f64>) {
        self.ledger().reserve(reservations);
    }

    pub fn clear_reservations(&self) {
        self.ledger().clear_reservations();
    }

    pub fn reservations(&self) -> HashMap<String, f64> {
        self.ledger().reservations().clone()
    }

    pub fn apply_update(&self, updates: &[StockUpdate]) -> usize {
        self.ledger().apply_update(updates)
    }

    pub fn accepts(&self, warehouse: &str) -> bool {
        self.ledger().accepts(warehouse)
    }

    pub fn display_stock(&self, item_code: &str) -> f64 {
        self.ledger().display_stock(item_code)
    }

    pub fn server_qty(&self, item_code: &str) -> f64 {
        self.ledger().server_qty(item_code)
    }

    pub fn stock_info(&self, item_code: &str) -> StockInfo {
        self.ledger().stock_info(item_code)
    }

    pub fn tracked_codes(&self) -> Vec<String> {
        self.ledger().tracked_codes()
    }

    pub fn warehouse(&self) -> Option<String> {
        self.ledger().warehouse().map(str::to_string)
    }

    pub fn set_warehouse(&self, warehouse: Option<String>) {
        self.ledger().set_warehouse(warehouse);
    }

    pub fn reset(&self) {
        self.ledger().reset();
    }

    // ---- async operations -----------------------------------------------

    /// Fetches authoritative quantities for `codes` (or every tracked code)
    /// and applies them. Reservations survive whether or not the fetch
    /// succeeds.
    ///
    /// Returns the number of updates applied.
    pub async fn refresh(&self, codes: Option<Vec<String>>) -> SyncResult<usize> {
        let warehouse = self
            .warehouse()
            .ok_or_else(|| SyncError::InvalidConfig("stock refresh needs a warehouse".into()))?;
        let codes = codes.unwrap_or_else(|| self.tracked_codes());
        if codes.is_empty() {
            return Ok(0);
        }

        let (snapshot, generation) = {
            let ledger = self.ledger();
            (ledger.reservations().clone(), ledger.generation())
        };

        let fetched = tokio::time::timeout(
            self.timeout,
            self.backend.get_stock_quantities(&codes, &warehouse),
        )
        .await
        .unwrap_or_else(|_| Err(SyncError::timeout("stock refresh", self.timeout)));

        let applied = {
            let mut ledger = self.ledger();
            let applied = match &fetched {
                Ok(updates) => ledger.apply_update(updates),
                Err(_) => 0,
            };
            if ledger.generation() == generation {
                ledger.reserve(snapshot);
            } else {
                debug!("Cart changed during refresh, keeping newer reservations");
            }
            applied
        };

        let updates = fetched?;
        debug!(requested = codes.len(), applied, warehouse = %warehouse, "Stock refreshed");
        self.persist(updates).await;
        Ok(applied)
    }

    /// Applies updates locally and persists them.
    pub async fn apply_and_persist(&self, updates: Vec<StockUpdate>) -> usize {
        let applied = self.apply_update(&updates);
        self.persist(updates).await;
        applied
    }

    async fn persist(&self, updates: Vec<StockUpdate>) {
        let Some(worker) = &self.worker else {
            return;
        };
        if updates.is_empty() {
            return;
        }
        if let Err(e) = worker.update_stock_quantities(updates).await {
            warn!(error = %e, "Failed to persist stock quantities");
        }
    }
}

// =============================================================================
// Realtime Batcher
// =============================================================================

#[derive(Debug)]
enum BatcherCommand {
    Push(Vec<StockUpdate>),
    Flush,
    Shutdown,
}

/// Handle for feeding the batcher.
#[derive(Clone)]
pub struct StockBatcherHandle {
    cmd_tx: mpsc::Sender<BatcherCommand>,
}

impl StockBatcherHandle {
    pub async fn push(&self, updates: Vec<StockUpdate>) -> SyncResult<()> {
        self.cmd_tx
            .send(BatcherCommand::Push(updates))
            .await
            .map_err(|_| SyncError::ChannelError("Stock batcher channel closed".into()))
    }

    /// Accepts a raw `pos_stock_update` payload.
    pub async fn push_event(&self, payload: Value) -> SyncResult<()> {
        let updates = match payload {
            Value::Object(mut map) => map.remove("stock_updates").unwrap_or(Value::Null),
            other => other,
        };
        let updates: Vec<StockUpdate> = normalize::records(updates, "stock updates")?;
        if updates.is_empty() {
            return Ok(());
        }
        self.push(updates).await
    }

    pub async fn flush(&self) -> SyncResult<()> {
        self.cmd_tx
            .send(BatcherCommand::Flush)
            .await
            .map_err(|_| SyncError::ChannelError("Stock batcher channel closed".into()))
    }

    /// Flushes what is pending and stops.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.cmd_tx
            .send(BatcherCommand::Shutdown)
            .await
            .map_err(|_| SyncError::ChannelError("Stock batcher channel closed".into()))
    }
}

/// Coalesces realtime stock pushes into bounded-delay batches.
pub struct StockBatcher {
    reconciler: StockReconciler,
    delay: Duration,
    max_batch_size: usize,
    events: Option<broadcast::Sender<WorkerEvent>>,
    pending: HashMap<String, StockUpdate>,
    deadline: Option<Instant>,
}

impl StockBatcher {
    pub fn new(reconciler: StockReconciler, config: &SyncConfig) -> Self {
        StockBatcher {
            reconciler,
            delay: config.realtime_batch_delay(),
            max_batch_size: config.realtime.max_batch_size.max(1),
            events: None,
            pending: HashMap::new(),
            deadline: None,
        }
    }

    /// Emits [`WorkerEvent::StockApplied`] after each flush.
    pub fn with_events(mut self, events: broadcast::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn start(self) -> StockBatcherHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(self.run(cmd_rx));
        StockBatcherHandle { cmd_tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<BatcherCommand>) {
        info!(
            delay_ms = self.delay.as_millis() as u64,
            max_batch = self.max_batch_size,
            "Stock batcher started"
        );

        loop {
            let deadline = self.deadline;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(BatcherCommand::Push(updates)) => self.add(updates).await,
                    Some(BatcherCommand::Flush) => self.flush().await,
                    Some(BatcherCommand::Shutdown) | None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await;
                }
            }
        }

        info!("Stock batcher stopped");
    }

    async fn add(&mut self, updates: Vec<StockUpdate>) {
        for update in updates {
            self.pending.insert(update.dedup_key(), update);
        }
        if self.deadline.is_none() && !self.pending.is_empty() {
            self.deadline = Some(Instant::now() + self.delay);
        }
        if self.pending.len() >= self.max_batch_size {
            debug!(count = self.pending.len(), "Stock batch full, flushing early");
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() {
            return;
        }

        let batch: Vec<StockUpdate> = self
            .pending
            .drain()
            .map(|(_, update)| update)
            .filter(|update| self.reconciler.accepts(&update.warehouse))
            .collect();

        let count = if batch.is_empty() {
            0
        } else {
            self.reconciler.apply_and_persist(batch).await
        };
        debug!(count, "Stock batch applied");

        if let Some(events) = &self.events {
            // No subscribers is fine.
            let _ = events.send(WorkerEvent::StockApplied { count });
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
