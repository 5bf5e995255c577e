//! # Catalog Loading & Item Search
//!
//! ## Progressive Load
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CatalogLoader::load                             │
//! │                                                                         │
//! │  (a) cached page ── worker.search_items("", first_page_size)           │
//! │         │   published on items() before the backend is asked           │
//! │         │                                                               │
//! │         ├── offline, cache empty  ──► CacheNotReady                    │
//! │         ├── offline               ──► serve cache                      │
//! │         ▼                                                               │
//! │  (b) get_items(start 0, first_page_size) ──► cache_items, items()      │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  (c) cached count < low_water_mark and first page was full?            │
//! │         │ yes                                                          │
//! │         ▼                                                               │
//! │      background paging, one batch per batch_interval:                  │
//! │        get_items(start, batch_size) ──► cache_items                    │
//! │        every stats_every batches  ──► CatalogProgress                  │
//! │        short page                 ──► CatalogComplete, stop            │
//! │        offline                    ──► stop                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only one background paging loop runs per loader.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tally_core::CatalogItem;

use crate::backend::{ItemQuery, PosBackend};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::WorkerEvent;
use crate::worker::WorkerHandle;

/// Consecutive failed batches before background paging gives up.
const MAX_BATCH_FAILURES: u32 = 3;

/// Upper bound on customer pages per sync.
const MAX_CUSTOMER_PAGES: u32 = 500;

/// Result of [`CatalogLoader::load`].
#[derive(Debug)]
pub struct CatalogLoad {
    /// The visible set: the fresh first page, or the cache when the
    /// backend could not be reached.
    pub items: Vec<CatalogItem>,
    pub from_cache: bool,
    /// Background paging task, if one was started.
    pub background: Option<JoinHandle<()>>,
}

// =============================================================================
// Catalog Loader
// =============================================================================

#[derive(Clone)]
pub struct CatalogLoader {
    worker: WorkerHandle,
    backend: Arc<dyn PosBackend>,
    config: Arc<SyncConfig>,
    paging: Arc<AtomicBool>,
    visible_tx: Arc<watch::Sender<Vec<CatalogItem>>>,
}

impl CatalogLoader {
    pub fn new(worker: WorkerHandle, backend: Arc<dyn PosBackend>, config: Arc<SyncConfig>) -> Self {
        let (visible_tx, _) = watch::channel(Vec::new());
        CatalogLoader {
            worker,
            backend,
            config,
            paging: Arc::new(AtomicBool::new(false)),
            visible_tx: Arc::new(visible_tx),
        }
    }

    /// The visible item set. Holds the cached page while [`load`] waits on
    /// the backend, then the fresh first page.
    ///
    /// [`load`]: CatalogLoader::load
    pub fn items(&self) -> watch::Receiver<Vec<CatalogItem>> {
        self.visible_tx.subscribe()
    }

    /// True while a background paging loop is running.
    pub fn is_paging(&self) -> bool {
        self.paging.load(Ordering::SeqCst)
    }

    /// First page straight from the cache.
    pub async fn cached(&self) -> SyncResult<Vec<CatalogItem>> {
        self.worker
            .search_items("", self.config.catalog.first_page_size)
            .await
    }

    pub async fn load(&self, pos_profile: &str) -> SyncResult<CatalogLoad> {
        let cached = self.cached().await?;

        if !self.worker.is_online() {
            if cached.is_empty() {
                return Err(SyncError::CacheNotReady);
            }
            debug!(count = cached.len(), "Offline, serving catalog from cache");
            self.visible_tx.send_replace(cached.clone());
            return Ok(CatalogLoad {
                items: cached,
                from_cache: true,
                background: None,
            });
        }

        if !cached.is_empty() {
            debug!(count = cached.len(), "Showing cached catalog while fetching");
            self.visible_tx.send_replace(cached.clone());
        }

        let page_size = self.config.catalog.first_page_size;
        let fresh = match self
            .backend
            .get_items(&ItemQuery::page(pos_profile, 0, page_size))
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "First catalog page failed");
                if cached.is_empty() {
                    return Err(SyncError::CacheNotReady);
                }
                return Ok(CatalogLoad {
                    items: cached,
                    from_cache: true,
                    background: None,
                });
            }
        };

        if !fresh.is_empty() {
            self.worker.cache_items(fresh.clone()).await?;
        }
        self.visible_tx.send_replace(fresh.clone());

        let first_page_full = fresh.len() as u32 >= page_size;
        let cached_count = self.worker.cache_stats().await?.item_count;
        let background = if first_page_full && cached_count < self.config.catalog.low_water_mark {
            self.spawn_paging(pos_profile, fresh.len() as u32)
        } else {
            None
        };

        info!(
            page = fresh.len(),
            cached = cached_count,
            background = background.is_some(),
            "Catalog loaded"
        );
        Ok(CatalogLoad {
            items: fresh,
            from_cache: false,
            background,
        })
    }

    /// Full refresh when the cache is stale. Returns the paging task.
    pub async fn preload(&self, pos_profile: &str) -> SyncResult<Option<JoinHandle<()>>> {
        if !self.preload_due().await? {
            debug!("Catalog cache is fresh, skipping preload");
            return Ok(None);
        }
        if !self.worker.is_online() {
            return Ok(None);
        }
        Ok(self.spawn_paging(pos_profile, 0))
    }

    /// Due when the catalog was never synced or the last sync is older than
    /// `preload_max_age_hours`.
    pub async fn preload_due(&self) -> SyncResult<bool> {
        let stats = self.worker.cache_stats().await?;
        Ok(is_stale(
            stats.last_sync,
            self.config.catalog.preload_max_age_hours,
            Utc::now(),
        ))
    }

    /// Pages the whole customer list into the cache.
    ///
    /// Stops on a short page, on a page with no customer not already seen
    /// (a backend that ignores `start`), or after `MAX_CUSTOMER_PAGES`.
    pub async fn sync_customers(&self, pos_profile: &str) -> SyncResult<usize> {
        let batch = self.config.catalog.batch_size;
        let mut start = 0u32;
        let mut total = 0usize;
        let mut seen = HashSet::new();
        let mut pages = 0u32;
        loop {
            let page = self.backend.get_customers(pos_profile, start, batch).await?;
            pages += 1;
            let len = page.len();
            let unseen = page
                .iter()
                .filter(|c| seen.insert(c.name.clone()))
                .count();
            if len > 0 && unseen == 0 {
                warn!(start, pages, "Customer page repeated, backend ignores paging");
                break;
            }
            if len > 0 {
                total += self.worker.cache_customers(page).await?;
            }
            if (len as u32) < batch {
                break;
            }
            if pages >= MAX_CUSTOMER_PAGES {
                warn!(pages, total, "Customer sync hit page limit");
                break;
            }
            start += len as u32;
        }
        info!(total, pages, "Customers synced");
        Ok(total)
    }

    fn spawn_paging(&self, pos_profile: &str, start: u32) -> Option<JoinHandle<()>> {
        if self.paging.swap(true, Ordering::SeqCst) {
            debug!("Catalog paging already running");
            return None;
        }
        let loader = self.clone();
        let profile = pos_profile.to_string();
        Some(tokio::spawn(async move {
            loader.page_catalog(&profile, start).await;
            loader.paging.store(false, Ordering::SeqCst);
        }))
    }

    async fn page_catalog(&self, pos_profile: &str, mut start: u32) {
        let batch_size = self.config.catalog.batch_size;
        let stats_every = self.config.catalog.stats_every_batches.max(1);
        let interval = self.config.catalog_batch_interval();
        let mut batches = 0u32;
        let mut failures = 0u32;

        info!(start, batch_size, "Background catalog sync started");

        loop {
            if !self.worker.is_online() {
                info!(batches, "Offline, background catalog sync paused");
                return;
            }

            match self
                .backend
                .get_items(&ItemQuery::page(pos_profile, start, batch_size))
                .await
            {
                Ok(items) => {
                    failures = 0;
                    let len = items.len() as u32;
                    if len > 0 {
                        if let Err(e) = self.worker.cache_items(items).await {
                            warn!(error = %e, "Failed to cache catalog batch");
                            return;
                        }
                    }
                    batches += 1;
                    start += len;

                    if len < batch_size {
                        let total = self.cached_count().await;
                        info!(total, batches, "Background catalog sync complete");
                        self.worker.emit(WorkerEvent::CatalogComplete { total });
                        return;
                    }
                    if batches % stats_every == 0 {
                        let cached = self.cached_count().await;
                        debug!(cached, batches, "Catalog sync progress");
                        self.worker
                            .emit(WorkerEvent::CatalogProgress { cached, batches });
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, start, failures, "Catalog batch failed");
                    if failures >= MAX_BATCH_FAILURES {
                        warn!("Giving up on background catalog sync");
                        return;
                    }
                }
            }

            tokio::time::sleep(interval).await;
        }
    }

    async fn cached_count(&self) -> i64 {
        match self.worker.cache_stats().await {
            Ok(stats) => stats.item_count,
            Err(e) => {
                warn!(error = %e, "Failed to read cache stats");
                0
            }
        }
    }
}

fn is_stale(last_sync: Option<DateTime<Utc>>, max_age_hours: u64, now: DateTime<Utc>) -> bool {
    let max_age = ChronoDuration::hours(i64::try_from(max_age_hours).unwrap_or(i64::MAX / 3600));
    match last_sync {
        Some(at) => now - at > max_age,
        None => true,
    }
}

// =============================================================================
// Item Search
// =============================================================================

/// Cache-first item search with a debounced search box.
pub struct ItemSearch {
    worker: WorkerHandle,
    backend: Arc<dyn PosBackend>,
    config: Arc<SyncConfig>,
    pos_profile: String,
    pending: Option<JoinHandle<()>>,
    results_tx: Arc<watch::Sender<Vec<CatalogItem>>>,
}

impl ItemSearch {
    pub fn new(
        worker: WorkerHandle,
        backend: Arc<dyn PosBackend>,
        config: Arc<SyncConfig>,
        pos_profile: impl Into<String>,
    ) -> Self {
        let (results_tx, _) = watch::channel(Vec::new());
        ItemSearch {
            worker,
            backend,
            config,
            pos_profile: pos_profile.into(),
            pending: None,
            results_tx: Arc::new(results_tx),
        }
    }

    /// Latest results of the debounced search.
    pub fn results(&self) -> watch::Receiver<Vec<CatalogItem>> {
        self.results_tx.subscribe()
    }

    /// Restarts the debounce timer with a new term.
    pub fn set_search_term(&mut self, term: impl Into<String>) {
        if let Some(previous) = self.pending.take() {
            previous.abort();
        }

        let term = term.into();
        let searcher = self.searcher();
        let delay = self.config.search_debounce();
        let results_tx = self.results_tx.clone();

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match searcher.search(&term).await {
                Ok(items) => {
                    results_tx.send_replace(items);
                }
                Err(e) => warn!(error = %e, term = %term, "Item search failed"),
            }
        }));
    }

    /// Searches immediately, skipping the debounce.
    pub async fn search(&self, term: &str) -> SyncResult<Vec<CatalogItem>> {
        self.searcher().search(term).await
    }

    pub async fn search_by_barcode(&self, barcode: &str) -> SyncResult<Option<CatalogItem>> {
        self.searcher().search_by_barcode(barcode).await
    }

    fn searcher(&self) -> Searcher {
        Searcher {
            worker: self.worker.clone(),
            backend: self.backend.clone(),
            config: self.config.clone(),
            pos_profile: self.pos_profile.clone(),
        }
    }
}

impl Drop for ItemSearch {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

/// Owned search context that can move into the debounce task.
struct Searcher {
    worker: WorkerHandle,
    backend: Arc<dyn PosBackend>,
    config: Arc<SyncConfig>,
    pos_profile: String,
}

impl Searcher {
    async fn search(&self, term: &str) -> SyncResult<Vec<CatalogItem>> {
        let term = term.trim();
        let hits = self
            .worker
            .search_items(term, self.config.search.cache_limit)
            .await?;
        if !hits.is_empty() || term.is_empty() || !self.worker.is_online() {
            return Ok(hits);
        }

        let query = ItemQuery::search(&self.pos_profile, term, self.config.search.server_limit);
        match self.backend.get_items(&query).await {
            Ok(items) => {
                debug!(term, count = items.len(), "Server search fallback");
                if !items.is_empty() {
                    self.worker.cache_items(items.clone()).await?;
                }
                Ok(items)
            }
            Err(e) => {
                warn!(error = %e, term, "Server search failed");
                Ok(hits)
            }
        }
    }

    async fn search_by_barcode(&self, barcode: &str) -> SyncResult<Option<CatalogItem>> {
        if let Some(item) = self.worker.search_by_barcode(barcode).await? {
            return Ok(Some(item));
        }
        if !self.worker.is_online() {
            return Ok(None);
        }

        match self
            .backend
            .search_by_barcode(barcode, &self.pos_profile)
            .await
        {
            Ok(Some(item)) => {
                self.worker.cache_items(vec![item.clone()]).await?;
                Ok(Some(item))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, barcode, "Server barcode lookup failed");
                Ok(None)
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use crate::worker::SyncWorker;
    use std::time::Duration;
    use tally_core::Customer;
    use tally_db::{Database, DbConfig};

    fn test_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.catalog.first_page_size = 50;
        config.catalog.batch_size = 100;
        config.catalog.batch_interval_ms = 5;
        config.catalog.low_water_mark = 100;
        config.catalog.stats_every_batches = 1;
        config.search.debounce_ms = 50;
        config
    }

    fn catalog(n: usize) -> Vec<CatalogItem> {
        (0..n)
            .map(|i| CatalogItem::new(format!("ITEM-{i:04}"), format!("Item {i}"), 1.0))
            .collect()
    }

    fn customers(n: usize) -> Vec<Customer> {
        (0..n)
            .map(|i| Customer {
                name: format!("CUST-{i:04}"),
                customer_name: format!("Customer {i}"),
                mobile_no: None,
                email_id: None,
            })
            .collect()
    }

    /// Starts a worker and waits until its first probe has finished.
    async fn start(backend: Arc<MockBackend>, config: SyncConfig) -> (WorkerHandle, Arc<SyncConfig>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let config = Arc::new(config);
        let (worker, handle) = SyncWorker::new(config.clone(), db, backend);
        let mut events = handle.subscribe();
        worker.start();
        events.recv().await.unwrap();
        (handle, config)
    }

    #[tokio::test]
    async fn test_offline_with_empty_cache_is_not_ready() {
        let backend = Arc::new(MockBackend::new());
        backend.set_online(false);
        let (handle, config) = start(backend.clone(), test_config()).await;
        let loader = CatalogLoader::new(handle, backend, config);

        assert!(matches!(
            loader.load("Main POS").await.unwrap_err(),
            SyncError::CacheNotReady
        ));
    }

    #[tokio::test]
    async fn test_offline_serves_cache() {
        let backend = Arc::new(MockBackend::new());
        backend.set_online(false);
        let (handle, config) = start(backend.clone(), test_config()).await;
        handle.cache_items(catalog(3)).await.unwrap();
        let loader = CatalogLoader::new(handle, backend.clone(), config);

        let load = loader.load("Main POS").await.unwrap();
        assert!(load.from_cache);
        assert_eq!(load.items.len(), 3);
        assert_eq!(backend.calls("get_items"), 0);
    }

    #[tokio::test]
    async fn test_progressive_load_pages_until_short_page() {
        let backend = Arc::new(MockBackend::new());
        backend.set_items(catalog(250));
        let (handle, config) = start(backend.clone(), test_config()).await;
        let mut events = handle.subscribe();
        let loader = CatalogLoader::new(handle.clone(), backend.clone(), config);

        let load = loader.load("Main POS").await.unwrap();
        assert!(!load.from_cache);
        assert_eq!(load.items.len(), 50);

        load.background.expect("paging started").await.unwrap();
        assert_eq!(handle.cache_stats().await.unwrap().item_count, 250);

        let starts: Vec<u32> = backend.item_queries().iter().map(|q| q.start).collect();
        assert_eq!(starts, vec![0, 50, 150, 250]);

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(WorkerEvent::CatalogComplete { total: 250 }));
        assert!(!loader.is_paging());
    }

    #[tokio::test]
    async fn test_cached_items_visible_before_first_page() {
        let backend = Arc::new(MockBackend::new());
        backend.set_items(
            (0..10)
                .map(|i| CatalogItem::new(format!("NEW-{i}"), format!("New {i}"), 2.0))
                .collect(),
        );
        let (handle, config) = start(backend.clone(), test_config()).await;
        handle.cache_items(catalog(3)).await.unwrap();
        backend.set_items_delay(Duration::from_millis(300));

        let loader = CatalogLoader::new(handle, backend.clone(), config);
        let mut items = loader.items();
        let task = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load("Main POS").await }
        });

        tokio::time::timeout(Duration::from_secs(5), items.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(items.borrow_and_update().len(), 3);
        assert!(!task.is_finished());

        let load = task.await.unwrap().unwrap();
        assert!(!load.from_cache);
        assert_eq!(load.items.len(), 10);
        assert!(items.borrow().iter().all(|i| i.item_code.starts_with("NEW-")));
    }

    #[tokio::test]
    async fn test_sync_customers_pages_by_offset() {
        let backend = Arc::new(MockBackend::new());
        backend.set_customers(customers(250));
        let (handle, config) = start(backend.clone(), test_config()).await;
        let loader = CatalogLoader::new(handle.clone(), backend.clone(), config);

        assert_eq!(loader.sync_customers("Main POS").await.unwrap(), 250);
        assert_eq!(backend.calls("get_customers"), 3);
        assert_eq!(handle.search_customers("", 500).await.unwrap().len(), 250);
    }

    #[tokio::test]
    async fn test_sync_customers_stops_when_backend_ignores_start() {
        let backend = Arc::new(MockBackend::new());
        backend.set_customers(customers(250));
        backend.set_customers_ignore_start(true);
        let (handle, config) = start(backend.clone(), test_config()).await;
        let loader = CatalogLoader::new(handle, backend.clone(), config);

        let total = tokio::time::timeout(Duration::from_secs(5), loader.sync_customers("Main POS"))
            .await
            .expect("sync terminates")
            .unwrap();
        assert_eq!(total, 100);
        assert_eq!(backend.calls("get_customers"), 2);
    }

    #[tokio::test]
    async fn test_no_paging_above_low_water_mark() {
        let backend = Arc::new(MockBackend::new());
        backend.set_items(catalog(300));
        let (handle, config) = start(backend.clone(), test_config()).await;
        handle.cache_items(catalog(150)).await.unwrap();
        let loader = CatalogLoader::new(handle, backend.clone(), config);

        let load = loader.load("Main POS").await.unwrap();
        assert!(load.background.is_none());
        assert_eq!(backend.calls("get_items"), 1);
    }

    #[test]
    fn test_preload_due_after_max_age() {
        let now = Utc::now();
        assert!(is_stale(None, 24, now));
        assert!(!is_stale(Some(now - ChronoDuration::hours(2)), 24, now));
        assert!(is_stale(Some(now - ChronoDuration::hours(25)), 24, now));
    }

    #[tokio::test]
    async fn test_search_falls_back_to_server_and_caches() {
        let backend = Arc::new(MockBackend::new());
        backend.set_items(vec![CatalogItem::new("APL", "Apple", 1.0)]);
        let (handle, config) = start(backend.clone(), test_config()).await;
        let search = ItemSearch::new(handle.clone(), backend.clone(), config, "Main POS");

        let hits = search.search("apple").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(backend.calls("get_items"), 1);

        // Second search is served by the cache.
        let hits = search.search("apple").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(backend.calls("get_items"), 1);
    }

    #[tokio::test]
    async fn test_search_term_is_debounced() {
        let backend = Arc::new(MockBackend::new());
        backend.set_items(vec![CatalogItem::new("APL", "Apple", 1.0)]);
        let (handle, config) = start(backend.clone(), test_config()).await;
        let mut search = ItemSearch::new(handle, backend.clone(), config, "Main POS");
        let mut results = search.results();

        search.set_search_term("a");
        search.set_search_term("ap");
        search.set_search_term("app");

        tokio::time::timeout(Duration::from_secs(5), results.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.borrow()[0].item_code, "APL");

        let queries = backend.item_queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].search_term.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn test_barcode_lookup_cache_then_server() {
        let backend = Arc::new(MockBackend::new());
        backend.set_items(vec![CatalogItem {
            barcodes: vec!["4006381333931".into()],
            ..CatalogItem::new("PEN", "Pen", 1.5)
        }]);
        let (handle, config) = start(backend.clone(), test_config()).await;
        let search = ItemSearch::new(handle, backend.clone(), config, "Main POS");

        let found = search.search_by_barcode("4006381333931").await.unwrap();
        assert_eq!(found.unwrap().item_code, "PEN");
        assert_eq!(backend.calls("search_by_barcode"), 1);

        search.search_by_barcode("4006381333931").await.unwrap();
        assert_eq!(backend.calls("search_by_barcode"), 1);
        assert!(search.search_by_barcode("000").await.unwrap().is_none());
    }
}
