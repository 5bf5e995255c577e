//! Scripted in-process backend for tests.
//!
//! Every call is recorded by method name. Failures can be queued per method
//! (`fail_next`) or made permanent (`fail_always`).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use tally_core::{
    CartValidationIssue, CatalogItem, Customer, DocumentLine, InvoiceDocument, ItemDetails,
    PricingResult, StockUpdate, TaxRule,
};

use crate::backend::{BackendInvoice, ItemDetailsQuery, ItemGroup, ItemQuery, PosBackend};
use crate::error::{BackendError, SyncError, SyncResult};

/// A failure the mock can be told to produce.
#[derive(Debug, Clone)]
pub enum MockError {
    Offline,
    Backend(BackendError),
}

impl MockError {
    pub fn business(exc_type: &str, message: &str) -> Self {
        MockError::Backend(BackendError {
            exc_type: Some(exc_type.to_string()),
            server_messages: vec![message.to_string()],
            http_status: Some(417),
            ..BackendError::new(message)
        })
    }

    fn to_error(&self) -> SyncError {
        match self {
            MockError::Offline => SyncError::ConnectionFailed("mock backend offline".into()),
            MockError::Backend(err) => SyncError::Backend(err.clone()),
        }
    }
}

#[derive(Default)]
struct State {
    online: bool,
    ping_delay: Duration,
    stock_delay: Duration,
    items_delay: Duration,
    offers_delay: Duration,
    customers_ignore_start: bool,
    calls: Vec<String>,
    items: Vec<CatalogItem>,
    customers: Vec<Customer>,
    stock: Vec<StockUpdate>,
    taxes: Vec<TaxRule>,
    pricing: PricingResult,
    validation: Vec<CartValidationIssue>,
    item_details: Option<ItemDetails>,
    next_draft: u32,
    updated: Vec<InvoiceDocument>,
    submitted: Vec<String>,
    offer_requests: Vec<Vec<String>>,
    item_queries: Vec<ItemQuery>,
    fail_next: HashMap<String, VecDeque<MockError>>,
    fail_always: HashMap<String, MockError>,
}

pub struct MockBackend {
    state: Mutex<State>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            state: Mutex::new(State {
                online: true,
                ..Default::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    // ---- scripting -------------------------------------------------------

    pub fn set_online(&self, online: bool) {
        self.with(|s| s.online = online);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        self.with(|s| s.ping_delay = delay);
    }

    pub fn set_stock_delay(&self, delay: Duration) {
        self.with(|s| s.stock_delay = delay);
    }

    pub fn set_items_delay(&self, delay: Duration) {
        self.with(|s| s.items_delay = delay);
    }

    pub fn set_offers_delay(&self, delay: Duration) {
        self.with(|s| s.offers_delay = delay);
    }

    /// Serve every customer page from offset zero, like a backend that has
    /// no paging.
    pub fn set_customers_ignore_start(&self, ignore: bool) {
        self.with(|s| s.customers_ignore_start = ignore);
    }

    pub fn set_items(&self, items: Vec<CatalogItem>) {
        self.with(|s| s.items = items);
    }

    pub fn set_customers(&self, customers: Vec<Customer>) {
        self.with(|s| s.customers = customers);
    }

    pub fn set_stock(&self, stock: Vec<StockUpdate>) {
        self.with(|s| s.stock = stock);
    }

    pub fn set_taxes(&self, taxes: Vec<TaxRule>) {
        self.with(|s| s.taxes = taxes);
    }

    pub fn set_pricing(&self, pricing: PricingResult) {
        self.with(|s| s.pricing = pricing);
    }

    pub fn set_validation(&self, issues: Vec<CartValidationIssue>) {
        self.with(|s| s.validation = issues);
    }

    pub fn set_item_details(&self, details: ItemDetails) {
        self.with(|s| s.item_details = Some(details));
    }

    pub fn fail_next(&self, method: &str, err: MockError) {
        self.with(|s| {
            s.fail_next
                .entry(method.to_string())
                .or_default()
                .push_back(err)
        });
    }

    pub fn fail_always(&self, method: &str, err: Option<MockError>) {
        self.with(|s| match err {
            Some(err) => {
                s.fail_always.insert(method.to_string(), err);
            }
            None => {
                s.fail_always.remove(method);
            }
        });
    }

    // ---- inspection ------------------------------------------------------

    pub fn calls(&self, method: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| *c == method).count())
    }

    pub fn submitted(&self) -> Vec<String> {
        self.with(|s| s.submitted.clone())
    }

    pub fn updated(&self) -> Vec<InvoiceDocument> {
        self.with(|s| s.updated.clone())
    }

    pub fn offer_requests(&self) -> Vec<Vec<String>> {
        self.with(|s| s.offer_requests.clone())
    }

    pub fn item_queries(&self) -> Vec<ItemQuery> {
        self.with(|s| s.item_queries.clone())
    }

    // ---- plumbing --------------------------------------------------------

    /// Records the call and returns the scripted failure, if any.
    fn enter(&self, method: &str) -> SyncResult<()> {
        self.with(|s| {
            s.calls.push(method.to_string());
            if let Some(err) = s.fail_next.get_mut(method).and_then(VecDeque::pop_front) {
                return Err(err.to_error());
            }
            if let Some(err) = s.fail_always.get(method) {
                return Err(err.to_error());
            }
            if !s.online {
                return Err(MockError::Offline.to_error());
            }
            Ok(())
        })
    }
}

#[async_trait]
impl PosBackend for MockBackend {
    async fn ping(&self) -> SyncResult<()> {
        let delay = self.with(|s| s.ping_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.enter("ping")
    }

    async fn get_items(&self, query: &ItemQuery) -> SyncResult<Vec<CatalogItem>> {
        let delay = self.with(|s| s.items_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.enter("get_items")?;
        Ok(self.with(|s| {
            s.item_queries.push(query.clone());
            let needle = query.search_term.as_deref().map(str::to_lowercase);
            s.items
                .iter()
                .filter(|item| match &needle {
                    Some(n) => {
                        item.item_code.to_lowercase().contains(n)
                            || item.item_name.to_lowercase().contains(n)
                    }
                    None => true,
                })
                .skip(query.start as usize)
                .take(query.limit as usize)
                .cloned()
                .collect()
        }))
    }

    async fn get_item_groups(&self, _pos_profile: &str) -> SyncResult<Vec<ItemGroup>> {
        self.enter("get_item_groups")?;
        Ok(self.with(|s| {
            let mut groups: Vec<String> =
                s.items.iter().filter_map(|i| i.item_group.clone()).collect();
            groups.sort();
            groups.dedup();
            groups
                .into_iter()
                .map(|item_group| ItemGroup { item_group })
                .collect()
        }))
    }

    async fn search_by_barcode(
        &self,
        barcode: &str,
        _pos_profile: &str,
    ) -> SyncResult<Option<CatalogItem>> {
        self.enter("search_by_barcode")?;
        Ok(self.with(|s| {
            s.items
                .iter()
                .find(|i| i.barcodes.iter().any(|b| b == barcode))
                .cloned()
        }))
    }

    async fn get_item_details(&self, query: &ItemDetailsQuery) -> SyncResult<ItemDetails> {
        self.enter("get_item_details")?;
        self.with(|s| s.item_details.clone()).ok_or_else(|| {
            SyncError::Backend(BackendError::new(format!(
                "no details for {}",
                query.item_code
            )))
        })
    }

    async fn get_stock_quantities(
        &self,
        item_codes: &[String],
        warehouse: &str,
    ) -> SyncResult<Vec<StockUpdate>> {
        let delay = self.with(|s| s.stock_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.enter("get_stock_quantities")?;
        Ok(self.with(|s| {
            s.stock
                .iter()
                .filter(|u| u.warehouse == warehouse && item_codes.contains(&u.item_code))
                .cloned()
                .collect()
        }))
    }

    async fn get_customers(
        &self,
        _pos_profile: &str,
        start: u32,
        limit: u32,
    ) -> SyncResult<Vec<Customer>> {
        self.enter("get_customers")?;
        Ok(self.with(|s| {
            let start = if s.customers_ignore_start { 0 } else { start };
            s.customers
                .iter()
                .skip(start as usize)
                .take(limit as usize)
                .cloned()
                .collect()
        }))
    }

    async fn get_taxes(&self, _pos_profile: &str) -> SyncResult<Vec<TaxRule>> {
        self.enter("get_taxes")?;
        Ok(self.with(|s| s.taxes.clone()))
    }

    async fn update_invoice(&self, document: &InvoiceDocument) -> SyncResult<BackendInvoice> {
        self.enter("update_invoice")?;
        Ok(self.with(|s| {
            s.updated.push(document.clone());
            let name = match &document.name {
                Some(name) => name.clone(),
                None => {
                    s.next_draft += 1;
                    format!("DRAFT-{:04}", s.next_draft)
                }
            };
            BackendInvoice {
                name,
                docstatus: Some(0),
                status: Some("Draft".into()),
                grand_total: Some(document.grand_total),
            }
        }))
    }

    async fn submit_invoice(
        &self,
        document: &InvoiceDocument,
        _change_amount: f64,
    ) -> SyncResult<BackendInvoice> {
        self.enter("submit_invoice")?;
        let name = document
            .name
            .clone()
            .ok_or_else(|| SyncError::Internal("submit without draft name".into()))?;
        self.with(|s| s.submitted.push(name.clone()));
        Ok(BackendInvoice {
            name,
            docstatus: Some(1),
            status: Some("Paid".into()),
            grand_total: Some(document.grand_total),
        })
    }

    async fn validate_cart_items(
        &self,
        _items: &[DocumentLine],
        _pos_profile: &str,
    ) -> SyncResult<Vec<CartValidationIssue>> {
        self.enter("validate_cart_items")?;
        Ok(self.with(|s| s.validation.clone()))
    }

    async fn apply_offers(
        &self,
        _document: &InvoiceDocument,
        selected_offers: &[String],
    ) -> SyncResult<PricingResult> {
        let delay = self.with(|s| s.offers_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.enter("apply_offers")?;
        Ok(self.with(|s| {
            s.offer_requests.push(selected_offers.to_vec());
            s.pricing.clone()
        }))
    }

    async fn cleanup_old_drafts(&self, _pos_profile: &str, _max_age_hours: u32) -> SyncResult<()> {
        self.enter("cleanup_old_drafts")
    }
}
