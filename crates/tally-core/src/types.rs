//! # Domain Types
//!
//! Core domain types used throughout Tally POS.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  CatalogItem    │   │    Customer     │   │  StockUpdate    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  item_code (PK) │   │  name (PK)      │   │  item_code      │       │
//! │  │  price_list_rate│   │  customer_name  │   │  warehouse      │       │
//! │  │  barcodes[]     │   │  mobile_no      │   │  actual_qty     │       │
//! │  │  actual_qty     │   │  email_id       │   │  stock_qty      │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    TaxRule      │   │  DiscountValue  │   │OfflineQueueEntry│       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  charge_type    │   │  Percentage(f64)│   │  id, payload    │       │
//! │  │  rate (%)       │   │  Fixed(f64)     │   │  synced, retries│       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backend Identity
//! The backend owns identifiers. Items are keyed by `item_code`, customers by
//! `name`, and submitted invoices by the draft `name` returned from phase 1.
//! Local identifiers (queue ids, draft ids) never leave this process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

fn default_conversion_factor() -> f64 {
    1.0
}

// =============================================================================
// Catalog
// =============================================================================

/// A sellable item as cached from the backend catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CatalogItem {
    /// Unique item key.
    pub item_code: String,

    /// Display name shown to the cashier.
    #[serde(default)]
    pub item_name: String,

    #[serde(default)]
    pub item_group: Option<String>,

    #[serde(default)]
    pub brand: Option<String>,

    /// Selling rate as quoted by the price list at fetch time.
    #[serde(default)]
    pub rate: f64,

    /// Undiscounted reference price. Line math is always keyed off this.
    #[serde(default)]
    pub price_list_rate: f64,

    #[serde(default)]
    pub uom: Option<String>,

    #[serde(default)]
    pub stock_uom: Option<String>,

    #[serde(default = "default_conversion_factor")]
    pub conversion_factor: f64,

    #[serde(default)]
    pub warehouse: Option<String>,

    /// Quantity on hand as last reported by the backend.
    #[serde(default)]
    pub actual_qty: Option<f64>,

    /// Quantity in stock UOM as last reported by the backend.
    #[serde(default)]
    pub stock_qty: Option<f64>,

    /// Barcodes that resolve to this item (exact match).
    #[serde(default)]
    pub barcodes: Vec<String>,
}

impl CatalogItem {
    /// Creates a minimal item with a single reference price.
    pub fn new(item_code: impl Into<String>, item_name: impl Into<String>, price: f64) -> Self {
        CatalogItem {
            item_code: item_code.into(),
            item_name: item_name.into(),
            item_group: None,
            brand: None,
            rate: price,
            price_list_rate: price,
            uom: None,
            stock_uom: None,
            conversion_factor: 1.0,
            warehouse: None,
            actual_qty: None,
            stock_qty: None,
            barcodes: Vec::new(),
        }
    }

    /// Authoritative server quantity: `actual_qty`, else `stock_qty`, else 0.
    pub fn server_qty(&self) -> f64 {
        self.actual_qty.or(self.stock_qty).unwrap_or(0.0)
    }

    /// Reference price used when the item is added to an invoice.
    ///
    /// Falls back to `rate` when the price list did not quote the item.
    pub fn reference_price(&self) -> f64 {
        if self.price_list_rate > 0.0 {
            self.price_list_rate
        } else {
            self.rate
        }
    }
}

/// Details returned when an item is re-quoted in a different UOM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ItemDetails {
    pub uom: String,
    #[serde(default = "default_conversion_factor")]
    pub conversion_factor: f64,
    #[serde(default)]
    pub price_list_rate: f64,
}

/// A cached price for an item in a price list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ItemPrice {
    pub price_list: String,
    pub item_code: String,
    pub price_list_rate: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub uom: Option<String>,
}

// =============================================================================
// Customers & Payments
// =============================================================================

/// A customer as cached from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Customer {
    /// Backend key.
    pub name: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub mobile_no: Option<String>,
    #[serde(default)]
    pub email_id: Option<String>,
}

impl Customer {
    /// Case-insensitive contains match on any searchable field.
    ///
    /// `needle` must already be lowercased.
    pub fn matches(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }
        let hit = |s: &str| s.to_lowercase().contains(needle);
        hit(&self.name)
            || hit(&self.customer_name)
            || self.mobile_no.as_deref().is_some_and(hit)
            || self.email_id.as_deref().is_some_and(hit)
    }
}

/// A mode of payment enabled on a POS profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentMethod {
    pub mode_of_payment: String,
    #[serde(default)]
    pub pos_profile: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default, rename = "type")]
    pub payment_type: Option<String>,
}

/// A payment row on an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentEntry {
    pub mode_of_payment: String,
    pub amount: f64,
    #[serde(default, rename = "type")]
    pub payment_type: Option<String>,
}

impl PaymentEntry {
    pub fn new(mode_of_payment: impl Into<String>, amount: f64) -> Self {
        PaymentEntry {
            mode_of_payment: mode_of_payment.into(),
            amount,
            payment_type: None,
        }
    }
}

// =============================================================================
// Stock
// =============================================================================

/// An authoritative quantity for one item in one warehouse.
///
/// Delivered by realtime `pos_stock_update` events and by direct refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockUpdate {
    pub item_code: String,
    #[serde(default)]
    pub warehouse: String,
    #[serde(default)]
    pub actual_qty: Option<f64>,
    #[serde(default)]
    pub stock_qty: Option<f64>,
}

impl StockUpdate {
    pub fn new(item_code: impl Into<String>, warehouse: impl Into<String>, qty: f64) -> Self {
        StockUpdate {
            item_code: item_code.into(),
            warehouse: warehouse.into(),
            actual_qty: Some(qty),
            stock_qty: None,
        }
    }

    /// Quantity carried by the update: `actual_qty`, else `stock_qty`, else 0.
    pub fn qty(&self) -> f64 {
        self.actual_qty.or(self.stock_qty).unwrap_or(0.0)
    }

    /// Coalescing key for realtime batching.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}", self.item_code, self.warehouse)
    }
}

/// Stock figures for one item as shown to the cashier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockInfo {
    pub server_qty: f64,
    pub reserved_qty: f64,
    /// `max(server_qty - reserved_qty, 0)`.
    pub display_qty: f64,
    pub warehouse: Option<String>,
    #[ts(as = "Option<String>")]
    pub last_update: Option<DateTime<Utc>>,
}

// =============================================================================
// Tax
// =============================================================================

/// Charge bases the client sums locally. Anything else arrives pre-resolved.
pub const CLIENT_CHARGE_TYPES: [&str; 2] = ["On Net Total", "On Previous Row Total"];

/// A tax row from the POS profile's tax template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxRule {
    pub charge_type: String,
    /// Percentage, e.g. `10.0` for 10%.
    #[serde(default)]
    pub rate: f64,
}

impl TaxRule {
    pub fn new(charge_type: impl Into<String>, rate: f64) -> Self {
        TaxRule {
            charge_type: charge_type.into(),
            rate,
        }
    }

    #[inline]
    pub fn is_client_applicable(&self) -> bool {
        CLIENT_CHARGE_TYPES.contains(&self.charge_type.as_str())
    }

    /// Sums the rates of the rules the client applies.
    pub fn total_rate(rules: &[TaxRule]) -> f64 {
        rules
            .iter()
            .filter(|r| r.is_client_applicable())
            .map(|r| r.rate)
            .sum()
    }
}

/// Which tax regime applies to the whole invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TaxMode {
    /// Tax is added on top of the net amount.
    #[default]
    Exclusive,
    /// Quoted prices already contain tax.
    Inclusive,
}

impl TaxMode {
    pub fn from_inclusive(flag: bool) -> Self {
        if flag {
            TaxMode::Inclusive
        } else {
            TaxMode::Exclusive
        }
    }
}

// =============================================================================
// Discounts & Pricing Rules
// =============================================================================

/// A discount resolved at the API boundary into a tagged value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DiscountValue {
    Percentage(f64),
    Fixed(f64),
}

impl DiscountValue {
    /// Discount amount against `base`, clamped to `[0, base]`.
    pub fn amount_on(&self, base: f64) -> f64 {
        let base = base.max(0.0);
        let raw = match *self {
            DiscountValue::Percentage(pct) => base * pct.clamp(0.0, 100.0) / 100.0,
            DiscountValue::Fixed(value) => value,
        };
        raw.clamp(0.0, base)
    }
}

/// A coupon applied as a grand-total-level discount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CouponDiscount {
    pub code: String,
    pub discount: DiscountValue,
}

/// Per-line result of server-side pricing, matched by position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ServerLineResult {
    #[serde(default)]
    pub discount_percentage: f64,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default)]
    pub pricing_rules: Vec<String>,
}

impl ServerLineResult {
    /// True when the server actually matched something on this line.
    pub fn has_match(&self) -> bool {
        self.discount_percentage > 0.0
            || self.discount_amount > 0.0
            || !self.pricing_rules.is_empty()
    }
}

/// An item granted for free by a pricing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FreeItem {
    pub item_code: String,
    #[serde(default)]
    pub item_name: String,
    pub qty: f64,
    #[serde(default)]
    pub uom: Option<String>,
    #[serde(default)]
    pub pricing_rule: Option<String>,
}

/// Normalized `apply_offers` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PricingResult {
    #[serde(default)]
    pub items: Vec<ServerLineResult>,
    #[serde(default)]
    pub applied_pricing_rules: Vec<String>,
    #[serde(default)]
    pub free_items: Vec<FreeItem>,
}

/// A stock problem reported by `validate_cart_items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CartValidationIssue {
    #[serde(default)]
    pub item_code: Option<String>,
    #[serde(default)]
    pub item_name: Option<String>,
    pub message: String,
    #[serde(default)]
    pub available_qty: Option<f64>,
    #[serde(default)]
    pub requested_qty: Option<f64>,
}

// =============================================================================
// Offline Queue & Drafts
// =============================================================================

/// An invoice or payment persisted while the backend was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueEntry {
    /// Local auto-increment id.
    pub id: i64,
    /// Serialized document as it would have been sent.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
    pub retry_count: u32,
    /// Quarantined after repeated failures; needs user action.
    pub sync_failed: bool,
    pub error: Option<String>,
    /// Backend draft name once phase 1 has been accepted.
    pub draft_name: Option<String>,
}

/// A cart parked locally for later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDraft {
    pub draft_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// =============================================================================
// Cache Statistics
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CacheStats {
    pub item_count: i64,
    pub customer_count: i64,
    pub queued_invoice_count: i64,
    /// At least one item is cached.
    pub cache_ready: bool,
    #[ts(as = "Option<String>")]
    pub last_sync: Option<DateTime<Utc>>,
}

// =============================================================================
// Unit Tests
// =============================================================================
