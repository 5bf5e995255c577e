//! # Invoice Computation Engine
//!
//! Single source of truth for how a line's price, discount, tax and amount
//! are derived, and for the invoice's subtotal, tax, discount and grand total.
//!
//! ## Per-Line Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Line Recalculation                                 │
//! │                                                                         │
//! │   Base ──────────► Discounted ──────────► TaxExtracted / TaxAdded       │
//! │                                                                         │
//! │   base = qty × price_list_rate        (never off a discounted rate)     │
//! │   pct > 0   → discount = base × pct / 100                               │
//! │   amount>0  → keep amount, pct = amount / base × 100                    │
//! │                                                                         │
//! │   Exclusive:  net = base - discount                                     │
//! │               tax = net × r / 100                                       │
//! │               rate = net / qty                                          │
//! │                                                                         │
//! │   Inclusive:  gross = base - discount                                   │
//! │               net = gross / (1 + r / 100)                               │
//! │               tax = gross - net                                         │
//! │               rate = (net + tax) / qty                                  │
//! │                                                                         │
//! │   amount = net                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Aggregate Maintenance
//! ```text
//! single-line edit ──► contribution(before) ──► recalc ──► contribution(after)
//!                                                              │
//!                       cache += after - before  ◄─────────────┘
//!
//! bulk edit (tax rules, server pricing, free items)
//!      │
//!      ▼
//! dirty = true ──► touch every line ──► rebuild_aggregates() ──► dirty = false
//! ```
//!
//! Every mutation is a `&mut self` call that applies the cache delta before
//! returning, so no other mutation can interleave between a line edit and
//! its aggregate update.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::types::{
    CatalogItem, CouponDiscount, DiscountValue, FreeItem, ItemDetails, PaymentEntry,
    ServerLineResult, TaxMode, TaxRule,
};
use crate::validation::{
    validate_code, validate_discount, validate_payment_amount, validate_quantity, validate_rate,
};

/// An invoice counts as fully paid when no more than this remains.
pub const PAYMENT_TOLERANCE: f64 = 0.01;

/// Tolerance used when comparing incrementally maintained aggregates.
pub const AGGREGATE_EPSILON: f64 = 1e-6;

// =============================================================================
// Invoice Line
// =============================================================================

/// A line on the active invoice.
///
/// `rate`, `tax_amount` and `amount` are derived. Discount is stored as both
/// percentage and amount; whichever was set last is the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InvoiceLine {
    pub item_code: String,
    pub item_name: String,
    pub quantity: f64,
    /// Undiscounted reference price.
    pub price_list_rate: f64,
    /// Effective unit price after discount (and tax when inclusive).
    pub rate: f64,
    pub discount_percentage: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    /// Net line amount.
    pub amount: f64,
    pub uom: Option<String>,
    pub conversion_factor: f64,
    pub warehouse: Option<String>,
    /// Names of server pricing rules applied to this line.
    pub pricing_rules: Vec<String>,
    pub is_free_item: bool,
}

impl InvoiceLine {
    /// Builds an undiscounted line for `item`. Call [`recalculate`] before use.
    ///
    /// [`recalculate`]: InvoiceLine::recalculate
    pub fn from_item(item: &CatalogItem, quantity: f64) -> Self {
        InvoiceLine {
            item_code: item.item_code.clone(),
            item_name: item.item_name.clone(),
            quantity,
            price_list_rate: item.reference_price(),
            rate: item.reference_price(),
            discount_percentage: 0.0,
            discount_amount: 0.0,
            tax_amount: 0.0,
            amount: 0.0,
            uom: item.uom.clone().or_else(|| item.stock_uom.clone()),
            conversion_factor: if item.conversion_factor > 0.0 {
                item.conversion_factor
            } else {
                1.0
            },
            warehouse: item.warehouse.clone(),
            pricing_rules: Vec::new(),
            is_free_item: false,
        }
    }

    fn free(item: &FreeItem, warehouse: Option<String>) -> Self {
        InvoiceLine {
            item_code: item.item_code.clone(),
            item_name: item.item_name.clone(),
            quantity: item.qty,
            price_list_rate: 0.0,
            rate: 0.0,
            discount_percentage: 0.0,
            discount_amount: 0.0,
            tax_amount: 0.0,
            amount: 0.0,
            uom: item.uom.clone(),
            conversion_factor: 1.0,
            warehouse,
            pricing_rules: item.pricing_rule.iter().cloned().collect(),
            is_free_item: true,
        }
    }

    /// `quantity × price_list_rate`.
    #[inline]
    pub fn base_amount(&self) -> f64 {
        self.quantity * self.price_list_rate
    }

    /// Quantity in stock UOM, used for reservations.
    #[inline]
    pub fn stock_qty(&self) -> f64 {
        self.quantity * self.conversion_factor
    }

    /// Recomputes discount, tax, amount and rate from the reference price.
    pub fn recalculate(&mut self, tax_rate: f64, mode: TaxMode) {
        let base = self.base_amount();

        if self.discount_percentage > 0.0 {
            self.discount_percentage = self.discount_percentage.min(100.0);
            self.discount_amount = base * self.discount_percentage / 100.0;
        } else if self.discount_amount > 0.0 {
            self.discount_amount = self.discount_amount.min(base.max(0.0));
            self.discount_percentage = if base > 0.0 {
                self.discount_amount / base * 100.0
            } else {
                0.0
            };
        } else {
            self.discount_percentage = 0.0;
            self.discount_amount = 0.0;
        }

        let after_discount = base - self.discount_amount;
        let (net, tax) = match mode {
            TaxMode::Inclusive if tax_rate > 0.0 => {
                let net = after_discount / (1.0 + tax_rate / 100.0);
                (net, after_discount - net)
            }
            _ => (after_discount, after_discount * tax_rate / 100.0),
        };

        self.amount = net;
        self.tax_amount = tax;
        self.rate = if self.quantity > 0.0 {
            match mode {
                TaxMode::Inclusive => (net + tax) / self.quantity,
                TaxMode::Exclusive => net / self.quantity,
            }
        } else {
            0.0
        };
    }

    fn clear_discount(&mut self) {
        self.discount_percentage = 0.0;
        self.discount_amount = 0.0;
    }

    fn contribution(&self) -> LineContribution {
        LineContribution {
            base: self.base_amount(),
            tax: self.tax_amount,
            discount: self.discount_amount,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LineContribution {
    base: f64,
    tax: f64,
    discount: f64,
}

// =============================================================================
// Aggregates
// =============================================================================

/// Incrementally maintained invoice sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CachedAggregates {
    /// Σ quantity × price_list_rate (pre-discount, any regime).
    pub subtotal: f64,
    pub total_tax: f64,
    /// Σ line discount amounts (excludes the additional discount).
    pub line_discount: f64,
    pub total_paid: f64,
}

impl CachedAggregates {
    fn apply_delta(&mut self, before: LineContribution, after: LineContribution) {
        self.subtotal += after.base - before.base;
        self.total_tax += after.tax - before.tax;
        self.line_discount += after.discount - before.discount;
    }

    /// Field-wise comparison within `epsilon`.
    pub fn approx_eq(&self, other: &CachedAggregates, epsilon: f64) -> bool {
        (self.subtotal - other.subtotal).abs() <= epsilon
            && (self.total_tax - other.total_tax).abs() <= epsilon
            && (self.line_discount - other.line_discount).abs() <= epsilon
            && (self.total_paid - other.total_paid).abs() <= epsilon
    }
}

/// Invoice totals as shown to the cashier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Totals {
    pub subtotal: f64,
    pub total_tax: f64,
    /// Line discounts plus the additional discount.
    pub total_discount: f64,
    pub additional_discount: f64,
    pub grand_total: f64,
    pub total_paid: f64,
    /// `grand_total - total_paid`; negative when change is due.
    pub remaining: f64,
    pub change_amount: f64,
}

// =============================================================================
// Backend Document
// =============================================================================

/// An invoice line as sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentLine {
    pub item_code: String,
    #[serde(default)]
    pub item_name: String,
    pub qty: f64,
    pub rate: f64,
    pub price_list_rate: f64,
    #[serde(default)]
    pub discount_percentage: f64,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub uom: Option<String>,
    #[serde(default)]
    pub conversion_factor: f64,
    #[serde(default)]
    pub warehouse: Option<String>,
    /// Comma-separated rule names, as the backend stores them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_rules: Option<String>,
    #[serde(default)]
    pub is_free_item: u8,
}

/// The draft payload for `invoices.update_invoice`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDocument {
    pub doctype: String,
    /// Backend draft name once phase 1 succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub pos_profile: Option<String>,
    #[serde(default)]
    pub posa_pos_opening_shift: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    pub items: Vec<DocumentLine>,
    #[serde(default)]
    pub payments: Vec<PaymentEntry>,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_discount_on: Option<String>,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub is_pos: u8,
    #[serde(default)]
    pub update_stock: u8,
    #[serde(default)]
    pub grand_total: f64,
    #[serde(default)]
    pub change_amount: f64,
}

impl InvoiceDocument {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Stock quantities sold per `(item_code, warehouse)`.
    pub fn stock_movements(&self) -> Vec<(String, Option<String>, f64)> {
        self.items
            .iter()
            .map(|line| {
                let factor = if line.conversion_factor > 0.0 {
                    line.conversion_factor
                } else {
                    1.0
                };
                (line.item_code.clone(), line.warehouse.clone(), line.qty * factor)
            })
            .collect()
    }
}

// =============================================================================
// Invoice
// =============================================================================

/// The active, unsubmitted invoice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Invoice {
    customer: Option<String>,
    pos_profile: Option<String>,
    pos_opening_shift: Option<String>,
    draft_name: Option<String>,
    lines: Vec<InvoiceLine>,
    payments: Vec<PaymentEntry>,
    /// Effective additional discount, never above the subtotal.
    additional_discount: f64,
    /// What the cashier typed. Survives the subtotal dipping below it.
    #[serde(default)]
    manual_discount: f64,
    coupon: Option<CouponDiscount>,
    tax_rules: Vec<TaxRule>,
    tax_rate: f64,
    tax_mode: TaxMode,
    offers: Vec<String>,
    applied_pricing_rules: Vec<String>,
    #[serde(skip)]
    cache: CachedAggregates,
    #[serde(skip)]
    dirty: bool,
}

impl Invoice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an invoice bound to a POS profile and opening shift.
    pub fn for_profile(pos_profile: impl Into<String>, opening_shift: Option<String>) -> Self {
        Invoice {
            pos_profile: Some(pos_profile.into()),
            pos_opening_shift: opening_shift,
            ..Self::default()
        }
    }

    /// Restores an invoice saved with `serde_json::to_value`.
    pub fn restore(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut invoice: Invoice = serde_json::from_value(value)?;
        if invoice.coupon.is_none() && invoice.manual_discount == 0.0 {
            invoice.manual_discount = invoice.additional_discount;
        }
        invoice.rebuild_aggregates();
        Ok(invoice)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn lines(&self) -> &[InvoiceLine] {
        &self.lines
    }

    pub fn line(&self, index: usize) -> Option<&InvoiceLine> {
        self.lines.get(index)
    }

    pub fn payments(&self) -> &[PaymentEntry] {
        &self.payments
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn customer(&self) -> Option<&str> {
        self.customer.as_deref()
    }

    pub fn set_customer(&mut self, customer: Option<String>) {
        self.customer = customer;
    }

    pub fn pos_profile(&self) -> Option<&str> {
        self.pos_profile.as_deref()
    }

    pub fn draft_name(&self) -> Option<&str> {
        self.draft_name.as_deref()
    }

    pub fn set_draft_name(&mut self, name: Option<String>) {
        self.draft_name = name;
    }

    pub fn tax_mode(&self) -> TaxMode {
        self.tax_mode
    }

    /// Sum of the client-applicable tax rates, in percent.
    pub fn tax_rate(&self) -> f64 {
        self.tax_rate
    }

    pub fn coupon(&self) -> Option<&CouponDiscount> {
        self.coupon.as_ref()
    }

    pub fn offers(&self) -> &[String] {
        &self.offers
    }

    pub fn applied_pricing_rules(&self) -> &[String] {
        &self.applied_pricing_rules
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // =========================================================================
    // Line Mutations (incremental)
    // =========================================================================

    /// Adds `quantity` of `item`, merging into an existing line with the same
    /// item code and UOM. Returns the line position.
    pub fn add_item(&mut self, item: &CatalogItem, quantity: f64) -> CoreResult<usize> {
        validate_code(&item.item_code, "item_code")?;
        validate_quantity(quantity)?;
        validate_rate(item.reference_price())?;

        let uom = item.uom.clone().or_else(|| item.stock_uom.clone());
        let existing = self
            .lines
            .iter()
            .position(|l| !l.is_free_item && l.item_code == item.item_code && l.uom == uom);

        if let Some(index) = existing {
            let merged = self.lines[index].quantity + quantity;
            self.mutate_line(index, |line| line.quantity = merged)?;
            return Ok(index);
        }

        let mut line = InvoiceLine::from_item(item, quantity);
        line.recalculate(self.tax_rate, self.tax_mode);
        self.cache
            .apply_delta(LineContribution::default(), line.contribution());
        self.lines.push(line);
        self.refresh_additional_discount();
        Ok(self.lines.len() - 1)
    }

    /// Like [`add_item`](Invoice::add_item) but rejects quantities above the
    /// available display stock.
    pub fn add_item_checked(
        &mut self,
        item: &CatalogItem,
        quantity: f64,
        available: f64,
    ) -> CoreResult<usize> {
        validate_quantity(quantity)?;
        if quantity > available + AGGREGATE_EPSILON {
            return Err(CoreError::InsufficientStock {
                item_code: item.item_code.clone(),
                available: available.max(0.0),
                requested: quantity,
            });
        }
        self.add_item(item, quantity)
    }

    pub fn remove_line(&mut self, index: usize) -> CoreResult<InvoiceLine> {
        if index >= self.lines.len() {
            return Err(CoreError::LineNotFound {
                index,
                len: self.lines.len(),
            });
        }
        let line = self.lines.remove(index);
        self.cache
            .apply_delta(line.contribution(), LineContribution::default());
        self.refresh_additional_discount();
        Ok(line)
    }

    pub fn set_quantity(&mut self, index: usize, quantity: f64) -> CoreResult<()> {
        validate_quantity(quantity)?;
        self.mutate_line(index, |line| line.quantity = quantity)
    }

    /// Sets the line's reference price. Discount and tax follow from it.
    pub fn set_rate(&mut self, index: usize, rate: f64) -> CoreResult<()> {
        validate_rate(rate)?;
        self.mutate_line(index, |line| line.price_list_rate = rate)
    }

    /// Manual percentage discount, clamped to `0..=100`.
    pub fn set_discount_percentage(&mut self, index: usize, pct: f64) -> CoreResult<()> {
        validate_discount(pct)?;
        let pct = pct.clamp(0.0, 100.0);
        self.mutate_line(index, |line| {
            line.discount_percentage = pct;
            line.discount_amount = 0.0;
        })
    }

    /// Manual fixed discount, clamped to `0..=base`. Percentage is
    /// back-computed.
    pub fn set_discount_amount(&mut self, index: usize, amount: f64) -> CoreResult<()> {
        validate_discount(amount)?;
        self.mutate_line(index, |line| {
            let base = line.base_amount().max(0.0);
            line.discount_percentage = 0.0;
            line.discount_amount = amount.clamp(0.0, base);
        })
    }

    /// Switches a line to a different UOM as quoted by the backend.
    pub fn set_uom(&mut self, index: usize, details: &ItemDetails) -> CoreResult<()> {
        validate_code(&details.uom, "uom")?;
        validate_rate(details.price_list_rate)?;
        validate_quantity(details.conversion_factor)?;
        self.mutate_line(index, |line| {
            line.uom = Some(details.uom.clone());
            line.conversion_factor = details.conversion_factor;
            line.price_list_rate = details.price_list_rate;
        })
    }

    fn mutate_line<F>(&mut self, index: usize, edit: F) -> CoreResult<()>
    where
        F: FnOnce(&mut InvoiceLine),
    {
        let len = self.lines.len();
        let (tax_rate, mode) = (self.tax_rate, self.tax_mode);
        let line = self
            .lines
            .get_mut(index)
            .ok_or(CoreError::LineNotFound { index, len })?;

        let before = line.contribution();
        edit(line);
        line.recalculate(tax_rate, mode);
        let after = line.contribution();

        self.cache.apply_delta(before, after);
        self.refresh_additional_discount();
        Ok(())
    }

    // =========================================================================
    // Bulk Mutations (rebuild)
    // =========================================================================

    /// Replaces the tax rules and recomputes every line.
    pub fn set_tax_rules(&mut self, rules: &[TaxRule]) {
        self.tax_rules = rules.to_vec();
        self.tax_rate = TaxRule::total_rate(rules);
        self.recalculate_all();
    }

    pub fn tax_rules(&self) -> &[TaxRule] {
        &self.tax_rules
    }

    /// Switches the tax regime for the whole invoice.
    pub fn set_tax_mode(&mut self, mode: TaxMode) {
        if self.tax_mode == mode {
            return;
        }
        self.tax_mode = mode;
        self.recalculate_all();
    }

    /// Applies per-line server pricing, matched by position.
    ///
    /// A line is only overwritten when the server matched something on it. A
    /// line that carried server rules and is no longer matched drops that
    /// server discount; manual discounts on unmatched lines are untouched.
    /// Returns the number of lines the server matched.
    pub fn apply_server_pricing(&mut self, results: &[ServerLineResult]) -> usize {
        self.dirty = true;
        let mut matched = 0;

        for (line, result) in self.lines.iter_mut().zip(results) {
            if line.is_free_item {
                continue;
            }
            if result.has_match() {
                line.discount_percentage = result.discount_percentage.max(0.0);
                line.discount_amount = if result.discount_percentage > 0.0 {
                    0.0
                } else {
                    result.discount_amount.max(0.0)
                };
                line.pricing_rules = result.pricing_rules.clone();
                matched += 1;
            } else if !line.pricing_rules.is_empty() {
                line.clear_discount();
                line.pricing_rules.clear();
            }
        }

        self.recalculate_all();
        matched
    }

    /// Drops every server-applied discount and free item.
    pub fn clear_server_pricing(&mut self) {
        self.dirty = true;
        self.lines.retain(|l| !l.is_free_item);
        for line in self.lines.iter_mut().filter(|l| !l.pricing_rules.is_empty()) {
            line.clear_discount();
            line.pricing_rules.clear();
        }
        self.applied_pricing_rules.clear();
        self.recalculate_all();
    }

    /// Replaces the free lines granted by pricing rules.
    pub fn set_free_items(&mut self, items: &[FreeItem]) {
        self.dirty = true;
        self.lines.retain(|l| !l.is_free_item);
        let warehouse = self.lines.iter().find_map(|l| l.warehouse.clone());
        self.lines.extend(
            items
                .iter()
                .filter(|f| f.qty > 0.0)
                .map(|f| InvoiceLine::free(f, warehouse.clone())),
        );
        self.recalculate_all();
    }

    /// Removes the free lines so that positions line up with the paid lines.
    pub fn clear_free_items(&mut self) {
        if self.lines.iter().any(|l| l.is_free_item) {
            self.set_free_items(&[]);
        }
    }

    pub fn set_applied_pricing_rules(&mut self, rules: Vec<String>) {
        self.applied_pricing_rules = rules;
    }

    fn recalculate_all(&mut self) {
        self.dirty = true;
        let (tax_rate, mode) = (self.tax_rate, self.tax_mode);
        for line in &mut self.lines {
            line.recalculate(tax_rate, mode);
        }
        self.rebuild_aggregates();
    }

    // =========================================================================
    // Offers, Coupons & Additional Discount
    // =========================================================================

    /// Selects an offer code. Returns false if it was already selected.
    pub fn add_offer(&mut self, code: &str) -> CoreResult<bool> {
        validate_code(code, "offer")?;
        if self.offers.iter().any(|o| o == code) {
            return Ok(false);
        }
        self.offers.push(code.to_string());
        Ok(true)
    }

    /// Deselects an offer code. Returns false if it was not selected.
    pub fn remove_offer(&mut self, code: &str) -> bool {
        let before = self.offers.len();
        self.offers.retain(|o| o != code);
        self.offers.len() != before
    }

    /// Applies a coupon as the additional discount. Returns the amount.
    pub fn apply_coupon(&mut self, coupon: CouponDiscount) -> CoreResult<f64> {
        validate_code(&coupon.code, "coupon_code")?;
        match coupon.discount {
            DiscountValue::Percentage(v) | DiscountValue::Fixed(v) => validate_discount(v)?,
        }
        self.coupon = Some(coupon);
        self.manual_discount = 0.0;
        self.refresh_additional_discount();
        Ok(self.additional_discount)
    }

    pub fn remove_coupon(&mut self) {
        self.coupon = None;
        self.manual_discount = 0.0;
        self.additional_discount = 0.0;
    }

    /// Manual grand-total discount. Replaces any coupon. Returns the amount
    /// in effect, which is capped at the current subtotal.
    pub fn set_additional_discount(&mut self, amount: f64) -> CoreResult<f64> {
        validate_discount(amount)?;
        self.coupon = None;
        self.manual_discount = amount;
        self.refresh_additional_discount();
        Ok(self.additional_discount)
    }

    fn refresh_additional_discount(&mut self) {
        let subtotal = self.aggregates().subtotal.max(0.0);
        self.additional_discount = match &self.coupon {
            Some(coupon) => coupon.discount.amount_on(subtotal),
            None => self.manual_discount.clamp(0.0, subtotal),
        };
    }

    // =========================================================================
    // Payments
    // =========================================================================

    pub fn add_payment(&mut self, payment: PaymentEntry) -> CoreResult<usize> {
        validate_payment_amount(payment.amount)?;
        self.cache.total_paid += payment.amount;
        self.payments.push(payment);
        Ok(self.payments.len() - 1)
    }

    pub fn remove_payment(&mut self, index: usize) -> CoreResult<PaymentEntry> {
        if index >= self.payments.len() {
            return Err(CoreError::PaymentNotFound {
                index,
                len: self.payments.len(),
            });
        }
        let payment = self.payments.remove(index);
        self.cache.total_paid -= payment.amount;
        Ok(payment)
    }

    pub fn update_payment(&mut self, index: usize, amount: f64) -> CoreResult<()> {
        validate_payment_amount(amount)?;
        let len = self.payments.len();
        let payment = self
            .payments
            .get_mut(index)
            .ok_or(CoreError::PaymentNotFound { index, len })?;
        self.cache.total_paid += amount - payment.amount;
        payment.amount = amount;
        Ok(())
    }

    // =========================================================================
    // Totals
    // =========================================================================

    /// Recomputes every aggregate by iterating lines and payments.
    pub fn rebuild_from_scratch(&self) -> CachedAggregates {
        let mut aggregates = CachedAggregates::default();
        for line in &self.lines {
            aggregates.subtotal += line.base_amount();
            aggregates.total_tax += line.tax_amount;
            aggregates.line_discount += line.discount_amount;
        }
        aggregates.total_paid = self.payments.iter().map(|p| p.amount).sum();
        aggregates
    }

    /// Replaces the cached aggregates with a full recomputation.
    pub fn rebuild_aggregates(&mut self) {
        self.cache = self.rebuild_from_scratch();
        self.dirty = false;
        self.refresh_additional_discount();
    }

    /// Current aggregates. Falls back to a full sum while a bulk edit is open.
    pub fn aggregates(&self) -> CachedAggregates {
        if self.dirty {
            self.rebuild_from_scratch()
        } else {
            self.cache
        }
    }

    pub fn totals(&self) -> Totals {
        let agg = self.aggregates();
        let total_discount = agg.line_discount + self.additional_discount;
        let grand_total = match self.tax_mode {
            TaxMode::Inclusive => agg.subtotal - total_discount,
            TaxMode::Exclusive => agg.subtotal + agg.total_tax - total_discount,
        };
        let remaining = grand_total - agg.total_paid;

        Totals {
            subtotal: agg.subtotal,
            total_tax: agg.total_tax,
            total_discount,
            additional_discount: self.additional_discount,
            grand_total,
            total_paid: agg.total_paid,
            remaining,
            change_amount: if remaining < 0.0 { -remaining } else { 0.0 },
        }
    }

    pub fn grand_total(&self) -> f64 {
        self.totals().grand_total
    }

    pub fn remaining(&self) -> f64 {
        self.totals().remaining
    }

    pub fn change_amount(&self) -> f64 {
        self.totals().change_amount
    }

    /// Has lines and is paid to within [`PAYMENT_TOLERANCE`].
    pub fn can_submit(&self) -> bool {
        !self.lines.is_empty() && self.remaining() <= PAYMENT_TOLERANCE
    }

    // =========================================================================
    // Reservations & Lifecycle
    // =========================================================================

    /// Stock quantity held by this cart, summed per item code.
    pub fn reservations(&self) -> HashMap<String, f64> {
        let mut reserved: HashMap<String, f64> = HashMap::new();
        for line in &self.lines {
            *reserved.entry(line.item_code.clone()).or_insert(0.0) += line.stock_qty();
        }
        reserved
    }

    /// Resets the cart. Profile, shift and tax settings survive.
    pub fn clear(&mut self) {
        self.customer = None;
        self.draft_name = None;
        self.lines.clear();
        self.payments.clear();
        self.additional_discount = 0.0;
        self.manual_discount = 0.0;
        self.coupon = None;
        self.offers.clear();
        self.applied_pricing_rules.clear();
        self.cache = CachedAggregates::default();
        self.dirty = false;
    }

    /// Builds the backend draft payload.
    pub fn to_document(&self) -> InvoiceDocument {
        let totals = self.totals();
        let items = self
            .lines
            .iter()
            .map(|line| DocumentLine {
                item_code: line.item_code.clone(),
                item_name: line.item_name.clone(),
                qty: line.quantity,
                rate: line.rate,
                price_list_rate: line.price_list_rate,
                discount_percentage: line.discount_percentage,
                discount_amount: line.discount_amount,
                amount: line.amount,
                uom: line.uom.clone(),
                conversion_factor: line.conversion_factor,
                warehouse: line.warehouse.clone(),
                pricing_rules: if line.pricing_rules.is_empty() {
                    None
                } else {
                    Some(line.pricing_rules.join(","))
                },
                is_free_item: u8::from(line.is_free_item),
            })
            .collect();

        InvoiceDocument {
            doctype: "Sales Invoice".to_string(),
            name: self.draft_name.clone(),
            pos_profile: self.pos_profile.clone(),
            posa_pos_opening_shift: self.pos_opening_shift.clone(),
            customer: self.customer.clone(),
            items,
            payments: self.payments.clone(),
            discount_amount: self.additional_discount,
            apply_discount_on: (self.additional_discount > 0.0)
                .then(|| "Grand Total".to_string()),
            coupon_code: self.coupon.as_ref().map(|c| c.code.clone()),
            is_pos: 1,
            update_stock: 1,
            grand_total: totals.grand_total,
            change_amount: totals.change_amount,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < AGGREGATE_EPSILON
    }

    fn item(code: &str, price: f64) -> CatalogItem {
        CatalogItem::new(code, code.to_lowercase(), price)
    }

    fn vat(rate: f64) -> Vec<TaxRule> {
        vec![TaxRule::new("On Net Total", rate)]
    }

    fn assert_cache_consistent(invoice: &Invoice) {
        assert!(
            invoice
                .aggregates()
                .approx_eq(&invoice.rebuild_from_scratch(), AGGREGATE_EPSILON),
            "cache {:?} != rebuild {:?}",
            invoice.aggregates(),
            invoice.rebuild_from_scratch()
        );
    }

    #[test]
    fn test_exclusive_tax_single_line() {
        let mut invoice = Invoice::new();
        invoice.set_tax_rules(&vat(10.0));
        invoice.add_item(&item("A", 100.0), 1.0).unwrap();

        let line = invoice.line(0).unwrap();
        assert!(approx(line.amount, 100.0));
        assert!(approx(line.tax_amount, 10.0));
        assert!(approx(invoice.grand_total(), 110.0));
    }

    #[test]
    fn test_inclusive_tax_single_line() {
        let mut invoice = Invoice::new();
        invoice.set_tax_mode(TaxMode::Inclusive);
        invoice.set_tax_rules(&vat(10.0));
        invoice.add_item(&item("A", 100.0), 1.0).unwrap();

        let line = invoice.line(0).unwrap();
        assert!((line.amount - 90.909).abs() < 1e-3);
        assert!((line.tax_amount - 9.091).abs() < 1e-3);
        assert!(approx(line.rate, 100.0));
        assert!(approx(invoice.grand_total(), 100.0));
    }

    #[test]
    fn test_switching_tax_mode_recomputes_lines() {
        let mut invoice = Invoice::new();
        invoice.set_tax_rules(&vat(10.0));
        invoice.add_item(&item("A", 100.0), 1.0).unwrap();
        assert!(approx(invoice.grand_total(), 110.0));

        invoice.set_tax_mode(TaxMode::Inclusive);
        assert!(approx(invoice.grand_total(), 100.0));
        assert_cache_consistent(&invoice);
    }

    #[test]
    fn test_discount_applied_before_tax() {
        let mut invoice = Invoice::new();
        invoice.set_tax_rules(&vat(5.0));
        invoice.add_item(&item("A", 100.0), 2.0).unwrap();
        invoice.set_discount_percentage(0, 10.0).unwrap();

        let line = invoice.line(0).unwrap();
        assert!(approx(line.base_amount(), 200.0));
        assert!(approx(line.discount_amount, 20.0));
        assert!(approx(line.amount, 180.0));
        assert!(approx(line.tax_amount, 9.0));
        assert!(approx(line.rate, 90.0));
        assert!(approx(invoice.grand_total(), 189.0));
    }

    #[test]
    fn test_discount_does_not_compound_on_recalculation() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("A", 100.0), 1.0).unwrap();
        invoice.set_discount_percentage(0, 10.0).unwrap();
        invoice.set_tax_rules(&vat(5.0));
        invoice.set_tax_rules(&vat(5.0));
        invoice.set_quantity(0, 1.0).unwrap();

        let line = invoice.line(0).unwrap();
        assert!(approx(line.price_list_rate, 100.0));
        assert!(approx(line.discount_amount, 10.0));
    }

    #[test]
    fn test_fixed_discount_back_computes_percentage() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("A", 50.0), 4.0).unwrap();
        invoice.set_discount_amount(0, 30.0).unwrap();

        let line = invoice.line(0).unwrap();
        assert!(approx(line.discount_amount, 30.0));
        assert!(approx(line.discount_percentage, 15.0));

        invoice.set_discount_amount(0, 1_000.0).unwrap();
        assert!(approx(invoice.line(0).unwrap().discount_amount, 200.0));
    }

    #[test]
    fn test_aggregates_match_rebuild_after_mutations() {
        let mut invoice = Invoice::new();
        invoice.set_tax_rules(&vat(17.0));
        invoice.add_item(&item("A", 12.5), 3.0).unwrap();
        invoice.add_item(&item("B", 99.99), 1.0).unwrap();
        invoice.add_item(&item("C", 0.3), 7.0).unwrap();
        assert_cache_consistent(&invoice);

        invoice.set_quantity(1, 2.5).unwrap();
        invoice.set_discount_percentage(0, 12.0).unwrap();
        invoice.set_discount_amount(2, 0.5).unwrap();
        invoice.set_rate(1, 89.0).unwrap();
        assert_cache_consistent(&invoice);

        invoice.add_item(&item("A", 12.5), 1.0).unwrap();
        invoice.remove_line(2).unwrap();
        invoice.add_payment(PaymentEntry::new("Cash", 100.0)).unwrap();
        invoice.add_payment(PaymentEntry::new("Card", 20.0)).unwrap();
        invoice.update_payment(0, 150.0).unwrap();
        invoice.remove_payment(1).unwrap();
        assert_cache_consistent(&invoice);

        invoice.set_tax_mode(TaxMode::Inclusive);
        invoice.set_quantity(0, 1.0).unwrap();
        assert_cache_consistent(&invoice);
        assert!(!invoice.is_dirty());
    }

    #[test]
    fn test_add_item_merges_same_code_and_uom() {
        let mut invoice = Invoice::new();
        let coke = item("COKE", 2.0);
        assert_eq!(invoice.add_item(&coke, 1.0).unwrap(), 0);
        assert_eq!(invoice.add_item(&coke, 2.0).unwrap(), 0);
        assert_eq!(invoice.len(), 1);
        assert!(approx(invoice.line(0).unwrap().quantity, 3.0));

        let mut crate_of_coke = coke.clone();
        crate_of_coke.uom = Some("Crate".to_string());
        assert_eq!(invoice.add_item(&crate_of_coke, 1.0).unwrap(), 1);
    }

    #[test]
    fn test_add_item_checked_rejects_over_stock() {
        let mut invoice = Invoice::new();
        let err = invoice
            .add_item_checked(&item("COKE", 2.0), 5.0, 3.0)
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientStock { .. }));
        assert!(invoice.is_empty());

        invoice.add_item_checked(&item("COKE", 2.0), 3.0, 3.0).unwrap();
        assert_eq!(invoice.len(), 1);
    }

    #[test]
    fn test_invalid_edits_are_rejected() {
        let mut invoice = Invoice::new();
        assert!(invoice.add_item(&item("A", 1.0), 0.0).is_err());
        assert!(matches!(
            invoice.set_quantity(3, 1.0),
            Err(CoreError::LineNotFound { index: 3, len: 0 })
        ));
        invoice.add_item(&item("A", 1.0), 1.0).unwrap();
        assert!(invoice.set_rate(0, f64::NAN).is_err());
        assert_cache_consistent(&invoice);
    }

    #[test]
    fn test_server_pricing_applied_by_position() {
        let mut invoice = Invoice::new();
        let a = item("A", 100.0);
        invoice.add_item(&a, 1.0).unwrap();
        let mut a_box = a.clone();
        a_box.uom = Some("Box".to_string());
        invoice.add_item(&a_box, 1.0).unwrap();

        let results = vec![
            ServerLineResult::default(),
            ServerLineResult {
                discount_percentage: 20.0,
                discount_amount: 0.0,
                pricing_rules: vec!["PR-0001".to_string()],
            },
        ];
        assert_eq!(invoice.apply_server_pricing(&results), 1);
        assert!(approx(invoice.line(0).unwrap().discount_amount, 0.0));
        assert!(approx(invoice.line(1).unwrap().discount_amount, 20.0));
    }

    #[test]
    fn test_server_pricing_is_idempotent() {
        let mut invoice = Invoice::new();
        invoice.set_tax_rules(&vat(10.0));
        invoice.add_item(&item("A", 40.0), 2.0).unwrap();
        invoice.add_item(&item("B", 10.0), 1.0).unwrap();

        let results = vec![
            ServerLineResult {
                discount_percentage: 10.0,
                discount_amount: 0.0,
                pricing_rules: vec!["PR-A".to_string()],
            },
            ServerLineResult {
                discount_percentage: 0.0,
                discount_amount: 2.0,
                pricing_rules: vec!["PR-B".to_string()],
            },
        ];

        invoice.apply_server_pricing(&results);
        let first = invoice.totals().total_discount;
        invoice.apply_server_pricing(&results);
        let second = invoice.totals().total_discount;

        assert!(approx(first, 10.0));
        assert!(approx(first, second));
        assert_cache_consistent(&invoice);
    }

    #[test]
    fn test_server_pricing_keeps_manual_discount_without_match() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("A", 100.0), 1.0).unwrap();
        invoice.set_discount_percentage(0, 5.0).unwrap();

        invoice.apply_server_pricing(&[ServerLineResult::default()]);
        assert!(approx(invoice.line(0).unwrap().discount_amount, 5.0));
    }

    #[test]
    fn test_server_pricing_drops_stale_rule_discount() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("A", 100.0), 1.0).unwrap();
        invoice.apply_server_pricing(&[ServerLineResult {
            discount_percentage: 15.0,
            discount_amount: 0.0,
            pricing_rules: vec!["PR-1".to_string()],
        }]);
        assert!(approx(invoice.totals().total_discount, 15.0));

        invoice.apply_server_pricing(&[ServerLineResult::default()]);
        let line = invoice.line(0).unwrap();
        assert!(approx(line.discount_amount, 0.0));
        assert!(line.pricing_rules.is_empty());
    }

    #[test]
    fn test_free_items_replace_previous_free_lines() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("A", 10.0), 2.0).unwrap();
        let free = FreeItem {
            item_code: "GIFT".to_string(),
            item_name: "Gift".to_string(),
            qty: 1.0,
            uom: None,
            pricing_rule: Some("PR-GIFT".to_string()),
        };
        invoice.set_free_items(&[free.clone()]);
        invoice.set_free_items(&[free]);

        assert_eq!(invoice.len(), 2);
        assert!(invoice.line(1).unwrap().is_free_item);
        assert!(approx(invoice.totals().subtotal, 20.0));

        invoice.clear_free_items();
        assert_eq!(invoice.len(), 1);
    }

    #[test]
    fn test_coupon_is_clamped_to_subtotal() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("A", 30.0), 1.0).unwrap();

        let applied = invoice
            .apply_coupon(CouponDiscount {
                code: "BIG".to_string(),
                discount: DiscountValue::Fixed(50.0),
            })
            .unwrap();
        assert!(approx(applied, 30.0));
        assert!(approx(invoice.grand_total(), 0.0));

        invoice
            .apply_coupon(CouponDiscount {
                code: "TEN".to_string(),
                discount: DiscountValue::Percentage(10.0),
            })
            .unwrap();
        invoice.set_quantity(0, 2.0).unwrap();
        assert!(approx(invoice.totals().additional_discount, 6.0));
        assert_eq!(invoice.to_document().coupon_code.as_deref(), Some("TEN"));

        invoice.remove_coupon();
        assert!(approx(invoice.grand_total(), 60.0));
    }

    #[test]
    fn test_manual_discount_survives_subtotal_dip() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("A", 100.0), 1.0).unwrap();
        assert!(approx(invoice.set_additional_discount(20.0).unwrap(), 20.0));

        invoice.remove_line(0).unwrap();
        assert!(approx(invoice.totals().additional_discount, 0.0));

        invoice.add_item(&item("A", 100.0), 1.0).unwrap();
        assert!(approx(invoice.totals().additional_discount, 20.0));
        assert!(approx(invoice.grand_total(), 80.0));
    }

    #[test]
    fn test_manual_discount_recovers_after_rate_drop() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("A", 100.0), 1.0).unwrap();
        invoice.set_additional_discount(20.0).unwrap();

        invoice.set_rate(0, 10.0).unwrap();
        assert!(approx(invoice.totals().additional_discount, 10.0));
        assert!(approx(invoice.grand_total(), 0.0));

        invoice.set_rate(0, 100.0).unwrap();
        assert!(approx(invoice.totals().additional_discount, 20.0));

        let restored = Invoice::restore(serde_json::to_value(&invoice).unwrap()).unwrap();
        assert!(approx(restored.totals().additional_discount, 20.0));
    }

    #[test]
    fn test_payments_and_change() {
        let mut invoice = Invoice::new();
        assert!(!invoice.can_submit());

        invoice.add_item(&item("A", 45.0), 1.0).unwrap();
        invoice.add_payment(PaymentEntry::new("Cash", 40.0)).unwrap();
        assert!(!invoice.can_submit());
        assert!(approx(invoice.remaining(), 5.0));

        invoice.update_payment(0, 50.0).unwrap();
        assert!(invoice.can_submit());
        assert!(approx(invoice.change_amount(), 5.0));

        invoice.update_payment(0, 44.995).unwrap();
        assert!(invoice.can_submit());
    }

    #[test]
    fn test_uom_change_requotes_line() {
        let mut invoice = Invoice::new();
        invoice.add_item(&item("WATER", 1.0), 2.0).unwrap();
        invoice
            .set_uom(
                0,
                &ItemDetails {
                    uom: "Pack".to_string(),
                    conversion_factor: 6.0,
                    price_list_rate: 5.5,
                },
            )
            .unwrap();

        let line = invoice.line(0).unwrap();
        assert!(approx(line.amount, 11.0));
        assert!(approx(line.stock_qty(), 12.0));
        assert!(approx(invoice.reservations()["WATER"], 12.0));
    }

    #[test]
    fn test_reservations_sum_lines_of_same_item() {
        let mut invoice = Invoice::new();
        let a = item("A", 1.0);
        invoice.add_item(&a, 2.0).unwrap();
        let mut a_each = a.clone();
        a_each.uom = Some("Each".to_string());
        invoice.add_item(&a_each, 3.0).unwrap();
        invoice.add_item(&item("B", 1.0), 1.0).unwrap();

        let reserved = invoice.reservations();
        assert!(approx(reserved["A"], 5.0));
        assert!(approx(reserved["B"], 1.0));
    }

    #[test]
    fn test_to_document_shape() {
        let mut invoice = Invoice::for_profile("Main POS", Some("SHIFT-1".to_string()));
        invoice.set_customer(Some("Walk-in".to_string()));
        invoice.add_item(&item("A", 10.0), 1.0).unwrap();
        invoice.add_payment(PaymentEntry::new("Cash", 10.0)).unwrap();
        invoice.set_draft_name(Some("ACC-PSINV-0001".to_string()));

        let doc = invoice.to_document();
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["doctype"], "Sales Invoice");
        assert_eq!(json["name"], "ACC-PSINV-0001");
        assert_eq!(json["posa_pos_opening_shift"], "SHIFT-1");
        assert_eq!(json["is_pos"], 1);
        assert_eq!(json["update_stock"], 1);
        assert_eq!(json["items"][0]["item_code"], "A");
        assert!(json.get("apply_discount_on").is_none());
    }

    #[test]
    fn test_restore_rebuilds_cache() {
        let mut invoice = Invoice::new();
        invoice.set_tax_rules(&vat(8.0));
        invoice.add_item(&item("A", 12.0), 2.0).unwrap();
        invoice.add_payment(PaymentEntry::new("Cash", 5.0)).unwrap();

        let saved = serde_json::to_value(&invoice).unwrap();
        let restored = Invoice::restore(saved).unwrap();
        assert_eq!(restored.totals(), invoice.totals());
        assert_cache_consistent(&restored);
    }

    #[test]
    fn test_clear_keeps_tax_settings() {
        let mut invoice = Invoice::new();
        invoice.set_tax_rules(&vat(10.0));
        invoice.add_item(&item("A", 10.0), 1.0).unwrap();
        invoice.add_offer("OFFER-1").unwrap();
        invoice.clear();

        assert!(invoice.is_empty());
        assert!(invoice.offers().is_empty());
        assert!(approx(invoice.tax_rate(), 10.0));
        assert_eq!(invoice.totals(), Totals::default());
    }
}
