//! # Stock Ledger
//!
//! In-memory model that answers "how much of item X can still be sold right
//! now" by combining the last server quantity with the active cart.
//!
//! ```text
//! server_qty[code] ──┐
//!                    ├──► display = max(server - reserved, 0)
//! reserved[code] ────┘
//!
//! init(items)        first write wins per item
//! apply_update(..)   authoritative merge, reservations untouched
//! reserve(map)       full replace from the cart snapshot
//! ```
//!
//! Reservations are kept for items the ledger has not seen yet, so that
//! they take effect as soon as the item is registered.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{CatalogItem, StockInfo, StockUpdate};

#[derive(Debug, Clone, PartialEq)]
struct ServerStock {
    qty: f64,
    warehouse: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Server quantities plus cart reservations for one warehouse.
#[derive(Debug, Clone, Default)]
pub struct StockLedger {
    server: HashMap<String, ServerStock>,
    reserved: HashMap<String, f64>,
    warehouse: Option<String>,
    /// Bumped on every `reserve` call.
    generation: u64,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warehouse(warehouse: impl Into<String>) -> Self {
        StockLedger {
            warehouse: Some(warehouse.into()),
            ..Self::default()
        }
    }

    pub fn warehouse(&self) -> Option<&str> {
        self.warehouse.as_deref()
    }

    /// Switches warehouse. Server quantities from the old one are dropped.
    pub fn set_warehouse(&mut self, warehouse: Option<String>) {
        if self.warehouse != warehouse {
            self.server.clear();
            self.warehouse = warehouse;
        }
    }

    /// Seeds server quantities. Items already known keep their quantity.
    ///
    /// Returns the number of newly registered items.
    pub fn init(&mut self, items: &[CatalogItem]) -> usize {
        let now = Utc::now();
        let mut added = 0;
        for item in items {
            if self.server.contains_key(&item.item_code) {
                continue;
            }
            self.server.insert(
                item.item_code.clone(),
                ServerStock {
                    qty: item.server_qty(),
                    warehouse: item.warehouse.clone().or_else(|| self.warehouse.clone()),
                    updated_at: now,
                },
            );
            added += 1;
        }
        added
    }

    /// Merges authoritative quantities. Reservations are never touched.
    ///
    /// Updates for another warehouse are skipped when a warehouse is set.
    /// Returns the number of updates applied.
    pub fn apply_update(&mut self, updates: &[StockUpdate]) -> usize {
        let now = Utc::now();
        let mut applied = 0;
        for update in updates {
            if !self.accepts(&update.warehouse) {
                continue;
            }
            let warehouse = if update.warehouse.is_empty() {
                self.warehouse.clone()
            } else {
                Some(update.warehouse.clone())
            };
            self.server.insert(
                update.item_code.clone(),
                ServerStock {
                    qty: update.qty(),
                    warehouse,
                    updated_at: now,
                },
            );
            applied += 1;
        }
        applied
    }

    /// True if an update for `warehouse` belongs to this ledger.
    pub fn accepts(&self, warehouse: &str) -> bool {
        match &self.warehouse {
            Some(current) => warehouse.is_empty() || warehouse == current,
            None => true,
        }
    }

    /// Replaces the whole reservation map with the cart snapshot.
    pub fn reserve(&mut self, reservations: HashMap<String, f64>) {
        self.reserved = reservations
            .into_iter()
            .filter(|(_, qty)| *qty > 0.0)
            .collect();
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn reservations(&self) -> &HashMap<String, f64> {
        &self.reserved
    }

    /// Counter that changes whenever `reserve` is called.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn clear_reservations(&mut self) {
        self.reserve(HashMap::new());
    }

    pub fn server_qty(&self, item_code: &str) -> f64 {
        self.server.get(item_code).map(|s| s.qty).unwrap_or(0.0)
    }

    pub fn reserved_qty(&self, item_code: &str) -> f64 {
        self.reserved.get(item_code).copied().unwrap_or(0.0)
    }

    /// `max(server - reserved, 0)`. Unknown items have a server quantity of 0.
    pub fn display_stock(&self, item_code: &str) -> f64 {
        (self.server_qty(item_code) - self.reserved_qty(item_code)).max(0.0)
    }

    pub fn stock_info(&self, item_code: &str) -> StockInfo {
        let record = self.server.get(item_code);
        StockInfo {
            server_qty: self.server_qty(item_code),
            reserved_qty: self.reserved_qty(item_code),
            display_qty: self.display_stock(item_code),
            warehouse: record
                .and_then(|s| s.warehouse.clone())
                .or_else(|| self.warehouse.clone()),
            last_update: record.map(|s| s.updated_at),
        }
    }

    pub fn is_tracked(&self, item_code: &str) -> bool {
        self.server.contains_key(item_code)
    }

    /// Item codes with a server record, sorted.
    pub fn tracked_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.server.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Drops all state, e.g. on a profile switch. Warehouse is kept.
    pub fn reset(&mut self) {
        self.server.clear();
        self.reserved.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
