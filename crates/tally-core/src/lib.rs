//! # tally-core: Pure Business Logic for Tally POS
//!
//! This crate contains the invoice computation engine, the stock ledger and
//! the domain types shared by the store and the background worker. It has
//! zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    UI (external)                                │   │
//! │  │    Item grid ──► Cart ──► Payment ──► Submit                    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  invoice  │  │   stock   │  │ validation│  │   │
//! │  │   │CatalogItem│  │  Invoice  │  │StockLedger│  │   rules   │  │   │
//! │  │   │ TaxRule   │  │  Totals   │  │ StockInfo │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │           tally-db (store)  ·  tally-sync (worker, backend)     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (CatalogItem, Customer, StockUpdate, etc.)
//! - [`invoice`] - Invoice computation engine with incremental aggregates
//! - [`stock`] - Server quantities and cart reservations
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::invoice::Invoice;
//! use tally_core::types::{CatalogItem, TaxRule};
//!
//! let mut invoice = Invoice::new();
//! invoice.set_tax_rules(&[TaxRule::new("On Net Total", 10.0)]);
//! invoice.add_item(&CatalogItem::new("COKE", "Coke 330ml", 100.0), 1.0).unwrap();
//!
//! assert!((invoice.grand_total() - 110.0).abs() < 1e-9);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod invoice;
pub mod stock;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use invoice::{CachedAggregates, DocumentLine, Invoice, InvoiceDocument, InvoiceLine, Totals};
pub use stock::StockLedger;
pub use types::*;
