//! # Repository Module
//!
//! Database repository implementations for Tally POS.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  Background worker                                                     │
//! │       │                                                                 │
//! │       │  db.items().search("coke", 50)                                 │
//! │       ▼                                                                 │
//! │  ItemRepository                                                        │
//! │  ├── bulk_put(&self, items)                                            │
//! │  ├── get(&self, item_code)                                             │
//! │  ├── search(&self, term, limit)                                        │
//! │  └── count / clear / delete                                            │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`items::ItemRepository`] - Catalog cache and barcode index
//! - [`customers::CustomerRepository`] - Customer cache
//! - [`settings::SettingsRepository`] - Typed key/value settings
//! - [`queue::QueueRepository`] - Offline invoice and payment queues
//! - [`stock::StockRepository`] - Local stock ledger per warehouse
//! - [`item_prices::ItemPriceRepository`] - Price list cache
//! - [`payment_methods::PaymentMethodRepository`] - Modes of payment per profile
//! - [`drafts::DraftRepository`] - Locally parked carts

pub mod customers;
pub mod drafts;
pub mod item_prices;
pub mod items;
pub mod payment_methods;
pub mod queue;
pub mod settings;
pub mod stock;

/// Builds a LIKE pattern with `%`, `_` and `\` escaped.
///
/// Use with `ESCAPE '\'`. `prefix` anchors the match at the start.
pub(crate) fn like_pattern(term: &str, prefix: bool) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    if prefix {
        format!("{escaped}%")
    } else {
        format!("%{escaped}%")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("cola", true), "cola%");
        assert_eq!(like_pattern("cola", false), "%cola%");
        assert_eq!(like_pattern("50%_off", true), "50\\%\\_off%");
    }
}
