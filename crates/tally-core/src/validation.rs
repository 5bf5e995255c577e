//! # Validation Module
//!
//! Input validation for invoice and catalog operations.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Caller (UI)                                                  │
//! │  └── Immediate feedback on obviously bad input                         │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Invoice engine (Rust)                                        │
//! │  └── THIS MODULE: quantities, rates, discounts, identifiers            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Backend                                                      │
//! │  └── validate_cart_items, credit limits, submit-time rules             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine rejects NaN and infinities everywhere so that cached
//! aggregates can never be poisoned by a single bad edit.

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum length of a search term sent to the cache or backend.
pub const MAX_SEARCH_TERM_LEN: usize = 140;

// =============================================================================
// Numeric Validators
// =============================================================================

fn finite(value: f64, field: &str) -> ValidationResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NotFinite {
            field: field.to_string(),
        })
    }
}

/// Validates a line quantity. Must be finite and strictly positive.
///
/// ## Example
/// ```rust
/// use tally_core::validation::validate_quantity;
///
/// assert!(validate_quantity(2.0).is_ok());
/// assert!(validate_quantity(0.0).is_err());
/// ```
pub fn validate_quantity(qty: f64) -> ValidationResult<()> {
    finite(qty, "quantity")?;
    if qty <= 0.0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }
    Ok(())
}

/// Validates a unit rate. Zero is allowed (free items).
pub fn validate_rate(rate: f64) -> ValidationResult<()> {
    finite(rate, "rate")?;
    if rate < 0.0 {
        return Err(ValidationError::OutOfRange {
            field: "rate".to_string(),
            min: 0.0,
            max: f64::MAX,
        });
    }
    Ok(())
}

/// Validates a discount value before clamping.
///
/// Only non-finite input is rejected; range is clamped by the engine.
pub fn validate_discount(value: f64) -> ValidationResult<()> {
    finite(value, "discount")
}

/// Validates a payment amount. Must be finite and non-negative.
pub fn validate_payment_amount(amount: f64) -> ValidationResult<()> {
    finite(amount, "payment amount")?;
    if amount < 0.0 {
        return Err(ValidationError::OutOfRange {
            field: "payment amount".to_string(),
            min: 0.0,
            max: f64::MAX,
        });
    }
    Ok(())
}

// =============================================================================
// String Validators
// =============================================================================

/// Validates a backend identifier (item code, customer name, offer code).
pub fn validate_code(value: &str, field: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Normalizes a search term: trims and truncates to [`MAX_SEARCH_TERM_LEN`]
/// characters. An empty result is valid (it means "first page").
pub fn normalize_search_term(term: &str) -> String {
    term.trim().chars().take(MAX_SEARCH_TERM_LEN).collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
