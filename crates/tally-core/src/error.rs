//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Invoice/stock rule violations                  │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Storage failures                               │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - Worker, backend and queue failures             │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core business logic errors.
///
/// These are rejected user actions. They are surfaced to the caller as-is and
/// never retried automatically.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The invoice has no line items.
    ///
    /// ## When This Occurs
    /// - Submitting an empty cart
    /// - Queuing an empty invoice while offline
    /// - Saving an empty draft
    #[error("Cannot save empty invoice")]
    EmptyInvoice,

    /// A line position does not exist in the invoice.
    #[error("Invoice line {index} does not exist (invoice has {len} lines)")]
    LineNotFound { index: usize, len: usize },

    /// A payment position does not exist in the invoice.
    #[error("Payment {index} does not exist (invoice has {len} payments)")]
    PaymentNotFound { index: usize, len: usize },

    /// Insufficient display stock to add the requested quantity.
    ///
    /// ## User Workflow
    /// ```text
    /// Add to Cart (qty: 5)
    ///      │
    ///      ▼
    /// Display stock: server 8 - reserved 5 = 3
    ///      │
    ///      ▼
    /// InsufficientStock { item_code: "COKE", available: 3, requested: 5 }
    ///      │
    ///      ▼
    /// UI shows: "Only 3 COKE in stock"
    /// ```
    #[error("Insufficient stock for {item_code}: available {available}, requested {requested}")]
    InsufficientStock {
        item_code: String,
        available: f64,
        requested: f64,
    },

    /// The invoice cannot be submitted yet.
    #[error("Invoice is not fully paid: {remaining:.2} remaining")]
    NotFullyPaid { remaining: f64 },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: f64, max: f64 },

    /// Value is not a finite number.
    #[error("{field} must be a finite number")]
    NotFinite { field: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
