//! # Sync Error Types
//!
//! Error types for worker, backend and queue operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Connectivity   │  │     Backend             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Offline        │  │  Backend(BackendError)  │ │
//! │  │  InvalidUrl     │  │  Connection     │  │  InvalidResponse        │ │
//! │  │  ConfigLoad/Save│  │  Timeout        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Validation    │  │     Storage     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Core(CoreError)│  │  Storage(DbErr) │  │  ChannelError           │ │
//! │  │  CacheNotReady  │  │                 │  │  ShuttingDown, Worker   │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backend Errors
//! The backend reports business-rule failures (stock shortfall, credit
//! limit) as a JSON body with `exc_type`, `message` and `_server_messages`.
//! [`BackendError`] keeps that payload verbatim so callers can render it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tally_core::CoreError;
use tally_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Backend Error Payload
// =============================================================================

/// Structured failure returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendError {
    /// Exception class name, e.g. `ValidationError`.
    pub exc_type: Option<String>,
    pub message: String,
    /// Decoded `_server_messages`, in order.
    pub server_messages: Vec<String>,
    pub http_status: Option<u16>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        BackendError {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Builds the error from an HTTP status and the (possibly empty) body.
    pub fn from_response(status: u16, body: &Value) -> Self {
        let exc_type = body
            .get("exc_type")
            .and_then(Value::as_str)
            .map(str::to_string);

        let server_messages = body
            .get("_server_messages")
            .and_then(Value::as_str)
            .map(decode_server_messages)
            .unwrap_or_default();

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| server_messages.first().cloned())
            .or_else(|| exc_type.clone())
            .unwrap_or_else(|| format!("HTTP {status}"));

        BackendError {
            exc_type,
            message,
            server_messages,
            http_status: Some(status),
        }
    }

    /// True for gateway-level failures that usually clear on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self.http_status, Some(502..=504))
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(exc) = &self.exc_type {
            write!(f, "{exc}: ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP {status})")?;
        }
        Ok(())
    }
}

/// `_server_messages` is a JSON string holding an array of JSON strings,
/// each usually an object with a `message` field.
fn decode_server_messages(raw: &str) -> Vec<String> {
    let Ok(outer) = serde_json::from_str::<Vec<String>>(raw) else {
        return vec![raw.to_string()];
    };

    outer
        .into_iter()
        .map(|entry| match serde_json::from_str::<Value>(&entry) {
            Ok(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(entry),
            _ => entry,
        })
        .collect()
}

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering all worker, backend and queue failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    /// The operation needs the backend and the client is offline.
    #[error("Backend is unreachable (offline)")]
    Offline,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Structured failure reported by the backend, carried verbatim.
    #[error("Backend error: {0}")]
    Backend(BackendError),

    /// Response body did not have the expected shape.
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The catalog cache is empty and the backend cannot be reached.
    #[error("Catalog cache is not ready; connect to the server to load items")]
    CacheNotReady,

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sync worker is shutting down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failure reported by the worker for a request that has no closer match.
    #[error("Worker error ({kind}): {message}")]
    Worker { kind: String, message: String },
}

impl SyncError {
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        SyncError::Timeout {
            operation: operation.into(),
            millis: duration.as_millis() as u64,
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        SyncError::Backend(err)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout {
                operation: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "request".to_string()),
                millis: 0,
            }
        } else if err.is_connect() || err.is_request() {
            SyncError::ConnectionFailed(err.to_string())
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry and fallback logic)
// =============================================================================

impl SyncError {
    /// Returns true if the backend could not be reached at all.
    ///
    /// These drive the offline flag and make callers fall back to the cache.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SyncError::Offline | SyncError::ConnectionFailed(_) | SyncError::Timeout { .. }
        )
    }

    /// Returns true if the operation can be retried as-is.
    ///
    /// ## Retryable Errors
    /// - Connectivity failures
    /// - Gateway errors (502/503/504)
    ///
    /// ## Non-Retryable Errors
    /// - Business-rule failures from the backend
    /// - Validation and configuration errors
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Backend(err) => err.is_transient(),
            other => other.is_connectivity(),
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Backend payload, if the failure came from the backend.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            SyncError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("reset".into()).is_retryable());
        assert!(SyncError::Offline.is_retryable());
        assert!(SyncError::Timeout {
            operation: "ping".into(),
            millis: 3000
        }
        .is_retryable());

        let gateway = BackendError {
            http_status: Some(503),
            ..BackendError::new("unavailable")
        };
        assert!(SyncError::Backend(gateway).is_retryable());

        let business = BackendError {
            exc_type: Some("ValidationError".into()),
            http_status: Some(417),
            ..BackendError::new("Insufficient stock")
        };
        assert!(!SyncError::Backend(business).is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::CacheNotReady.is_connectivity());
    }

    #[test]
    fn test_backend_error_decodes_server_messages() {
        let inner = json!({"message": "Not enough stock for COKE", "indicator": "red"}).to_string();
        let body = json!({
            "exc_type": "ValidationError",
            "_server_messages": serde_json::to_string(&vec![inner, "plain text".to_string()]).unwrap(),
        });

        let err = BackendError::from_response(417, &body);
        assert_eq!(err.exc_type.as_deref(), Some("ValidationError"));
        assert_eq!(err.http_status, Some(417));
        assert_eq!(
            err.server_messages,
            vec!["Not enough stock for COKE".to_string(), "plain text".to_string()]
        );
        assert_eq!(err.message, "Not enough stock for COKE");
        assert!(err.to_string().contains("ValidationError"));
    }

    #[test]
    fn test_backend_error_without_body() {
        let err = BackendError::from_response(500, &Value::Null);
        assert_eq!(err.message, "HTTP 500");
        assert!(err.server_messages.is_empty());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::InvalidUrl("x".into()).is_config_error());
        assert!(!SyncError::Offline.is_config_error());
    }
}
