//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Worker kind other than CORE or GUI
    #[error("Invalid session type: {value}")]
    InvalidWorkerKind { value: String },

    /// Handler name that does not follow the `Handler<N>` scheme
    #[error("Invalid handler name: {value}")]
    InvalidHandlerName { value: String },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
