//! Error types for credit domain types.

use crate::ids::IdError;

/// Result type for credit domain operations.
pub type Result<T> = std::result::Result<T, CreditError>;

/// Errors raised while building or validating domain values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreditError {
    /// Malformed usage descriptor, negative amount or similar input error.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}
