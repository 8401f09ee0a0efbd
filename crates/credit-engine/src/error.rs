//! Engine error types.

use rust_decimal::Decimal;

use credit_core::CreditError;
use credit_store::StoreError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced to callers of the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The balance does not cover the requested deduction.
    #[error("insufficient credit: balance={balance}, required={required}")]
    InsufficientCredit {
        /// Current balance.
        balance: Decimal,
        /// Amount that was required.
        required: Decimal,
    },

    /// No redemption code with that value exists.
    #[error("redemption code not found")]
    CodeNotFound,

    /// The code was claimed already, or another claim is in flight.
    #[error("redemption code already claimed")]
    CodeAlreadyClaimed,

    /// The code expired before it was claimed.
    #[error("redemption code expired")]
    CodeExpired,

    /// No reconciliation ticket with that ID exists.
    #[error("reconciliation ticket not found: {0}")]
    TicketNotFound(String),

    /// Storage is temporarily unreachable or contended. Safe to retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The request is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Stored data is corrupt or an invariant was broken.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if the same call may succeed when retried later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// A message suitable for showing to the end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientCredit { balance, required } => format!(
                "Insufficient credit: your balance is {balance} but {required} is required. \
                 Please top up to continue."
            ),
            Self::CodeNotFound => "This redemption code does not exist.".into(),
            Self::CodeAlreadyClaimed => "This redemption code has already been used.".into(),
            Self::CodeExpired => "This redemption code has expired.".into(),
            Self::TicketNotFound(_) => "The payment could not be found.".into(),
            Self::StorageUnavailable(_) => {
                "The service is busy right now. Please try again shortly.".into()
            }
            Self::Validation(msg) => msg.clone(),
            Self::Internal(_) => "An internal error occurred.".into(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy(msg) | StoreError::Database(msg) => Self::StorageUnavailable(msg),
            StoreError::Conflict { .. } => Self::Validation(err.to_string()),
            StoreError::NotFound { .. } | StoreError::Serialization(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<CreditError> for EngineError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::Validation(msg) => Self::Validation(msg),
            CreditError::InvalidId(e) => Self::Validation(e.to_string()),
        }
    }
}
