//! Redemption code types.
//!
//! A code moves from unclaimed to claimed exactly once. Expiry is not stored
//! as a transition; it is derived from `expired_at` whenever a code is read.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::ledger::round_credit;
use crate::UserId;

/// Largest number of codes a single batch may create.
pub const MAX_CODES_PER_BATCH: usize = 1000;

/// A pre-issued, single-use code that grants a fixed amount of credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionCode {
    /// The code itself (unique).
    pub code: String,

    /// Campaign or reason the code was issued for.
    pub purpose: String,

    /// Credits granted on claim.
    pub amount: Decimal,

    /// When the code was created.
    pub created_at: DateTime<Utc>,

    /// After this instant the code can no longer be claimed.
    pub expired_at: Option<DateTime<Utc>>,

    /// The user who claimed the code, once claimed.
    pub user_id: Option<UserId>,

    /// When the code was claimed.
    pub received_at: Option<DateTime<Utc>>,
}

impl RedemptionCode {
    /// Create an unclaimed code.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for an empty code or a non-positive amount.
    pub fn new(
        code: impl Into<String>,
        purpose: impl Into<String>,
        amount: Decimal,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let code = code.into();
        if code.trim().is_empty() {
            return Err(CreditError::Validation("code must not be empty".into()));
        }
        Ok(Self {
            code,
            purpose: purpose.into(),
            amount: validate_amount(amount)?,
            created_at: Utc::now(),
            expired_at,
            user_id: None,
            received_at: None,
        })
    }

    /// Create `count` unclaimed codes sharing purpose, amount and expiry.
    ///
    /// Codes are random 32-character hex strings.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for a non-positive amount or a
    /// count outside `1..=MAX_CODES_PER_BATCH`.
    pub fn batch(
        purpose: &str,
        amount: Decimal,
        count: usize,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<Self>> {
        if count == 0 || count > MAX_CODES_PER_BATCH {
            return Err(CreditError::Validation(format!(
                "count must be between 1 and {MAX_CODES_PER_BATCH}"
            )));
        }
        (0..count)
            .map(|_| Self::new(uuid::Uuid::new_v4().simple().to_string(), purpose, amount, expired_at))
            .collect()
    }

    /// Check if the code has been claimed.
    #[must_use]
    pub const fn is_claimed(&self) -> bool {
        self.user_id.is_some()
    }

    /// Check if the code has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some_and(|expired_at| expired_at < now)
    }

    /// Derive the state of the code at `now`.
    ///
    /// A claimed code stays claimed even after its expiry passes.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> CodeState {
        if self.is_claimed() {
            CodeState::Claimed
        } else if self.is_expired_at(now) {
            CodeState::Expired
        } else {
            CodeState::Unclaimed
        }
    }

    /// Replace the editable fields of an unclaimed code.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for a non-positive amount.
    pub fn revise(
        &mut self,
        purpose: impl Into<String>,
        amount: Decimal,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.amount = validate_amount(amount)?;
        self.purpose = purpose.into();
        self.expired_at = expired_at;
        Ok(())
    }
}

fn validate_amount(amount: Decimal) -> Result<Decimal> {
    let amount = round_credit(amount);
    if amount <= Decimal::ZERO {
        return Err(CreditError::Validation(
            "redemption amount must be positive".into(),
        ));
    }
    Ok(amount)
}

/// State of a redemption code at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeState {
    /// Available to claim.
    Unclaimed,
    /// Claimed by a user.
    Claimed,
    /// Past its expiry without being claimed.
    Expired,
}
