//! Balance and ledger entry types.
//!
//! Every change to a balance is recorded as an immutable [`LedgerEntry`].
//! The balance of a user always equals the sum of the deltas of that user's
//! entries, including the opening entry written when the balance is created.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{EntryId, UserId};

// ============================================================================
// Constants
// ============================================================================

/// Number of decimal places kept for every amount stored in the ledger.
pub const CREDIT_SCALE: u32 = 6;

/// Round a charge to ledger precision, rounding up so a charge is never
/// reduced by rounding.
#[must_use]
pub fn round_charge(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CREDIT_SCALE, RoundingStrategy::AwayFromZero)
}

/// Round a credit (grant, conversion) to ledger precision.
#[must_use]
pub fn round_credit(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CREDIT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// The current spendable balance of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// The user who owns the balance.
    pub user_id: UserId,

    /// Current amount in credits.
    pub amount: Decimal,

    /// When the balance was last changed.
    pub updated_at: DateTime<Utc>,

    /// When the balance was created.
    pub created_at: DateTime<Utc>,
}

impl Balance {
    /// Create a new balance holding `amount`.
    #[must_use]
    pub fn new(user_id: UserId, amount: Decimal) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            amount,
            updated_at: now,
            created_at: now,
        }
    }

    /// Check if the balance covers a deduction of `required`.
    #[must_use]
    pub fn covers(&self, required: Decimal) -> bool {
        self.amount >= required
    }
}

/// One immutable record of a balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (ULID for time-ordering).
    pub id: EntryId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Signed change. Positive = grant, negative = deduction.
    pub delta: Decimal,

    /// What caused the change.
    pub detail: EntryDetail,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create a new entry with a fresh ID.
    ///
    /// The delta is rounded to ledger precision here so that no caller can
    /// leak a higher-precision value into storage. `created_at` is taken
    /// from the ID so both orderings agree.
    #[must_use]
    pub fn new(user_id: UserId, delta: Decimal, detail: EntryDetail) -> Self {
        let id = EntryId::generate();
        Self {
            id,
            user_id,
            delta: round_credit(delta),
            detail,
            created_at: id.created_at(),
        }
    }

    /// Create the entry that records a freshly opened balance.
    #[must_use]
    pub fn opening(user_id: UserId, amount: Decimal) -> Self {
        Self::new(
            user_id,
            amount,
            EntryDetail::new(EntrySource::OpeningBalance, "opening balance"),
        )
    }

    /// Check if this entry added credits.
    #[must_use]
    pub fn is_credit(&self) -> bool {
        self.delta.is_sign_positive() && !self.delta.is_zero()
    }
}

/// Structured description of a balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDetail {
    /// The operation that produced the entry.
    pub source: EntrySource,

    /// Unit price applied, if the change was priced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<Decimal>,

    /// Quantity the unit price was applied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,

    /// Free-text reason.
    #[serde(default)]
    pub reason: String,

    /// Additional context (model, task ID, code, ticket ID, token counts...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl EntryDetail {
    /// Create a detail with a source and reason.
    #[must_use]
    pub fn new(source: EntrySource, reason: impl Into<String>) -> Self {
        Self {
            source,
            unit_price: None,
            quantity: None,
            reason: reason.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach the unit price and quantity.
    #[must_use]
    pub fn with_pricing(mut self, unit_price: Decimal, quantity: Decimal) -> Self {
        self.unit_price = Some(unit_price);
        self.quantity = Some(quantity);
        self
    }

    /// Attach a quantity without a single unit price.
    #[must_use]
    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// The operation that produced a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Configured starting amount when the balance was first created.
    OpeningBalance,

    /// Chat completion usage.
    ChatUsage,

    /// Up-front charge for a third-party generation task.
    TaskCharge,

    /// Compensating grant for a failed generation task.
    TaskRefund,

    /// Redemption code claimed.
    Redemption,

    /// Daily subscription allotment.
    DailyGrant,

    /// External payment confirmed.
    PaymentSettlement,

    /// Manual additive correction.
    AdminAdjustment,

    /// Manual overwrite of the balance.
    AdminSet,

    /// Generic refund.
    Refund,
}

impl EntrySource {
    /// Get the source name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OpeningBalance => "opening_balance",
            Self::ChatUsage => "chat_usage",
            Self::TaskCharge => "task_charge",
            Self::TaskRefund => "task_refund",
            Self::Redemption => "redemption",
            Self::DailyGrant => "daily_grant",
            Self::PaymentSettlement => "payment_settlement",
            Self::AdminAdjustment => "admin_adjustment",
            Self::AdminSet => "admin_set",
            Self::Refund => "refund",
        }
    }
}

/// Reference to a third-party generation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    /// Integration name (e.g. "midjourney", "kling").
    pub provider: String,

    /// Task ID assigned by the integration.
    pub task_id: String,
}

impl TaskRef {
    /// Create a new task reference.
    #[must_use]
    pub fn new(provider: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            task_id: task_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn charges_round_up() {
        assert_eq!(round_charge(dec!(0.0000001)), dec!(0.000001));
        assert_eq!(round_charge(dec!(3.2)), dec!(3.2));
    }

    #[test]
    fn credits_round_to_nearest() {
        assert_eq!(round_credit(dec!(1.0000004)), dec!(1.000000));
        assert_eq!(round_credit(dec!(1.0000005)), dec!(1.000001));
    }

    #[test]
    fn entry_delta_is_rounded() {
        let entry = LedgerEntry::new(
            UserId::generate(),
            dec!(-2.12345678),
            EntryDetail::new(EntrySource::ChatUsage, "chat"),
        );
        assert_eq!(entry.delta, dec!(-2.123457));
        assert!(!entry.is_credit());
    }

    #[test]
    fn opening_entry() {
        let user_id = UserId::generate();
        let entry = LedgerEntry::opening(user_id, dec!(100));
        assert_eq!(entry.detail.source, EntrySource::OpeningBalance);
        assert!(entry.is_credit());
    }

    #[test]
    fn balance_covers() {
        let balance = Balance::new(UserId::generate(), dec!(10));
        assert!(balance.covers(dec!(10)));
        assert!(!balance.covers(dec!(10.000001)));
    }

    #[test]
    fn detail_serializes_source_snake_case() {
        let detail = EntryDetail::new(EntrySource::PaymentSettlement, "payment success")
            .with_pricing(dec!(7), dec!(10));
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["source"], "payment_settlement");
        assert_eq!(json["unit_price"], "7");
    }
}
