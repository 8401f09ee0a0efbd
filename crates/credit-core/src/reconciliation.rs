//! Reconciliation ticket types.
//!
//! A ticket bridges an external payment to an internal credit grant. It is
//! opened when the payment intent is created and settled once the gateway
//! confirms the payment. Settlement is one-way.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, Result};
use crate::ledger::round_credit;
use crate::{TicketId, UserId};

/// An externally-initiated payment awaiting or past confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationTicket {
    /// Ticket ID (the gateway trade number).
    pub id: TicketId,

    /// Paying user.
    pub user_id: UserId,

    /// Payment amount in the gateway's currency, not yet converted.
    pub amount: Decimal,

    /// Gateway metadata. Replaced once on settlement.
    pub detail: serde_json::Value,

    /// Settlement state.
    pub status: TicketStatus,

    /// When the ticket was settled.
    pub settled_at: Option<DateTime<Utc>>,

    /// When the ticket was opened.
    pub created_at: DateTime<Utc>,
}

impl ReconciliationTicket {
    /// Open a ticket.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Validation` for a non-positive amount.
    pub fn open(
        id: TicketId,
        user_id: UserId,
        amount: Decimal,
        detail: serde_json::Value,
    ) -> Result<Self> {
        if amount <= Decimal::ZERO {
            return Err(CreditError::Validation(
                "payment amount must be positive".into(),
            ));
        }
        Ok(Self {
            id,
            user_id,
            amount,
            detail,
            status: TicketStatus::Open,
            settled_at: None,
            created_at: Utc::now(),
        })
    }

    /// Check if the ticket has been settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.status == TicketStatus::Settled
    }

    /// Credits owed for this ticket at `exchange_rate`, at ledger precision.
    #[must_use]
    pub fn credits_at(&self, exchange_rate: Decimal) -> Decimal {
        round_credit(self.amount * exchange_rate)
    }
}

/// Settlement state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Payment intent created, not yet confirmed.
    Open,
    /// Payment confirmed and credited.
    Settled,
}

impl TicketStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Settled => "settled",
        }
    }
}
