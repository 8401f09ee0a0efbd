//! Payment reconciliation tickets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use credit_core::{
    Balance, Clock, EntryDetail, EntrySource, ReconciliationTicket, TicketId, UserId,
};
use credit_store::{Store, StoreError};

use crate::config::SettingsHandle;
use crate::error::{EngineError, Result};
use crate::ledger::Ledger;

/// Outcome of settling a ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// This call settled the ticket and credited the user.
    Settled(Balance),
    /// The ticket had been settled before; nothing was credited.
    AlreadySettled(Balance),
}

impl Settlement {
    /// The balance of the ticket owner after the call.
    #[must_use]
    pub fn balance(&self) -> &Balance {
        match self {
            Self::Settled(balance) | Self::AlreadySettled(balance) => balance,
        }
    }
}

/// Records external payments and credits them once confirmed.
pub struct ReconciliationDesk {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    settings: Arc<SettingsHandle>,
    clock: Arc<dyn Clock>,
}

impl ReconciliationDesk {
    /// Create a desk.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        settings: Arc<SettingsHandle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            settings,
            clock,
        }
    }

    /// Record a payment the user has started with the gateway.
    ///
    /// `amount` is in the gateway's currency.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for a non-positive amount or a duplicate ID.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn open_ticket(
        &self,
        id: TicketId,
        user_id: &UserId,
        amount: Decimal,
        detail: serde_json::Value,
    ) -> Result<TicketId> {
        let mut ticket = ReconciliationTicket::open(id, *user_id, amount, detail)?;
        ticket.created_at = self.clock.now();
        self.store.insert_ticket(&ticket).await?;
        tracing::info!(
            ticket_id = %ticket.id,
            user_id = %user_id,
            amount = %amount,
            "Reconciliation ticket opened"
        );
        Ok(ticket.id)
    }

    /// Confirm a payment and credit its value at the current exchange rate.
    ///
    /// Only the first call for a ticket credits anything; repeated gateway
    /// notifications get [`Settlement::AlreadySettled`].
    ///
    /// # Errors
    ///
    /// - `EngineError::TicketNotFound` if the ticket doesn't exist.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn settle(&self, ticket_id: &TicketId, detail: serde_json::Value) -> Result<Settlement> {
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| EngineError::TicketNotFound(ticket_id.to_string()))?;

        let won = match self.store.settle_ticket(ticket_id, &detail, self.clock.now()).await {
            Ok(won) => won,
            Err(StoreError::NotFound { .. }) => {
                return Err(EngineError::TicketNotFound(ticket_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if !won {
            tracing::info!(ticket_id = %ticket_id, "Reconciliation ticket already settled");
            let balance = self.ledger.get_balance(&ticket.user_id).await?;
            return Ok(Settlement::AlreadySettled(balance));
        }

        let exchange_rate = self.settings.snapshot().exchange_rate;
        let credits = ticket.credits_at(exchange_rate);
        let entry = EntryDetail::new(EntrySource::PaymentSettlement, "payment success")
            .with_pricing(exchange_rate, ticket.amount)
            .with_metadata(json!({
                "ticket_id": ticket_id,
                "amount": ticket.amount,
                "exchange_rate": exchange_rate,
            }));

        match self.ledger.grant(&ticket.user_id, credits, entry).await {
            Ok(balance) => {
                tracing::info!(
                    ticket_id = %ticket_id,
                    user_id = %ticket.user_id,
                    amount = %ticket.amount,
                    credits = %credits,
                    new_balance = %balance.amount,
                    "Reconciliation ticket settled"
                );
                Ok(Settlement::Settled(balance))
            }
            Err(e) => {
                tracing::error!(
                    ticket_id = %ticket_id,
                    user_id = %ticket.user_id,
                    credits = %credits,
                    error = %e,
                    "Ticket settled but credit failed; needs manual reconciliation"
                );
                Err(e)
            }
        }
    }

    /// Get a ticket.
    ///
    /// # Errors
    ///
    /// - `EngineError::TicketNotFound` if the ticket doesn't exist.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn get_ticket(&self, ticket_id: &TicketId) -> Result<ReconciliationTicket> {
        self.store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| EngineError::TicketNotFound(ticket_id.to_string()))
    }

    /// Tickets opened in `[start, end)`, oldest first.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` if `end` is before `start`.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn tickets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationTicket>> {
        if end < start {
            return Err(EngineError::Validation("end must not precede start".into()));
        }
        Ok(self.store.list_tickets_between(start, end).await?)
    }
}
