//! Core types and utilities for the credit ledger engine.
//!
//! This crate provides the foundational types used throughout the engine:
//!
//! - **Identifiers**: `UserId`, `EntryId`, `SubscriptionId`, `PlanId`, `TicketId`
//! - **Ledger**: `Balance`, `LedgerEntry`, `EntryDetail`, `EntrySource`
//! - **Pricing**: `PricingConfig`, `ModelPricing`, `UsageDescriptor`, `CostBreakdown`
//! - **Redemption**: `RedemptionCode`, `CodeState`
//! - **Grants**: `DailyGrant`, `ActiveSubscription`
//! - **Reconciliation**: `ReconciliationTicket`, `TicketStatus`
//!
//! # Credit Unit
//!
//! Amounts are `rust_decimal::Decimal` values kept at [`CREDIT_SCALE`]
//! decimal places. Floating point never touches a balance.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod grants;
pub mod ids;
pub mod ledger;
pub mod pricing;
pub mod reconciliation;
pub mod redemption;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CreditError, Result};
pub use grants::{day_start, ActiveSubscription, DailyGrant, GrantKey};
pub use ids::{EntryId, IdError, PlanId, SubscriptionId, TicketId, UserId};
pub use ledger::{
    round_charge, round_credit, Balance, EntryDetail, EntrySource, LedgerEntry, TaskRef,
    CREDIT_SCALE,
};
pub use pricing::{
    BilledBy, CostBreakdown, CustomFee, ModelPricing, PricingConfig, TokenUsage,
    UsageDescriptor, TOKENS_PER_PRICE_UNIT,
};
pub use reconciliation::{ReconciliationTicket, TicketStatus};
pub use redemption::{CodeState, RedemptionCode, MAX_CODES_PER_BATCH};
