//! Storage layer for the credit ledger engine.
//!
//! This crate owns the single write path for balances and ledger entries, and
//! persists redemption codes, daily grants and reconciliation tickets. All
//! atomicity guarantees live here: each backend evaluates increments,
//! uniqueness checks and conditional transitions inside one unit of work.
//!
//! # Backends
//!
//! - [`MemoryStore`]: a mutex-guarded in-process store, always available
//! - `RocksStore`: `RocksDB` `TransactionDB` with column families
//!   (feature `rocksdb-backend`)
//! - `PgStore`: `PostgreSQL` through `sqlx` (feature `postgres`)
//!
//! # Example
//!
//! ```no_run
//! use credit_core::{EntryDetail, EntrySource, LedgerEntry, UserId};
//! use credit_store::{MemoryStore, Store};
//! use rust_decimal::Decimal;
//!
//! # async fn demo() -> credit_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//!
//! store.open_balance(&user_id, Decimal::ZERO).await?;
//! let entry = LedgerEntry::new(
//!     user_id,
//!     Decimal::TEN,
//!     EntryDetail::new(EntrySource::AdminAdjustment, "welcome bonus"),
//! );
//! let balance = store.add_balance(&entry).await?;
//! assert_eq!(balance.amount, Decimal::TEN);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{Result, StoreError};
pub use memory::{MemoryLock, MemoryStore};

#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use credit_core::{
    ActiveSubscription, Balance, DailyGrant, EntryDetail, GrantKey, LedgerEntry,
    ReconciliationTicket, RedemptionCode, TicketId, UserId,
};

/// The storage trait defining all database operations.
///
/// Balances are changed only through `open_balance`, `add_balance` and
/// `set_balance`; each appends its ledger entry in the same unit of work as
/// the balance write.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Get the balance of a user, if one has been opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<Balance>>;

    /// Create the balance of a user if it does not exist yet.
    ///
    /// When the balance is actually created with a non-zero `opening` amount,
    /// an opening ledger entry is appended alongside it. Returns the current
    /// balance either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn open_balance(&self, user_id: &UserId, opening: Decimal) -> Result<Balance>;

    /// Apply `entry.delta` to the balance of `entry.user_id` and append the
    /// entry, atomically.
    ///
    /// Returns the balance after the change.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the balance was never opened.
    /// - `StoreError::Busy` if the balance row could not be locked in time.
    async fn add_balance(&self, entry: &LedgerEntry) -> Result<Balance>;

    /// Overwrite the balance of a user and append an entry whose delta is the
    /// difference to the previous amount, atomically.
    ///
    /// Returns the balance after the change.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the balance was never opened.
    /// - `StoreError::Busy` if the balance row could not be locked in time.
    async fn set_balance(
        &self,
        user_id: &UserId,
        amount: Decimal,
        detail: &EntryDetail,
    ) -> Result<Balance>;

    /// List ledger entries, newest first, optionally for a single user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_entries(
        &self,
        user_id: Option<&UserId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// Count ledger entries, optionally for a single user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn count_entries(&self, user_id: Option<&UserId>) -> Result<u64>;

    /// List ledger entries created in `[start, end)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>>;

    /// Delete ledger entries created before `before`. Balances are untouched.
    ///
    /// Returns the number of deleted entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn delete_entries_before(&self, before: DateTime<Utc>) -> Result<u64>;

    // =========================================================================
    // Redemption Code Operations
    // =========================================================================

    /// Insert a batch of codes. Either all codes are stored or none.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if any code already exists.
    async fn insert_codes(&self, codes: &[RedemptionCode]) -> Result<()>;

    /// Get a code by its value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_code(&self, code: &str) -> Result<Option<RedemptionCode>>;

    /// Search codes whose code or purpose equals `keyword`, newest first.
    ///
    /// Returns the total number of matches and the requested page.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn search_codes(
        &self,
        keyword: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(u64, Vec<RedemptionCode>)>;

    /// Replace purpose, amount and expiry of a code that is still unclaimed.
    ///
    /// Returns `false` if the code is missing or already claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn update_unclaimed_code(&self, code: &RedemptionCode) -> Result<bool>;

    /// Delete a code that is still unclaimed.
    ///
    /// Returns `false` if the code is missing or already claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn delete_unclaimed_code(&self, code: &str) -> Result<bool>;

    /// Mark a code claimed by `user_id`, only if nobody has claimed it yet.
    ///
    /// Returns `false` if the code is missing or already claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn mark_code_claimed(
        &self,
        code: &str,
        user_id: &UserId,
        received_at: DateTime<Utc>,
    ) -> Result<bool>;

    // =========================================================================
    // Daily Grant Operations
    // =========================================================================

    /// Insert a daily grant unless one already exists for its key.
    ///
    /// Returns `false` on a uniqueness conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_daily_grant(&self, grant: &DailyGrant) -> Result<bool>;

    /// Remove the daily grant with the given key, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn remove_daily_grant(&self, key: &GrantKey) -> Result<()>;

    /// Check if a daily grant exists for the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn has_daily_grant(&self, key: &GrantKey) -> Result<bool>;

    /// List the daily grants of a user, newest grant date first.
    ///
    /// Returns the total number of grants and the requested page.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_daily_grants(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<(u64, Vec<DailyGrant>)>;

    // =========================================================================
    // Reconciliation Ticket Operations
    // =========================================================================

    /// Insert an open ticket.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if a ticket with the same ID exists.
    async fn insert_ticket(&self, ticket: &ReconciliationTicket) -> Result<()>;

    /// Get a ticket by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_ticket(&self, id: &TicketId) -> Result<Option<ReconciliationTicket>>;

    /// Move a ticket from open to settled, replacing its detail.
    ///
    /// Returns `false` if the ticket was already settled.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the ticket doesn't exist.
    async fn settle_ticket(
        &self,
        id: &TicketId,
        detail: &serde_json::Value,
        settled_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// List tickets created in `[start, end)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_tickets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationTicket>>;
}

/// A lease-based mutual exclusion primitive shared by every engine instance.
///
/// A lock is held by whoever presents its `token`; it lapses on its own after
/// the TTL so a crashed holder never blocks a key forever.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock on `key` unless someone else holds an unexpired lease.
    ///
    /// Returns `true` if the lock was acquired.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock backend is unreachable.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock on `key` if it is still held under `token`.
    ///
    /// Returns `false` if the lease had already lapsed or changed hands.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock backend is unreachable.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Read-only view of paid subscriptions, owned by the subscription system.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    /// List subscriptions that have not expired at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<ActiveSubscription>>;
}

/// The instant a lease taken at `now` for `ttl` lapses.
pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Page bounds for an in-process listing.
pub(crate) fn page<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}
