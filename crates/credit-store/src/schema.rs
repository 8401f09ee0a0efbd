//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Current balances, keyed by `user_id`.
    pub const BALANCES: &str = "balances";

    /// Ledger entries, keyed by `entry_id` (ULID).
    pub const ENTRIES: &str = "entries";

    /// Index: entries by user, keyed by `user_id || entry_id`.
    /// Value is empty (index only).
    pub const ENTRIES_BY_USER: &str = "entries_by_user";

    /// Redemption codes, keyed by the code string.
    pub const CODES: &str = "redemption_codes";

    /// Daily grants, keyed by `user_id || grant_date || subscription_id`.
    /// The key is both the uniqueness constraint and the per-user history order.
    pub const DAILY_GRANTS: &str = "daily_grants";

    /// Reconciliation tickets, keyed by ticket ID.
    pub const TICKETS: &str = "reconciliation_tickets";

    /// Active subscriptions, keyed by subscription ID.
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Lease records for the distributed lock, keyed by lock name.
    pub const LOCKS: &str = "locks";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BALANCES,
        cf::ENTRIES,
        cf::ENTRIES_BY_USER,
        cf::CODES,
        cf::DAILY_GRANTS,
        cf::TICKETS,
        cf::SUBSCRIPTIONS,
        cf::LOCKS,
    ]
}
