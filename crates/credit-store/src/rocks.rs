//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Every read-modify-write runs in a pessimistic `TransactionDB` transaction
//! that takes the row lock with `get_for_update`; a lock that cannot be taken
//! within the configured timeout surfaces as `StoreError::Busy`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, MultiThreaded, Options,
    Transaction, TransactionDB, TransactionDBOptions,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use credit_core::{
    ActiveSubscription, Balance, DailyGrant, EntryDetail, EntryId, GrantKey, LedgerEntry,
    ReconciliationTicket, RedemptionCode, TicketId, TicketStatus, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{lease_expiry, page, DistributedLock, Store, SubscriptionRegistry};

/// How long a transaction waits for a row lock before giving up.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

type Db = TransactionDB<MultiThreaded>;

/// A lease stored in the `locks` column family.
#[derive(Serialize, Deserialize)]
struct LeaseRecord {
    token: String,
    expires_at: DateTime<Utc>,
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<Db>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_lock_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open or create a database whose transactions wait at most
    /// `lock_timeout` for a row lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open_with_lock_timeout<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(i64::try_from(lock_timeout.as_millis()).unwrap_or(i64::MAX));

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let path = path.as_ref();
        let db = Db::open_cf_descriptors(&opts, &txn_opts, path, cf_descriptors)?;
        tracing::info!(
            path = %path.display(),
            lock_timeout = ?lock_timeout,
            "RocksDB store opened"
        );

        Ok(Self { db: Arc::new(db) })
    }

    /// Register or replace a subscription in the registry view.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn put_subscription(&self, subscription: &ActiveSubscription) -> Result<()> {
        let cf = self.cf(cf::SUBSCRIPTIONS)?;
        let key = keys::string_key(subscription.subscription_id.as_str());
        self.db.put_cf(&cf, key, Self::serialize(subscription)?)?;
        Ok(())
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Read and decode every value of a column family.
    fn scan<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let cf = self.cf(name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    /// Read a value inside a transaction, taking an exclusive lock on its key.
    fn get_locked<T: serde::de::DeserializeOwned>(
        txn: &Transaction<'_, Db>,
        cf: &Arc<BoundColumnFamily<'_>>,
        key: &[u8],
    ) -> Result<Option<T>> {
        txn.get_for_update_cf(cf, key, true)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Append an entry and its user index inside a transaction.
    fn put_entry(&self, txn: &Transaction<'_, Db>, entry: &LedgerEntry) -> Result<()> {
        let cf_entries = self.cf(cf::ENTRIES)?;
        let cf_by_user = self.cf(cf::ENTRIES_BY_USER)?;

        txn.put_cf(&cf_entries, keys::entry_key(&entry.id), Self::serialize(entry)?)?;
        txn.put_cf(&cf_by_user, keys::user_entry_key(&entry.user_id, &entry.id), [])?;
        Ok(())
    }

    /// Lock a balance, apply `entry` to it and append the entry.
    fn apply_entry(&self, entry: &LedgerEntry) -> Result<Balance> {
        let cf_balances = self.cf(cf::BALANCES)?;
        let key = keys::balance_key(&entry.user_id);

        let txn = self.db.transaction();
        let mut balance: Balance = Self::get_locked(&txn, &cf_balances, &key)?
            .ok_or_else(|| StoreError::not_found("balance", entry.user_id))?;

        balance.amount += entry.delta;
        balance.updated_at = Utc::now();

        self.put_entry(&txn, entry)?;
        txn.put_cf(&cf_balances, &key, Self::serialize(&balance)?)?;
        txn.commit()?;

        Ok(balance)
    }

    fn get_entry(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        let cf = self.cf(cf::ENTRIES)?;
        self.db
            .get_cf(&cf, keys::entry_key(entry_id))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Conditionally rewrite (or delete, on `None`) an unclaimed code.
    fn change_unclaimed_code(
        &self,
        code: &str,
        change: impl FnOnce(RedemptionCode) -> Option<RedemptionCode>,
    ) -> Result<bool> {
        let cf = self.cf(cf::CODES)?;
        let key = keys::string_key(code);

        let txn = self.db.transaction();
        let Some(stored) = Self::get_locked::<RedemptionCode>(&txn, &cf, &key)? else {
            return Ok(false);
        };
        if stored.is_claimed() {
            return Ok(false);
        }

        match change(stored) {
            Some(updated) => txn.put_cf(&cf, &key, Self::serialize(&updated)?)?,
            None => txn.delete_cf(&cf, &key)?,
        }
        txn.commit()?;
        Ok(true)
    }
}

#[async_trait]
impl Store for RocksStore {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<Balance>> {
        let cf = self.cf(cf::BALANCES)?;
        self.db
            .get_cf(&cf, keys::balance_key(user_id))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    async fn open_balance(&self, user_id: &UserId, opening: Decimal) -> Result<Balance> {
        let cf_balances = self.cf(cf::BALANCES)?;
        let key = keys::balance_key(user_id);

        let txn = self.db.transaction();
        if let Some(existing) = Self::get_locked(&txn, &cf_balances, &key)? {
            return Ok(existing);
        }

        let mut balance = Balance::new(*user_id, Decimal::ZERO);
        if !opening.is_zero() {
            let entry = LedgerEntry::opening(*user_id, opening);
            balance.amount = entry.delta;
            self.put_entry(&txn, &entry)?;
        }
        txn.put_cf(&cf_balances, &key, Self::serialize(&balance)?)?;
        txn.commit()?;

        Ok(balance)
    }

    async fn add_balance(&self, entry: &LedgerEntry) -> Result<Balance> {
        self.apply_entry(entry)
    }

    async fn set_balance(
        &self,
        user_id: &UserId,
        amount: Decimal,
        detail: &EntryDetail,
    ) -> Result<Balance> {
        let cf_balances = self.cf(cf::BALANCES)?;
        let key = keys::balance_key(user_id);

        let txn = self.db.transaction();
        let mut balance: Balance = Self::get_locked(&txn, &cf_balances, &key)?
            .ok_or_else(|| StoreError::not_found("balance", user_id))?;

        let entry = LedgerEntry::new(*user_id, amount - balance.amount, detail.clone());
        balance.amount += entry.delta;
        balance.updated_at = Utc::now();

        self.put_entry(&txn, &entry)?;
        txn.put_cf(&cf_balances, &key, Self::serialize(&balance)?)?;
        txn.commit()?;

        Ok(balance)
    }

    async fn list_entries(
        &self,
        user_id: Option<&UserId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let Some(user_id) = user_id else {
            let cf = self.cf(cf::ENTRIES)?;
            let mut entries = Vec::new();
            for item in self.db.iterator_cf(&cf, IteratorMode::End).skip(offset).take(limit) {
                let (_, value) = item?;
                entries.push(Self::deserialize(&value)?);
            }
            return Ok(entries);
        };

        let cf_by_user = self.cf(cf::ENTRIES_BY_USER)?;
        let prefix = keys::user_prefix(user_id);
        let end = keys::user_prefix_end(user_id);

        // Newest first: seek to the end of the user's key range and walk back.
        let mut ids = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(&end, Direction::Reverse))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push(key);
        }

        let mut entries = Vec::new();
        for key in page(ids, limit, offset) {
            let entry_id = keys::entry_id_from_user_key(&key)
                .ok_or_else(|| StoreError::Serialization("malformed entry index key".into()))?;
            if let Some(entry) = self.get_entry(&entry_id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn count_entries(&self, user_id: Option<&UserId>) -> Result<u64> {
        let mut count = 0u64;
        match user_id {
            Some(user_id) => {
                let cf_by_user = self.cf(cf::ENTRIES_BY_USER)?;
                let prefix = keys::user_prefix(user_id);
                let iter = self
                    .db
                    .iterator_cf(&cf_by_user, IteratorMode::From(&prefix, Direction::Forward));
                for item in iter {
                    let (key, _) = item?;
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    count += 1;
                }
            }
            None => {
                let cf = self.cf(cf::ENTRIES)?;
                for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                    item?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn list_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf(cf::ENTRIES)?;
        let start_ms = u64::try_from(start.timestamp_millis()).unwrap_or(0);
        let seek = keys::entry_key(&EntryId::lower_bound(start_ms));

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, Direction::Forward))
        {
            let (_, value) = item?;
            let entry: LedgerEntry = Self::deserialize(&value)?;
            if entry.created_at >= end {
                break;
            }
            if entry.created_at >= start {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn delete_entries_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let cf_entries = self.cf(cf::ENTRIES)?;
        let cf_by_user = self.cf(cf::ENTRIES_BY_USER)?;

        let mut expired = Vec::new();
        for item in self.db.iterator_cf(&cf_entries, IteratorMode::Start) {
            let (_, value) = item?;
            let entry: LedgerEntry = Self::deserialize(&value)?;
            if entry.created_at >= before {
                break;
            }
            expired.push((entry.id, entry.user_id));
        }

        let txn = self.db.transaction();
        for (entry_id, user_id) in &expired {
            txn.delete_cf(&cf_entries, keys::entry_key(entry_id))?;
            txn.delete_cf(&cf_by_user, keys::user_entry_key(user_id, entry_id))?;
        }
        txn.commit()?;

        Ok(expired.len() as u64)
    }

    // =========================================================================
    // Redemption Code Operations
    // =========================================================================

    async fn insert_codes(&self, codes: &[RedemptionCode]) -> Result<()> {
        let cf = self.cf(cf::CODES)?;

        let txn = self.db.transaction();
        for code in codes {
            let key = keys::string_key(&code.code);
            if txn.get_for_update_cf(&cf, &key, true)?.is_some() {
                tracing::debug!(code = %code.code, "Code batch rejected: duplicate code");
                return Err(StoreError::conflict("redemption code", &code.code));
            }
            txn.put_cf(&cf, &key, Self::serialize(code)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn get_code(&self, code: &str) -> Result<Option<RedemptionCode>> {
        let cf = self.cf(cf::CODES)?;
        self.db
            .get_cf(&cf, keys::string_key(code))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    async fn search_codes(
        &self,
        keyword: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(u64, Vec<RedemptionCode>)> {
        let mut matching: Vec<RedemptionCode> = self
            .scan::<RedemptionCode>(cf::CODES)?
            .into_iter()
            .filter(|c| keyword.map_or(true, |k| c.code == k || c.purpose == k))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.code.cmp(&b.code)));
        let total = matching.len() as u64;
        Ok((total, page(matching, limit, offset)))
    }

    async fn update_unclaimed_code(&self, code: &RedemptionCode) -> Result<bool> {
        self.change_unclaimed_code(&code.code, |mut stored| {
            stored.purpose.clone_from(&code.purpose);
            stored.amount = code.amount;
            stored.expired_at = code.expired_at;
            Some(stored)
        })
    }

    async fn delete_unclaimed_code(&self, code: &str) -> Result<bool> {
        self.change_unclaimed_code(code, |_| None)
    }

    async fn mark_code_claimed(
        &self,
        code: &str,
        user_id: &UserId,
        received_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.change_unclaimed_code(code, |mut stored| {
            stored.user_id = Some(*user_id);
            stored.received_at = Some(received_at);
            Some(stored)
        })
    }

    // =========================================================================
    // Daily Grant Operations
    // =========================================================================

    async fn insert_daily_grant(&self, grant: &DailyGrant) -> Result<bool> {
        let cf = self.cf(cf::DAILY_GRANTS)?;
        let key = keys::daily_grant_key(&grant.key());

        let txn = self.db.transaction();
        if txn.get_for_update_cf(&cf, &key, true)?.is_some() {
            return Ok(false);
        }
        txn.put_cf(&cf, &key, Self::serialize(grant)?)?;
        txn.commit()?;
        Ok(true)
    }

    async fn remove_daily_grant(&self, key: &GrantKey) -> Result<()> {
        let cf = self.cf(cf::DAILY_GRANTS)?;
        self.db.delete_cf(&cf, keys::daily_grant_key(key))?;
        Ok(())
    }

    async fn has_daily_grant(&self, key: &GrantKey) -> Result<bool> {
        let cf = self.cf(cf::DAILY_GRANTS)?;
        Ok(self.db.get_cf(&cf, keys::daily_grant_key(key))?.is_some())
    }

    async fn list_daily_grants(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<(u64, Vec<DailyGrant>)> {
        let cf = self.cf(cf::DAILY_GRANTS)?;
        let prefix = keys::user_prefix(user_id);
        let end = keys::user_prefix_end(user_id);

        let mut grants = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&end, Direction::Reverse))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            grants.push(Self::deserialize(&value)?);
        }

        let total = grants.len() as u64;
        Ok((total, page(grants, limit, offset)))
    }

    // =========================================================================
    // Reconciliation Ticket Operations
    // =========================================================================

    async fn insert_ticket(&self, ticket: &ReconciliationTicket) -> Result<()> {
        let cf = self.cf(cf::TICKETS)?;
        let key = keys::string_key(ticket.id.as_str());

        let txn = self.db.transaction();
        if txn.get_for_update_cf(&cf, &key, true)?.is_some() {
            tracing::debug!(ticket_id = %ticket.id, "Ticket rejected: duplicate ID");
            return Err(StoreError::conflict("reconciliation ticket", &ticket.id));
        }
        txn.put_cf(&cf, &key, Self::serialize(ticket)?)?;
        txn.commit()?;
        Ok(())
    }

    async fn get_ticket(&self, id: &TicketId) -> Result<Option<ReconciliationTicket>> {
        let cf = self.cf(cf::TICKETS)?;
        self.db
            .get_cf(&cf, keys::string_key(id.as_str()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    async fn settle_ticket(
        &self,
        id: &TicketId,
        detail: &serde_json::Value,
        settled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let cf = self.cf(cf::TICKETS)?;
        let key = keys::string_key(id.as_str());

        let txn = self.db.transaction();
        let mut ticket: ReconciliationTicket = Self::get_locked(&txn, &cf, &key)?
            .ok_or_else(|| StoreError::not_found("reconciliation ticket", id))?;
        if ticket.is_settled() {
            return Ok(false);
        }

        ticket.status = TicketStatus::Settled;
        ticket.detail = detail.clone();
        ticket.settled_at = Some(settled_at);
        txn.put_cf(&cf, &key, Self::serialize(&ticket)?)?;
        txn.commit()?;
        Ok(true)
    }

    async fn list_tickets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationTicket>> {
        let mut tickets: Vec<ReconciliationTicket> = self
            .scan::<ReconciliationTicket>(cf::TICKETS)?
            .into_iter()
            .filter(|t| t.created_at >= start && t.created_at < end)
            .collect();
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tickets)
    }
}

#[async_trait]
impl SubscriptionRegistry for RocksStore {
    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<ActiveSubscription>> {
        Ok(self
            .scan::<ActiveSubscription>(cf::SUBSCRIPTIONS)?
            .into_iter()
            .filter(|s| s.expires_at > now)
            .collect())
    }
}

#[async_trait]
impl DistributedLock for RocksStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let cf = self.cf(cf::LOCKS)?;
        let lock_key = keys::string_key(key);
        let now = Utc::now();

        let txn = self.db.transaction();
        let held = Self::get_locked::<LeaseRecord>(&txn, &cf, &lock_key)?;
        if held.is_some_and(|lease| lease.expires_at > now) {
            return Ok(false);
        }

        let lease = LeaseRecord {
            token: token.to_owned(),
            expires_at: lease_expiry(now, ttl),
        };
        txn.put_cf(&cf, &lock_key, Self::serialize(&lease)?)?;
        txn.commit()?;
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let cf = self.cf(cf::LOCKS)?;
        let lock_key = keys::string_key(key);

        let txn = self.db.transaction();
        let held = Self::get_locked::<LeaseRecord>(&txn, &cf, &lock_key)?;
        let owned = held.is_some_and(|lease| lease.token == token && lease.expires_at > Utc::now());
        if !owned {
            return Ok(false);
        }
        txn.delete_cf(&cf, &lock_key)?;
        txn.commit()?;
        Ok(true)
    }
}
