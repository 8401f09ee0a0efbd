//! In-memory storage implementation.
//!
//! Every operation runs inside one critical section over the whole state, so
//! increments, uniqueness checks and conditional transitions are atomic with
//! respect to each other. Used for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use credit_core::{
    ActiveSubscription, Balance, DailyGrant, EntryDetail, EntryId, GrantKey, LedgerEntry,
    ReconciliationTicket, RedemptionCode, SubscriptionId, TicketId, TicketStatus, UserId,
};

use crate::error::{Result, StoreError};
use crate::{page, DistributedLock, Store, SubscriptionRegistry};

#[derive(Default)]
struct State {
    balances: HashMap<UserId, Balance>,
    entries: BTreeMap<EntryId, LedgerEntry>,
    codes: HashMap<String, RedemptionCode>,
    grants: HashMap<GrantKey, DailyGrant>,
    tickets: HashMap<TicketId, ReconciliationTicket>,
    subscriptions: HashMap<SubscriptionId, ActiveSubscription>,
}

impl State {
    fn apply(&mut self, entry: &LedgerEntry) -> Result<Balance> {
        let balance = self
            .balances
            .get_mut(&entry.user_id)
            .ok_or_else(|| StoreError::not_found("balance", entry.user_id))?;
        balance.amount += entry.delta;
        balance.updated_at = Utc::now();
        let balance = balance.clone();
        self.entries.insert(entry.id, entry.clone());
        Ok(balance)
    }
}

/// Mutex-guarded in-process store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a subscription in the registry view.
    pub fn put_subscription(&self, subscription: ActiveSubscription) {
        self.state()
            .subscriptions
            .insert(subscription.subscription_id.clone(), subscription);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<Balance>> {
        Ok(self.state().balances.get(user_id).cloned())
    }

    async fn open_balance(&self, user_id: &UserId, opening: Decimal) -> Result<Balance> {
        let mut state = self.state();
        if let Some(existing) = state.balances.get(user_id) {
            return Ok(existing.clone());
        }

        let balance = Balance::new(*user_id, Decimal::ZERO);
        state.balances.insert(*user_id, balance.clone());
        if opening.is_zero() {
            return Ok(balance);
        }
        state.apply(&LedgerEntry::opening(*user_id, opening))
    }

    async fn add_balance(&self, entry: &LedgerEntry) -> Result<Balance> {
        self.state().apply(entry)
    }

    async fn set_balance(
        &self,
        user_id: &UserId,
        amount: Decimal,
        detail: &EntryDetail,
    ) -> Result<Balance> {
        let mut state = self.state();
        let previous = state
            .balances
            .get(user_id)
            .map(|balance| balance.amount)
            .ok_or_else(|| StoreError::not_found("balance", user_id))?;

        let entry = LedgerEntry::new(*user_id, amount - previous, detail.clone());
        state.apply(&entry)
    }

    async fn list_entries(
        &self,
        user_id: Option<&UserId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.state();
        let matching: Vec<_> = state
            .entries
            .values()
            .rev()
            .filter(|entry| user_id.map_or(true, |user_id| entry.user_id == *user_id))
            .cloned()
            .collect();
        Ok(page(matching, limit, offset))
    }

    async fn count_entries(&self, user_id: Option<&UserId>) -> Result<u64> {
        let state = self.state();
        let count = state
            .entries
            .values()
            .filter(|entry| user_id.map_or(true, |user_id| entry.user_id == *user_id))
            .count();
        Ok(count as u64)
    }

    async fn list_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.state();
        Ok(state
            .entries
            .values()
            .filter(|entry| entry.created_at >= start && entry.created_at < end)
            .cloned()
            .collect())
    }

    async fn delete_entries_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let count = state.entries.len();
        state.entries.retain(|_, entry| entry.created_at >= before);
        Ok((count - state.entries.len()) as u64)
    }

    // =========================================================================
    // Redemption Code Operations
    // =========================================================================

    async fn insert_codes(&self, codes: &[RedemptionCode]) -> Result<()> {
        let mut state = self.state();
        if let Some(taken) = codes.iter().find(|c| state.codes.contains_key(&c.code)) {
            return Err(StoreError::conflict("redemption code", &taken.code));
        }
        for code in codes {
            state.codes.insert(code.code.clone(), code.clone());
        }
        Ok(())
    }

    async fn get_code(&self, code: &str) -> Result<Option<RedemptionCode>> {
        Ok(self.state().codes.get(code).cloned())
    }

    async fn search_codes(
        &self,
        keyword: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(u64, Vec<RedemptionCode>)> {
        let state = self.state();
        let mut matching: Vec<_> = state
            .codes
            .values()
            .filter(|c| keyword.map_or(true, |k| c.code == k || c.purpose == k))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.code.cmp(&b.code)));
        let total = matching.len() as u64;
        Ok((total, page(matching, limit, offset)))
    }

    async fn update_unclaimed_code(&self, code: &RedemptionCode) -> Result<bool> {
        let mut state = self.state();
        match state.codes.get_mut(&code.code) {
            Some(stored) if !stored.is_claimed() => {
                stored.purpose.clone_from(&code.purpose);
                stored.amount = code.amount;
                stored.expired_at = code.expired_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_unclaimed_code(&self, code: &str) -> Result<bool> {
        let mut state = self.state();
        if state.codes.get(code).is_some_and(|c| !c.is_claimed()) {
            state.codes.remove(code);
            return Ok(true);
        }
        Ok(false)
    }

    async fn mark_code_claimed(
        &self,
        code: &str,
        user_id: &UserId,
        received_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        match state.codes.get_mut(code) {
            Some(stored) if !stored.is_claimed() => {
                stored.user_id = Some(*user_id);
                stored.received_at = Some(received_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // =========================================================================
    // Daily Grant Operations
    // =========================================================================

    async fn insert_daily_grant(&self, grant: &DailyGrant) -> Result<bool> {
        let mut state = self.state();
        let key = grant.key();
        if state.grants.contains_key(&key) {
            return Ok(false);
        }
        state.grants.insert(key, grant.clone());
        Ok(true)
    }

    async fn remove_daily_grant(&self, key: &GrantKey) -> Result<()> {
        self.state().grants.remove(key);
        Ok(())
    }

    async fn has_daily_grant(&self, key: &GrantKey) -> Result<bool> {
        Ok(self.state().grants.contains_key(key))
    }

    async fn list_daily_grants(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<(u64, Vec<DailyGrant>)> {
        let state = self.state();
        let mut grants: Vec<_> = state
            .grants
            .values()
            .filter(|g| g.user_id == *user_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| {
            b.grant_date
                .cmp(&a.grant_date)
                .then_with(|| a.subscription_id.cmp(&b.subscription_id))
        });
        let total = grants.len() as u64;
        Ok((total, page(grants, limit, offset)))
    }

    // =========================================================================
    // Reconciliation Ticket Operations
    // =========================================================================

    async fn insert_ticket(&self, ticket: &ReconciliationTicket) -> Result<()> {
        let mut state = self.state();
        if state.tickets.contains_key(&ticket.id) {
            return Err(StoreError::conflict("reconciliation ticket", &ticket.id));
        }
        state.tickets.insert(ticket.id.clone(), ticket.clone());
        Ok(())
    }

    async fn get_ticket(&self, id: &TicketId) -> Result<Option<ReconciliationTicket>> {
        Ok(self.state().tickets.get(id).cloned())
    }

    async fn settle_ticket(
        &self,
        id: &TicketId,
        detail: &serde_json::Value,
        settled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        let ticket = state
            .tickets
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("reconciliation ticket", id))?;
        if ticket.is_settled() {
            return Ok(false);
        }
        ticket.status = TicketStatus::Settled;
        ticket.detail = detail.clone();
        ticket.settled_at = Some(settled_at);
        Ok(true)
    }

    async fn list_tickets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationTicket>> {
        let state = self.state();
        let mut tickets: Vec<_> = state
            .tickets
            .values()
            .filter(|t| t.created_at >= start && t.created_at < end)
            .cloned()
            .collect();
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tickets)
    }
}

#[async_trait]
impl SubscriptionRegistry for MemoryStore {
    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<ActiveSubscription>> {
        let state = self.state();
        let mut active: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.expires_at > now)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        Ok(active)
    }
}

/// In-process lease table, keyed by lock name.
#[derive(Default)]
pub struct MemoryLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLock {
    /// Create an empty lease table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if leases.get(key).is_some_and(|(_, expires)| *expires > now) {
            return Ok(false);
        }
        let expires = now.checked_add(ttl).unwrap_or(now + Duration::from_secs(86_400));
        leases.insert(key.to_owned(), (token.to_owned(), expires));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match leases.get(key) {
            Some((holder, expires)) if holder == token && *expires > now => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
