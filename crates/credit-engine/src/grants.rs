//! Recurring daily subscription grants.
//!
//! Each active subscription earns its plan's daily credits once per calendar
//! day. The day is keyed by its start in a fixed UTC offset, and the grant row
//! is inserted before the ledger is touched: the row's uniqueness on
//! `(user, subscription, day)` is what keeps repeated or overlapping runs from
//! granting twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use credit_core::{
    day_start, ActiveSubscription, Balance, Clock, DailyGrant, EntryDetail, EntrySource,
    GrantKey, PlanId, SubscriptionId, UserId,
};
use credit_store::{Store, SubscriptionRegistry};

use crate::error::{EngineError, Result};
use crate::ledger::Ledger;
use crate::paging::{self, Page};

/// Outcome of granting one subscription's daily credits.
#[derive(Debug, Clone, PartialEq)]
pub enum GrantOutcome {
    /// Credits were granted; the balance after the grant.
    Granted(Balance),
    /// Today's credits had been granted already.
    AlreadyGranted,
}

/// A subscription whose grant failed during a batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantFailure {
    /// The subscription.
    pub subscription_id: SubscriptionId,

    /// Its owner.
    pub user_id: UserId,

    /// What went wrong.
    pub error: String,
}

/// Summary of a batch run over all active subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GrantReport {
    /// Subscriptions credited in this run.
    pub granted: usize,

    /// Subscriptions that had been credited today already.
    pub already_granted: usize,

    /// Subscriptions skipped as expired or without daily credits.
    pub skipped: usize,

    /// Subscriptions whose grant failed.
    pub failures: Vec<GrantFailure>,
}

/// Grants daily subscription credits.
pub struct DailyGrantScheduler {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    registry: Arc<dyn SubscriptionRegistry>,
    clock: Arc<dyn Clock>,
    utc_offset: FixedOffset,
}

impl DailyGrantScheduler {
    /// Create a scheduler whose calendar days start at midnight in `utc_offset`.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        registry: Arc<dyn SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            ledger,
            registry,
            clock,
            utc_offset,
        }
    }

    /// Start of the current calendar day.
    #[must_use]
    pub fn today(&self) -> DateTime<Utc> {
        day_start(self.clock.now(), self.utc_offset)
    }

    /// Check whether today's credits for a subscription have been granted.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn has_granted_today(
        &self,
        user_id: &UserId,
        subscription_id: &SubscriptionId,
    ) -> Result<bool> {
        let key = GrantKey {
            user_id: *user_id,
            subscription_id: subscription_id.clone(),
            grant_date: self.today(),
        };
        Ok(self.store.has_daily_grant(&key).await?)
    }

    /// Grant today's credits for a subscription unless already granted.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for a non-positive amount.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached. The
    ///   grant row is removed again when the ledger write fails, so a later
    ///   run retries.
    pub async fn grant_daily_credits(
        &self,
        user_id: &UserId,
        subscription_id: &SubscriptionId,
        plan_id: &PlanId,
        amount: Decimal,
    ) -> Result<GrantOutcome> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "daily credits must be positive".into(),
            ));
        }

        let grant = DailyGrant::new(
            *user_id,
            subscription_id.clone(),
            plan_id.clone(),
            self.today(),
            amount,
        );
        if !self.store.insert_daily_grant(&grant).await? {
            tracing::debug!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                grant_date = %grant.grant_date,
                "Daily credits already granted"
            );
            return Ok(GrantOutcome::AlreadyGranted);
        }

        let detail = EntryDetail::new(EntrySource::DailyGrant, format!("daily credits for plan {plan_id}"))
            .with_metadata(json!({
                "subscription_id": subscription_id,
                "plan_id": plan_id,
                "grant_date": grant.grant_date,
            }));
        match self.ledger.grant(user_id, amount, detail).await {
            Ok(balance) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    plan_id = %plan_id,
                    amount = %amount,
                    new_balance = %balance.amount,
                    "Daily credits granted"
                );
                Ok(GrantOutcome::Granted(balance))
            }
            Err(e) => {
                if let Err(undo) = self.store.remove_daily_grant(&grant.key()).await {
                    tracing::error!(
                        user_id = %user_id,
                        subscription_id = %subscription_id,
                        grant_date = %grant.grant_date,
                        error = %undo,
                        "Failed to remove grant row after ledger failure; today's grant is lost"
                    );
                }
                Err(e)
            }
        }
    }

    /// Grant today's credits to every active subscription.
    ///
    /// Each subscription is handled independently. Failures are logged and
    /// reported, never aborting the run.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StorageUnavailable` only if the subscription
    /// registry cannot be read.
    pub async fn process_all_users(&self) -> Result<GrantReport> {
        let now = self.clock.now();
        let subscriptions = self.registry.active_subscriptions(now).await?;
        tracing::info!(
            subscriptions = subscriptions.len(),
            grant_date = %self.today(),
            "Processing daily grants"
        );

        let mut report = GrantReport::default();
        for subscription in subscriptions {
            if !subscription.is_grantable_at(now) {
                report.skipped += 1;
                continue;
            }
            match self.grant_subscription(&subscription).await {
                Ok(GrantOutcome::Granted(_)) => report.granted += 1,
                Ok(GrantOutcome::AlreadyGranted) => report.already_granted += 1,
                Err(e) => {
                    tracing::warn!(
                        user_id = %subscription.user_id,
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Daily grant failed"
                    );
                    report.failures.push(GrantFailure {
                        subscription_id: subscription.subscription_id,
                        user_id: subscription.user_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            granted = report.granted,
            already_granted = report.already_granted,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Daily grants processed"
        );
        Ok(report)
    }

    async fn grant_subscription(&self, subscription: &ActiveSubscription) -> Result<GrantOutcome> {
        self.grant_daily_credits(
            &subscription.user_id,
            &subscription.subscription_id,
            &subscription.plan_id,
            subscription.daily_credits,
        )
        .await
    }

    /// Daily grants of a user, newest first.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for page 0 or a page size outside `1..=1000`.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn user_grant_history(
        &self,
        user_id: &UserId,
        page: usize,
        limit: usize,
    ) -> Result<Page<DailyGrant>> {
        let (limit, offset) = paging::bounds(page, limit)?;
        let (total, items) = self.store.list_daily_grants(user_id, limit, offset).await?;
        Ok(Page { total, items })
    }

    fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.utc_offset).date_naive()
    }

    fn local_hour(&self, now: DateTime<Utc>) -> u32 {
        now.with_timezone(&self.utc_offset).hour()
    }
}

/// When the background loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantSchedule {
    /// Local hour from which the daily run may start.
    pub grant_hour: u32,

    /// How often to check whether a run is due.
    pub check_interval: Duration,

    /// Delete ledger entries older than this many days after each run.
    pub retention_days: Option<u32>,
}

impl Default for GrantSchedule {
    fn default() -> Self {
        Self {
            grant_hour: 1,
            check_interval: Duration::from_secs(3600),
            retention_days: None,
        }
    }
}

/// Run daily grants until `shutdown` turns `true` or its sender is dropped.
///
/// Wakes up every `check_interval` and runs
/// [`process_all_users`](DailyGrantScheduler::process_all_users) once per
/// local calendar day, at the first check at or after `grant_hour`. A failed
/// run is retried at the next check.
pub async fn run_daily(
    scheduler: Arc<DailyGrantScheduler>,
    schedule: GrantSchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(schedule.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_run: Option<NaiveDate> = None;

    tracing::info!(
        grant_hour = schedule.grant_hour,
        check_interval_secs = schedule.check_interval.as_secs(),
        "Daily grant loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let now = scheduler.clock.now();
        let today = scheduler.local_date(now);
        if last_run == Some(today) || scheduler.local_hour(now) < schedule.grant_hour {
            continue;
        }

        match scheduler.process_all_users().await {
            Ok(_) => last_run = Some(today),
            Err(e) => {
                tracing::error!(error = %e, "Daily grant run failed, retrying at next check");
                continue;
            }
        }

        if let Some(days) = schedule.retention_days {
            let cutoff = now - chrono::Duration::days(i64::from(days));
            if let Err(e) = scheduler.ledger.prune_entries_before(cutoff).await {
                tracing::warn!(error = %e, "Ledger pruning failed");
            }
        }
    }

    tracing::info!("Daily grant loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use credit_core::ManualClock;
    use credit_store::{MemoryStore, StoreError};
    use rust_decimal_macros::dec;

    use crate::config::{Settings, SettingsHandle};

    struct Fixture {
        scheduler: Arc<DailyGrantScheduler>,
        ledger: Arc<Ledger>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture_at(now: DateTime<Utc>, offset: FixedOffset) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            Arc::new(SettingsHandle::new(Settings::default())),
            Decimal::ZERO,
        ));
        let clock = Arc::new(ManualClock::new(now));
        let scheduler = Arc::new(DailyGrantScheduler::new(
            store.clone(),
            Arc::clone(&ledger),
            store.clone(),
            clock.clone(),
            offset,
        ));
        Fixture {
            scheduler,
            ledger,
            store,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
            FixedOffset::east_opt(0).unwrap(),
        )
    }

    fn subscription(user_id: UserId, id: &str, credits: Decimal, expires_at: DateTime<Utc>) -> ActiveSubscription {
        ActiveSubscription {
            subscription_id: SubscriptionId::new(id).unwrap(),
            user_id,
            plan_id: PlanId::new("pro").unwrap(),
            daily_credits: credits,
            expires_at,
        }
    }

    #[tokio::test]
    async fn grants_once_per_day() {
        let f = fixture();
        let user_id = UserId::generate();
        let sub = SubscriptionId::new("sub-1").unwrap();
        let plan = PlanId::new("pro").unwrap();

        let first = f.scheduler.grant_daily_credits(&user_id, &sub, &plan, dec!(10)).await.unwrap();
        assert!(matches!(first, GrantOutcome::Granted(ref b) if b.amount == dec!(10)));
        assert!(f.scheduler.has_granted_today(&user_id, &sub).await.unwrap());

        f.clock.advance(chrono::Duration::hours(3));
        let second = f.scheduler.grant_daily_credits(&user_id, &sub, &plan, dec!(10)).await.unwrap();
        assert_eq!(second, GrantOutcome::AlreadyGranted);
        assert_eq!(f.ledger.get_balance(&user_id).await.unwrap().amount, dec!(10));

        f.clock.advance(chrono::Duration::days(1));
        assert!(!f.scheduler.has_granted_today(&user_id, &sub).await.unwrap());
        f.scheduler.grant_daily_credits(&user_id, &sub, &plan, dec!(10)).await.unwrap();
        assert_eq!(f.ledger.get_balance(&user_id).await.unwrap().amount, dec!(20));

        let history = f.scheduler.user_grant_history(&user_id, 1, 10).await.unwrap();
        assert_eq!(history.total, 2);
        assert!(history.items[0].grant_date > history.items[1].grant_date);
    }

    #[tokio::test]
    async fn day_boundary_follows_offset() {
        // 23:30 UTC is already the next day at UTC+8.
        let f = fixture_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap(),
            FixedOffset::east_opt(8 * 3600).unwrap(),
        );
        assert_eq!(
            f.scheduler.today(),
            Utc.with_ymd_and_hms(2024, 6, 1, 16, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn rejects_non_positive_amount() {
        let f = fixture();
        let result = f
            .scheduler
            .grant_daily_credits(
                &UserId::generate(),
                &SubscriptionId::new("sub").unwrap(),
                &PlanId::new("free").unwrap(),
                Decimal::ZERO,
            )
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn process_all_users_skips_and_reports() {
        let f = fixture();
        let now = f.clock.now();
        let alice = UserId::generate();
        let bob = UserId::generate();
        let carol = UserId::generate();
        f.store.put_subscription(subscription(alice, "sub-a", dec!(5), now + chrono::Duration::days(30)));
        f.store.put_subscription(subscription(bob, "sub-b", dec!(7), now + chrono::Duration::days(30)));
        f.store.put_subscription(subscription(carol, "sub-c", Decimal::ZERO, now + chrono::Duration::days(30)));

        let report = f.scheduler.process_all_users().await.unwrap();
        assert_eq!(report.granted, 2);
        assert_eq!(report.skipped, 1);
        assert!(report.failures.is_empty());

        let again = f.scheduler.process_all_users().await.unwrap();
        assert_eq!(again.granted, 0);
        assert_eq!(again.already_granted, 2);

        assert_eq!(f.ledger.get_balance(&alice).await.unwrap().amount, dec!(5));
        assert_eq!(f.ledger.get_balance(&bob).await.unwrap().amount, dec!(7));
    }

    /// Store whose ledger writes always fail.
    struct FailingLedgerStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for FailingLedgerStore {
        async fn get_balance(&self, user_id: &UserId) -> credit_store::Result<Option<Balance>> {
            self.inner.get_balance(user_id).await
        }
        async fn open_balance(&self, user_id: &UserId, opening: Decimal) -> credit_store::Result<Balance> {
            self.inner.open_balance(user_id, opening).await
        }
        async fn add_balance(&self, _entry: &credit_core::LedgerEntry) -> credit_store::Result<Balance> {
            Err(StoreError::Busy("lock timeout".into()))
        }
        async fn set_balance(
            &self,
            user_id: &UserId,
            amount: Decimal,
            detail: &EntryDetail,
        ) -> credit_store::Result<Balance> {
            self.inner.set_balance(user_id, amount, detail).await
        }
        async fn list_entries(
            &self,
            user_id: Option<&UserId>,
            limit: usize,
            offset: usize,
        ) -> credit_store::Result<Vec<credit_core::LedgerEntry>> {
            self.inner.list_entries(user_id, limit, offset).await
        }
        async fn count_entries(&self, user_id: Option<&UserId>) -> credit_store::Result<u64> {
            self.inner.count_entries(user_id).await
        }
        async fn list_entries_between(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> credit_store::Result<Vec<credit_core::LedgerEntry>> {
            self.inner.list_entries_between(start, end).await
        }
        async fn delete_entries_before(&self, before: DateTime<Utc>) -> credit_store::Result<u64> {
            self.inner.delete_entries_before(before).await
        }
        async fn insert_codes(&self, codes: &[credit_core::RedemptionCode]) -> credit_store::Result<()> {
            self.inner.insert_codes(codes).await
        }
        async fn get_code(&self, code: &str) -> credit_store::Result<Option<credit_core::RedemptionCode>> {
            self.inner.get_code(code).await
        }
        async fn search_codes(
            &self,
            keyword: Option<&str>,
            limit: usize,
            offset: usize,
        ) -> credit_store::Result<(u64, Vec<credit_core::RedemptionCode>)> {
            self.inner.search_codes(keyword, limit, offset).await
        }
        async fn update_unclaimed_code(&self, code: &credit_core::RedemptionCode) -> credit_store::Result<bool> {
            self.inner.update_unclaimed_code(code).await
        }
        async fn delete_unclaimed_code(&self, code: &str) -> credit_store::Result<bool> {
            self.inner.delete_unclaimed_code(code).await
        }
        async fn mark_code_claimed(
            &self,
            code: &str,
            user_id: &UserId,
            received_at: DateTime<Utc>,
        ) -> credit_store::Result<bool> {
            self.inner.mark_code_claimed(code, user_id, received_at).await
        }
        async fn insert_daily_grant(&self, grant: &DailyGrant) -> credit_store::Result<bool> {
            self.inner.insert_daily_grant(grant).await
        }
        async fn remove_daily_grant(&self, key: &GrantKey) -> credit_store::Result<()> {
            self.inner.remove_daily_grant(key).await
        }
        async fn has_daily_grant(&self, key: &GrantKey) -> credit_store::Result<bool> {
            self.inner.has_daily_grant(key).await
        }
        async fn list_daily_grants(
            &self,
            user_id: &UserId,
            limit: usize,
            offset: usize,
        ) -> credit_store::Result<(u64, Vec<DailyGrant>)> {
            self.inner.list_daily_grants(user_id, limit, offset).await
        }
        async fn insert_ticket(&self, ticket: &credit_core::ReconciliationTicket) -> credit_store::Result<()> {
            self.inner.insert_ticket(ticket).await
        }
        async fn get_ticket(
            &self,
            id: &credit_core::TicketId,
        ) -> credit_store::Result<Option<credit_core::ReconciliationTicket>> {
            self.inner.get_ticket(id).await
        }
        async fn settle_ticket(
            &self,
            id: &credit_core::TicketId,
            detail: &serde_json::Value,
            settled_at: DateTime<Utc>,
        ) -> credit_store::Result<bool> {
            self.inner.settle_ticket(id, detail, settled_at).await
        }
        async fn list_tickets_between(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> credit_store::Result<Vec<credit_core::ReconciliationTicket>> {
            self.inner.list_tickets_between(start, end).await
        }
    }

    #[tokio::test]
    async fn failed_ledger_write_removes_grant_row() {
        let store = Arc::new(FailingLedgerStore {
            inner: MemoryStore::new(),
        });
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            Arc::new(SettingsHandle::new(Settings::default())),
            Decimal::ZERO,
        ));
        let registry = Arc::new(MemoryStore::new());
        let scheduler = DailyGrantScheduler::new(
            store.clone(),
            ledger,
            registry,
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())),
            FixedOffset::east_opt(0).unwrap(),
        );
        let user_id = UserId::generate();
        let sub = SubscriptionId::new("sub-1").unwrap();

        let err = scheduler
            .grant_daily_credits(&user_id, &sub, &PlanId::new("pro").unwrap(), dec!(10))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!scheduler.has_granted_today(&user_id, &sub).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn run_daily_grants_after_grant_hour_and_stops() {
        let f = fixture_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 30, 0).unwrap(),
            FixedOffset::east_opt(0).unwrap(),
        );
        let user_id = UserId::generate();
        f.store.put_subscription(subscription(
            user_id,
            "sub-1",
            dec!(3),
            f.clock.now() + chrono::Duration::days(30),
        ));

        let (tx, rx) = watch::channel(false);
        let schedule = GrantSchedule {
            grant_hour: 1,
            check_interval: Duration::from_secs(60),
            retention_days: None,
        };
        let handle = tokio::spawn(run_daily(Arc::clone(&f.scheduler), schedule, rx));

        // Before the grant hour nothing happens.
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(f.ledger.get_balance(&user_id).await.unwrap().amount, Decimal::ZERO);

        f.clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 1, 5, 0).unwrap());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.ledger.get_balance(&user_id).await.unwrap().amount, dec!(3));

        // Further checks on the same day don't grant again.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(f.ledger.get_balance(&user_id).await.unwrap().amount, dec!(3));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
