//! Balance operations.
//!
//! [`Ledger`] is the only component that changes balances. Every change goes
//! through a single atomic store call that applies the delta and appends the
//! matching [`LedgerEntry`], so the balance of a user always equals the sum of
//! its entries.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;

use credit_core::{
    round_charge, round_credit, Balance, BilledBy, CostBreakdown, EntryDetail, EntrySource,
    LedgerEntry, ModelPricing, PricingConfig, TaskRef, UsageDescriptor, UserId, CREDIT_SCALE,
};
use credit_store::Store;

use crate::config::SettingsHandle;
use crate::error::{EngineError, Result};
use crate::paging::{self, Page};

/// The result of charging a usage event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageCharge {
    /// How the charge was priced.
    pub cost: CostBreakdown,

    /// Balance after the charge.
    pub balance: Balance,
}

/// Balance and ledger operations for all users.
pub struct Ledger {
    store: Arc<dyn Store>,
    settings: Arc<SettingsHandle>,
    default_balance: Decimal,
}

impl Ledger {
    /// Create a ledger over `store`.
    ///
    /// Users seen for the first time start with `default_balance`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, settings: Arc<SettingsHandle>, default_balance: Decimal) -> Self {
        Self {
            store,
            settings,
            default_balance: round_credit(default_balance),
        }
    }

    /// Get the balance of a user, opening it on first access.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<Balance> {
        if let Some(balance) = self.store.get_balance(user_id).await? {
            return Ok(balance);
        }
        let balance = self.store.open_balance(user_id, self.default_balance).await?;
        tracing::debug!(
            user_id = %user_id,
            opening = %balance.amount,
            "Balance opened"
        );
        Ok(balance)
    }

    /// Apply a signed delta to the balance of a user.
    ///
    /// Negative deltas are rounded away from zero, positive deltas to the
    /// nearest ledger unit. No balance check is made.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` if the delta rounds to zero.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn add_balance(
        &self,
        user_id: &UserId,
        delta: Decimal,
        detail: EntryDetail,
    ) -> Result<Balance> {
        let delta = if delta.is_sign_negative() {
            round_charge(delta)
        } else {
            round_credit(delta)
        };
        if delta.is_zero() {
            return Err(EngineError::Validation(
                "balance change must not be zero".into(),
            ));
        }
        self.apply(user_id, delta, detail).await
    }

    /// Overwrite the balance of a user.
    ///
    /// The entry records the difference to the previous amount.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for a negative amount.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn set_balance(
        &self,
        user_id: &UserId,
        amount: Decimal,
        detail: EntryDetail,
    ) -> Result<Balance> {
        if amount < Decimal::ZERO {
            return Err(EngineError::Validation(
                "balance must not be negative".into(),
            ));
        }
        self.get_balance(user_id).await?;

        let balance = self
            .store
            .set_balance(user_id, round_credit(amount), &detail)
            .await?;
        tracing::info!(
            user_id = %user_id,
            source = detail.source.as_str(),
            new_balance = %balance.amount,
            "Balance set"
        );
        Ok(balance)
    }

    /// Deduct `amount` if the balance covers it.
    ///
    /// The amount is rounded up to ledger precision before the check. A
    /// failed check writes nothing.
    ///
    /// Two concurrent deductions can both pass the check before either is
    /// applied; the overshoot is bounded by the in-flight amounts.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for a non-positive amount.
    /// - `EngineError::InsufficientCredit` if the balance is too low.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn deduct(
        &self,
        user_id: &UserId,
        amount: Decimal,
        detail: EntryDetail,
    ) -> Result<Balance> {
        let amount = positive(round_charge(amount), "deduction")?;

        let balance = self.get_balance(user_id).await?;
        if !balance.covers(amount) {
            tracing::warn!(
                user_id = %user_id,
                balance = %balance.amount,
                required = %amount,
                source = detail.source.as_str(),
                "Deduction rejected: insufficient credit"
            );
            return Err(EngineError::InsufficientCredit {
                balance: balance.amount,
                required: amount,
            });
        }

        self.apply(user_id, -amount, detail).await
    }

    /// Credit a positive amount.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for a non-positive amount.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn grant(
        &self,
        user_id: &UserId,
        amount: Decimal,
        detail: EntryDetail,
    ) -> Result<Balance> {
        let amount = positive(round_credit(amount), "grant")?;
        self.apply(user_id, amount, detail).await
    }

    /// Return a previously deducted amount.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for a non-positive amount.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn refund(
        &self,
        user_id: &UserId,
        amount: Decimal,
        detail: EntryDetail,
    ) -> Result<Balance> {
        self.grant(user_id, amount, detail).await
    }

    /// Charge for submitting a generation task.
    ///
    /// # Errors
    ///
    /// Same as [`deduct`](Self::deduct).
    pub async fn charge_task(
        &self,
        user_id: &UserId,
        task: &TaskRef,
        amount: Decimal,
    ) -> Result<Balance> {
        let detail = EntryDetail::new(
            EntrySource::TaskCharge,
            format!("{} task {}", task.provider, task.task_id),
        )
        .with_metadata(task_metadata(task));
        self.deduct(user_id, amount, detail).await
    }

    /// Refund the charge of a generation task that failed.
    ///
    /// # Errors
    ///
    /// Same as [`grant`](Self::grant).
    pub async fn refund_task(
        &self,
        user_id: &UserId,
        task: &TaskRef,
        amount: Decimal,
    ) -> Result<Balance> {
        let detail = EntryDetail::new(
            EntrySource::TaskRefund,
            format!("{} task {} failed", task.provider, task.task_id),
        )
        .with_metadata(task_metadata(task));
        self.refund(user_id, amount, detail).await
    }

    /// Price and charge a completed chat request.
    ///
    /// The usage has already been consumed, so the charge is recorded even
    /// when it takes the balance below zero. Use
    /// [`check_credit`](Self::check_credit) before calling the model. A
    /// zero-cost request writes no entry.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` if the usage names an unknown feature.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn charge_usage(
        &self,
        user_id: &UserId,
        model: &str,
        usage: &UsageDescriptor,
    ) -> Result<UsageCharge> {
        let settings = self.settings.snapshot();
        let cost = settings.pricing.calculate(model, usage)?;

        if cost.total.is_zero() {
            let balance = self.get_balance(user_id).await?;
            return Ok(UsageCharge { cost, balance });
        }

        let pricing = settings.pricing.pricing_for(model, usage.embedding);
        // Token billing mixes three rates; they are kept in the metadata.
        let detail = match cost.billed_by {
            BilledBy::Request => EntryDetail::new(EntrySource::ChatUsage, format!("{model} request"))
                .with_pricing(pricing.request_price, Decimal::ONE),
            BilledBy::Tokens => EntryDetail::new(EntrySource::ChatUsage, format!("{model} tokens"))
                .with_quantity(Decimal::from(usage.tokens.total_tokens())),
        }
        .with_metadata(json!({
            "model": model,
            "embedding": usage.embedding,
            "prompt_tokens": usage.tokens.prompt_tokens,
            "completion_tokens": usage.tokens.completion_tokens,
            "cached_tokens": usage.tokens.cached_tokens,
            "prompt_per_million": pricing.prompt_per_million,
            "prompt_cache_per_million": pricing.prompt_cache_per_million,
            "completion_per_million": pricing.completion_per_million,
            "features": usage.features,
            "custom_fees": usage.custom_fees,
            "cost": cost,
        }));

        let balance = self.apply(user_id, -cost.total, detail).await?;
        Ok(UsageCharge { cost, balance })
    }

    /// Check that a user may start a request against `model`.
    ///
    /// Free requests pass without reading the balance. Otherwise the balance
    /// must be positive and at least the model's minimum cost.
    ///
    /// # Errors
    ///
    /// - `EngineError::InsufficientCredit` if the balance is too low.
    /// - `EngineError::Validation` for an unknown feature.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn check_credit(
        &self,
        user_id: &UserId,
        model: &str,
        features: &BTreeSet<String>,
    ) -> Result<()> {
        let settings = self.settings.snapshot();
        self.check_credit_with(user_id, model, settings.pricing.model(model), features, &settings.pricing)
            .await
    }

    /// Check that a user may start an embedding request.
    ///
    /// Same rules as [`check_credit`](Self::check_credit), against the
    /// embedding pricing.
    ///
    /// # Errors
    ///
    /// Same as [`check_credit`](Self::check_credit).
    pub async fn check_embedding_credit(
        &self,
        user_id: &UserId,
        model: &str,
        features: &BTreeSet<String>,
    ) -> Result<()> {
        let settings = self.settings.snapshot();
        self.check_credit_with(user_id, model, &settings.pricing.embedding, features, &settings.pricing)
            .await
    }

    async fn check_credit_with(
        &self,
        user_id: &UserId,
        model: &str,
        pricing: &ModelPricing,
        features: &BTreeSet<String>,
        config: &PricingConfig,
    ) -> Result<()> {
        if config.is_free_with(pricing, features)? {
            tracing::debug!(user_id = %user_id, model = %model, "Free request, skipping credit check");
            return Ok(());
        }

        let minimum = pricing.minimum_cost;
        let balance = self.get_balance(user_id).await?;
        if balance.amount <= Decimal::ZERO || balance.amount < minimum {
            tracing::debug!(
                user_id = %user_id,
                model = %model,
                balance = %balance.amount,
                minimum = %minimum,
                "Credit check failed"
            );
            return Err(EngineError::InsufficientCredit {
                balance: balance.amount,
                required: minimum.max(Decimal::new(1, CREDIT_SCALE)),
            });
        }
        Ok(())
    }

    /// List ledger entries newest first, optionally for one user.
    ///
    /// `page` is 1-based.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for page 0 or a page size outside `1..=1000`.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn list_entries(
        &self,
        user_id: Option<&UserId>,
        page: usize,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let (limit, offset) = paging::bounds(page, limit)?;
        Ok(self.store.list_entries(user_id, limit, offset).await?)
    }

    /// List one page of ledger entries together with the total count.
    ///
    /// # Errors
    ///
    /// Same as [`list_entries`](Self::list_entries).
    pub async fn entries_page(
        &self,
        user_id: Option<&UserId>,
        page: usize,
        limit: usize,
    ) -> Result<Page<LedgerEntry>> {
        let items = self.list_entries(user_id, page, limit).await?;
        let total = self.count_entries(user_id).await?;
        Ok(Page { total, items })
    }

    /// Count ledger entries, optionally for one user.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn count_entries(&self, user_id: Option<&UserId>) -> Result<u64> {
        Ok(self.store.count_entries(user_id).await?)
    }

    /// Ledger entries created in `[start, end)`, oldest first.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` if `end` is before `start`.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        if end < start {
            return Err(EngineError::Validation("end must not precede start".into()));
        }
        Ok(self.store.list_entries_between(start, end).await?)
    }

    /// Delete ledger entries created before `before`. Balances are untouched.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn prune_entries_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_entries_before(before).await?;
        tracing::info!(before = %before, deleted, "Ledger entries pruned");
        Ok(deleted)
    }

    async fn apply(&self, user_id: &UserId, delta: Decimal, detail: EntryDetail) -> Result<Balance> {
        self.get_balance(user_id).await?;

        let source = detail.source;
        let entry = LedgerEntry::new(*user_id, delta, detail);
        let balance = self.store.add_balance(&entry).await?;

        tracing::info!(
            user_id = %user_id,
            entry_id = %entry.id,
            source = source.as_str(),
            delta = %delta,
            new_balance = %balance.amount,
            "Balance changed"
        );
        Ok(balance)
    }
}

fn positive(amount: Decimal, what: &str) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(EngineError::Validation(format!("{what} amount must be positive")));
    }
    Ok(amount)
}

fn task_metadata(task: &TaskRef) -> serde_json::Value {
    json!({
        "provider": task.provider,
        "task_id": task.task_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_core::{CustomFee, TokenUsage};
    use credit_store::MemoryStore;
    use rust_decimal_macros::dec;

    use crate::config::Settings;

    fn pricing() -> PricingConfig {
        PricingConfig::default()
            .with_model(
                "gpt-4o",
                ModelPricing::per_token(dec!(2500), dec!(1250), dec!(10000)),
            )
            .with_model(
                "free-model",
                ModelPricing::per_token(Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
            )
            .with_model(
                "premium",
                ModelPricing::per_token(dec!(1), dec!(1), dec!(1)).with_minimum_cost(dec!(5)),
            )
    }

    fn ledger_with(default_balance: Decimal) -> Ledger {
        let settings = Settings::new(pricing(), Decimal::ONE).unwrap();
        Ledger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SettingsHandle::new(settings)),
            default_balance,
        )
    }

    fn adjust(reason: &str) -> EntryDetail {
        EntryDetail::new(EntrySource::AdminAdjustment, reason)
    }

    async fn sum_of_entries(ledger: &Ledger, user_id: &UserId) -> Decimal {
        ledger
            .list_entries(Some(user_id), 1, 1000)
            .await
            .unwrap()
            .iter()
            .map(|e| e.delta)
            .sum()
    }

    #[tokio::test]
    async fn first_read_opens_with_default_balance() {
        let ledger = ledger_with(dec!(100));
        let user_id = UserId::generate();

        let balance = ledger.get_balance(&user_id).await.unwrap();
        assert_eq!(balance.amount, dec!(100));

        let entries = ledger.list_entries(Some(&user_id), 1, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].detail.source, EntrySource::OpeningBalance);
    }

    #[tokio::test]
    async fn deduct_then_grant_keeps_balance_equal_to_entries() {
        let ledger = ledger_with(dec!(100));
        let user_id = UserId::generate();

        let after_deduct = ledger
            .deduct(&user_id, dec!(3.2), EntryDetail::new(EntrySource::ChatUsage, "chat"))
            .await
            .unwrap();
        assert_eq!(after_deduct.amount, dec!(96.8));

        let after_grant = ledger
            .grant(&user_id, dec!(10), EntryDetail::new(EntrySource::Redemption, "code"))
            .await
            .unwrap();
        assert_eq!(after_grant.amount, dec!(106.8));
        assert_eq!(sum_of_entries(&ledger, &user_id).await, dec!(106.8));
    }

    #[tokio::test]
    async fn insufficient_credit_writes_nothing() {
        let ledger = ledger_with(dec!(1));
        let user_id = UserId::generate();
        ledger.get_balance(&user_id).await.unwrap();

        let err = ledger
            .deduct(&user_id, dec!(2), adjust("too much"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::InsufficientCredit { balance, required }
                if balance == dec!(1) && required == dec!(2)
        ));
        assert_eq!(ledger.get_balance(&user_id).await.unwrap().amount, dec!(1));
        assert_eq!(ledger.count_entries(Some(&user_id)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deductions_round_up() {
        let ledger = ledger_with(dec!(1));
        let user_id = UserId::generate();

        let balance = ledger
            .deduct(&user_id, dec!(0.0000001), adjust("tiny"))
            .await
            .unwrap();
        assert_eq!(balance.amount, dec!(0.999999));
    }

    #[tokio::test]
    async fn rejects_zero_and_negative_amounts() {
        let ledger = ledger_with(Decimal::ZERO);
        let user_id = UserId::generate();

        assert!(matches!(
            ledger.add_balance(&user_id, Decimal::ZERO, adjust("noop")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            ledger.grant(&user_id, dec!(-1), adjust("negative")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            ledger.deduct(&user_id, Decimal::ZERO, adjust("zero")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            ledger.set_balance(&user_id, dec!(-5), adjust("negative")).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn add_balance_allows_negative_results() {
        let ledger = ledger_with(Decimal::ZERO);
        let user_id = UserId::generate();

        let balance = ledger
            .add_balance(&user_id, dec!(-4.5), adjust("correction"))
            .await
            .unwrap();
        assert_eq!(balance.amount, dec!(-4.5));
    }

    #[tokio::test]
    async fn set_balance_records_difference() {
        let ledger = ledger_with(dec!(10));
        let user_id = UserId::generate();

        let balance = ledger
            .set_balance(&user_id, dec!(25), EntryDetail::new(EntrySource::AdminSet, "manual"))
            .await
            .unwrap();
        assert_eq!(balance.amount, dec!(25));

        let entries = ledger.list_entries(Some(&user_id), 1, 10).await.unwrap();
        assert_eq!(entries[0].delta, dec!(15));
        assert_eq!(entries[0].detail.source, EntrySource::AdminSet);
        assert_eq!(sum_of_entries(&ledger, &user_id).await, dec!(25));
    }

    #[tokio::test]
    async fn task_charge_and_refund_carry_task_reference() {
        let ledger = ledger_with(dec!(20));
        let user_id = UserId::generate();
        let task = TaskRef::new("kling", "task-42");

        ledger.charge_task(&user_id, &task, dec!(8)).await.unwrap();
        let balance = ledger.refund_task(&user_id, &task, dec!(8)).await.unwrap();
        assert_eq!(balance.amount, dec!(20));

        let entries = ledger.list_entries(Some(&user_id), 1, 10).await.unwrap();
        assert_eq!(entries[0].detail.source, EntrySource::TaskRefund);
        assert_eq!(entries[0].detail.metadata["task_id"], "task-42");
        assert_eq!(entries[1].detail.source, EntrySource::TaskCharge);
        assert_eq!(entries[1].detail.metadata["provider"], "kling");
    }

    #[tokio::test]
    async fn charge_usage_prices_tokens() {
        let ledger = ledger_with(dec!(10));
        let user_id = UserId::generate();
        let usage = UsageDescriptor::tokens(TokenUsage::new(1000, 500, 0).unwrap())
            .with_feature("web_search")
            .with_fee(CustomFee::new("rerank", dec!(0.01)).unwrap());

        let charge = ledger.charge_usage(&user_id, "gpt-4o", &usage).await.unwrap();

        // 2500 * 1000 / 1e6 + 10000 * 500 / 1e6 = 2.5 + 5 = 7.5, plus 0.2 and 0.01
        assert_eq!(charge.cost.total, dec!(7.71));
        assert_eq!(charge.balance.amount, dec!(2.29));

        let entries = ledger.list_entries(Some(&user_id), 1, 1).await.unwrap();
        assert_eq!(entries[0].detail.source, EntrySource::ChatUsage);
        assert_eq!(entries[0].detail.metadata["prompt_tokens"], 1000);
        assert_eq!(entries[0].detail.quantity, Some(dec!(1500)));
        assert_eq!(entries[0].detail.unit_price, None);
        assert_eq!(entries[0].detail.metadata["completion_per_million"], "10000");
    }

    #[tokio::test]
    async fn embeddings_are_charged_at_embedding_price() {
        let ledger = ledger_with(dec!(10));
        let user_id = UserId::generate();

        // 20k tokens at 100 per million, not at the model's own prices.
        let charge = ledger
            .charge_usage(&user_id, "gpt-4o", &UsageDescriptor::embedding(20_000))
            .await
            .unwrap();
        assert_eq!(charge.cost.total, dec!(2));
        assert_eq!(charge.balance.amount, dec!(8));

        let entries = ledger.list_entries(Some(&user_id), 1, 1).await.unwrap();
        assert_eq!(entries[0].detail.metadata["embedding"], true);
    }

    #[tokio::test]
    async fn embedding_check_uses_embedding_pricing() {
        let ledger = ledger_with(dec!(3));
        let none = BTreeSet::new();

        // "premium" needs 5 credits for chat; embeddings have no minimum.
        assert!(matches!(
            ledger.check_credit(&UserId::generate(), "premium", &none).await,
            Err(EngineError::InsufficientCredit { .. })
        ));
        ledger
            .check_embedding_credit(&UserId::generate(), "premium", &none)
            .await
            .unwrap();

        let unknown = BTreeSet::from(["telepathy".to_string()]);
        assert!(matches!(
            ledger.check_embedding_credit(&UserId::generate(), "premium", &unknown).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn charge_usage_may_overdraw() {
        let ledger = ledger_with(dec!(1));
        let user_id = UserId::generate();
        let usage = UsageDescriptor::tokens(TokenUsage::new(0, 1000, 0).unwrap());

        let charge = ledger.charge_usage(&user_id, "gpt-4o", &usage).await.unwrap();
        assert_eq!(charge.balance.amount, dec!(-9));
    }

    #[tokio::test]
    async fn free_usage_writes_no_entry() {
        let ledger = ledger_with(dec!(5));
        let user_id = UserId::generate();
        let usage = UsageDescriptor::tokens(TokenUsage::new(1000, 1000, 0).unwrap());

        let charge = ledger.charge_usage(&user_id, "free-model", &usage).await.unwrap();
        assert!(charge.cost.total.is_zero());
        assert_eq!(ledger.count_entries(Some(&user_id)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn check_credit_skips_free_requests() {
        let ledger = ledger_with(Decimal::ZERO);
        let user_id = UserId::generate();

        ledger
            .check_credit(&user_id, "free-model", &BTreeSet::new())
            .await
            .unwrap();
        assert!(ledger.store.get_balance(&user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn check_credit_rejects_empty_and_below_minimum() {
        let ledger = ledger_with(dec!(3));
        let user_id = UserId::generate();

        ledger
            .check_credit(&user_id, "gpt-4o", &BTreeSet::new())
            .await
            .unwrap();

        let err = ledger
            .check_credit(&user_id, "premium", &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientCredit { required, .. } if required == dec!(5)
        ));

        let broke = UserId::generate();
        let empty = ledger_with(Decimal::ZERO);
        assert!(matches!(
            empty.check_credit(&broke, "gpt-4o", &BTreeSet::new()).await,
            Err(EngineError::InsufficientCredit { .. })
        ));
    }

    #[tokio::test]
    async fn check_credit_rejects_unknown_feature() {
        let ledger = ledger_with(dec!(3));
        let features = BTreeSet::from(["telepathy".to_string()]);

        assert!(matches!(
            ledger.check_credit(&UserId::generate(), "gpt-4o", &features).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn list_entries_rejects_page_zero() {
        let ledger = ledger_with(Decimal::ZERO);
        assert!(matches!(
            ledger.list_entries(None, 0, 10).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn entries_page_reports_total() {
        let ledger = ledger_with(Decimal::ZERO);
        let user_id = UserId::generate();
        for _ in 0..3 {
            ledger.grant(&user_id, dec!(1), adjust("bonus")).await.unwrap();
        }

        let page = ledger.entries_page(Some(&user_id), 2, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn pruning_keeps_balances() {
        let ledger = ledger_with(Decimal::ZERO);
        let user_id = UserId::generate();
        ledger.grant(&user_id, dec!(7), adjust("bonus")).await.unwrap();

        let deleted = ledger
            .prune_entries_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(ledger.get_balance(&user_id).await.unwrap().amount, dec!(7));
        assert_eq!(ledger.count_entries(Some(&user_id)).await.unwrap(), 0);
    }
}
