//! Redemption code claims and administration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use credit_core::{Balance, Clock, CodeState, EntryDetail, EntrySource, RedemptionCode, UserId};
use credit_store::{DistributedLock, Store};

use crate::error::{EngineError, Result};
use crate::ledger::Ledger;
use crate::paging::{self, Page};

/// Claims redemption codes exactly once and manages the code catalogue.
pub struct RedemptionDesk {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    lock: Arc<dyn DistributedLock>,
    clock: Arc<dyn Clock>,
    lock_ttl: Duration,
}

impl RedemptionDesk {
    /// Create a desk.
    ///
    /// `lock_ttl` must exceed the time a claim takes from lock to release.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        lock: Arc<dyn DistributedLock>,
        clock: Arc<dyn Clock>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            lock,
            clock,
            lock_ttl,
        }
    }

    /// Claim `code` for `user_id` and credit its amount.
    ///
    /// Of any number of concurrent claims on one code at most one succeeds.
    ///
    /// # Errors
    ///
    /// - `EngineError::CodeNotFound` if the code doesn't exist.
    /// - `EngineError::CodeAlreadyClaimed` if it was claimed before or a
    ///   concurrent claim holds its lock.
    /// - `EngineError::CodeExpired` if it expired unclaimed.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn claim(&self, code: &str, user_id: &UserId) -> Result<Balance> {
        let record = self
            .store
            .get_code(code)
            .await?
            .ok_or(EngineError::CodeNotFound)?;

        let now = self.clock.now();
        match record.state_at(now) {
            CodeState::Unclaimed => {}
            CodeState::Claimed => {
                tracing::warn!(code = %code, user_id = %user_id, "Redemption rejected: already claimed");
                return Err(EngineError::CodeAlreadyClaimed);
            }
            CodeState::Expired => {
                tracing::warn!(code = %code, user_id = %user_id, "Redemption rejected: expired");
                return Err(EngineError::CodeExpired);
            }
        }

        let key = format!("redemption_code:{code}");
        let token = uuid::Uuid::new_v4().to_string();
        if !self.lock.try_acquire(&key, &token, self.lock_ttl).await? {
            tracing::warn!(code = %code, user_id = %user_id, "Redemption rejected: claim in progress");
            return Err(EngineError::CodeAlreadyClaimed);
        }

        let result = self.claim_locked(&record, user_id, now).await;

        match self.lock.release(&key, &token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %key, "Redemption lock lapsed before release");
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to release redemption lock");
            }
        }

        result
    }

    async fn claim_locked(
        &self,
        record: &RedemptionCode,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Balance> {
        if !self.store.mark_code_claimed(&record.code, user_id, now).await? {
            tracing::warn!(code = %record.code, user_id = %user_id, "Redemption rejected: lost claim race");
            return Err(EngineError::CodeAlreadyClaimed);
        }

        let detail = EntryDetail::new(EntrySource::Redemption, record.purpose.clone())
            .with_metadata(json!({ "code": record.code }));
        match self.ledger.grant(user_id, record.amount, detail).await {
            Ok(balance) => {
                tracing::info!(
                    code = %record.code,
                    user_id = %user_id,
                    amount = %record.amount,
                    new_balance = %balance.amount,
                    "Redemption code claimed"
                );
                Ok(balance)
            }
            Err(e) => {
                tracing::error!(
                    code = %record.code,
                    user_id = %user_id,
                    amount = %record.amount,
                    error = %e,
                    "Code marked claimed but credit failed; needs manual reconciliation"
                );
                Err(e)
            }
        }
    }

    /// Issue `count` new codes worth `amount` each.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for a non-positive amount or a count
    ///   outside `1..=1000`.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn create_codes(
        &self,
        purpose: &str,
        amount: Decimal,
        count: usize,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<RedemptionCode>> {
        let codes = RedemptionCode::batch(purpose, amount, count, expired_at)?;
        self.store.insert_codes(&codes).await?;
        tracing::info!(purpose = %purpose, amount = %amount, count, "Redemption codes created");
        Ok(codes)
    }

    /// Search codes by exact code or purpose, newest first.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` for page 0 or a page size outside `1..=1000`.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn search_codes(
        &self,
        keyword: Option<&str>,
        page: usize,
        limit: usize,
    ) -> Result<Page<RedemptionCode>> {
        let (limit, offset) = paging::bounds(page, limit)?;
        let keyword = keyword.map(str::trim).filter(|k| !k.is_empty());
        let (total, items) = self.store.search_codes(keyword, limit, offset).await?;
        Ok(Page { total, items })
    }

    /// Get a code by value.
    ///
    /// # Errors
    ///
    /// - `EngineError::CodeNotFound` if the code doesn't exist.
    /// - `EngineError::StorageUnavailable` if the store cannot be reached.
    pub async fn get_code(&self, code: &str) -> Result<RedemptionCode> {
        self.store
            .get_code(code)
            .await?
            .ok_or(EngineError::CodeNotFound)
    }

    /// Derive the state of a code right now.
    ///
    /// # Errors
    ///
    /// Same as [`get_code`](Self::get_code).
    pub async fn code_state(&self, code: &str) -> Result<CodeState> {
        Ok(self.get_code(code).await?.state_at(self.clock.now()))
    }

    /// Change purpose, amount and expiry of an unclaimed code.
    ///
    /// # Errors
    ///
    /// - `EngineError::CodeNotFound` if the code doesn't exist.
    /// - `EngineError::CodeAlreadyClaimed` if it has been claimed.
    /// - `EngineError::Validation` for a non-positive amount.
    pub async fn update_code(
        &self,
        code: &str,
        purpose: &str,
        amount: Decimal,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<RedemptionCode> {
        let mut record = self.get_code(code).await?;
        if record.is_claimed() {
            return Err(EngineError::CodeAlreadyClaimed);
        }
        record.revise(purpose, amount, expired_at)?;

        if !self.store.update_unclaimed_code(&record).await? {
            return Err(EngineError::CodeAlreadyClaimed);
        }
        tracing::info!(code = %code, amount = %record.amount, "Redemption code updated");
        Ok(record)
    }

    /// Delete an unclaimed code.
    ///
    /// # Errors
    ///
    /// - `EngineError::CodeNotFound` if the code doesn't exist.
    /// - `EngineError::CodeAlreadyClaimed` if it has been claimed.
    pub async fn delete_code(&self, code: &str) -> Result<()> {
        let record = self.get_code(code).await?;
        if record.is_claimed() || !self.store.delete_unclaimed_code(code).await? {
            return Err(EngineError::CodeAlreadyClaimed);
        }
        tracing::info!(code = %code, "Redemption code deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use credit_core::ManualClock;
    use credit_store::{MemoryLock, MemoryStore};
    use rust_decimal_macros::dec;

    use crate::config::{Settings, SettingsHandle};

    struct Fixture {
        desk: RedemptionDesk,
        ledger: Arc<Ledger>,
        lock: Arc<MemoryLock>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(Ledger::new(
            Arc::clone(&store),
            Arc::new(SettingsHandle::new(Settings::default())),
            Decimal::ZERO,
        ));
        let lock = Arc::new(MemoryLock::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let desk = RedemptionDesk::new(
            store,
            Arc::clone(&ledger),
            lock.clone(),
            clock.clone(),
            Duration::from_secs(60),
        );
        Fixture {
            desk,
            ledger,
            lock,
            clock,
        }
    }

    #[tokio::test]
    async fn claim_credits_once() {
        let f = fixture();
        let codes = f.desk.create_codes("launch", dec!(50), 1, None).await.unwrap();
        let code = &codes[0].code;
        let alice = UserId::generate();
        let bob = UserId::generate();

        let balance = f.desk.claim(code, &alice).await.unwrap();
        assert_eq!(balance.amount, dec!(50));

        let err = f.desk.claim(code, &bob).await.unwrap_err();
        assert!(matches!(err, EngineError::CodeAlreadyClaimed));
        assert_eq!(f.ledger.get_balance(&bob).await.unwrap().amount, Decimal::ZERO);

        let stored = f.desk.get_code(code).await.unwrap();
        assert_eq!(stored.user_id, Some(alice));
        assert_eq!(stored.received_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.desk.claim("nope", &UserId::generate()).await,
            Err(EngineError::CodeNotFound)
        ));
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let f = fixture();
        let expiry = f.clock.now() + chrono::Duration::hours(1);
        let codes = f.desk.create_codes("promo", dec!(5), 1, Some(expiry)).await.unwrap();

        f.clock.advance(chrono::Duration::hours(2));

        assert!(matches!(
            f.desk.claim(&codes[0].code, &UserId::generate()).await,
            Err(EngineError::CodeExpired)
        ));
        assert_eq!(f.desk.code_state(&codes[0].code).await.unwrap(), CodeState::Expired);
    }

    #[tokio::test]
    async fn held_lock_rejects_claim_without_writing() {
        let f = fixture();
        let codes = f.desk.create_codes("promo", dec!(5), 1, None).await.unwrap();
        let code = &codes[0].code;
        f.lock
            .try_acquire(&format!("redemption_code:{code}"), "other", Duration::from_secs(60))
            .await
            .unwrap();

        let user_id = UserId::generate();
        assert!(matches!(
            f.desk.claim(code, &user_id).await,
            Err(EngineError::CodeAlreadyClaimed)
        ));
        assert!(!f.desk.get_code(code).await.unwrap().is_claimed());
        assert_eq!(f.ledger.count_entries(Some(&user_id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lock_is_released_after_claim() {
        let f = fixture();
        let codes = f.desk.create_codes("promo", dec!(5), 1, None).await.unwrap();
        let code = &codes[0].code;

        f.desk.claim(code, &UserId::generate()).await.unwrap();

        assert!(f
            .lock
            .try_acquire(&format!("redemption_code:{code}"), "next", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn create_codes_validates_batch() {
        let f = fixture();
        assert!(matches!(
            f.desk.create_codes("promo", dec!(5), 0, None).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            f.desk.create_codes("promo", Decimal::ZERO, 3, None).await,
            Err(EngineError::Validation(_))
        ));

        let codes = f.desk.create_codes("promo", dec!(5), 3, None).await.unwrap();
        assert_eq!(codes.len(), 3);
        assert!(codes.iter().all(|c| c.code.len() == 32));
    }

    #[tokio::test]
    async fn search_by_purpose() {
        let f = fixture();
        f.desk.create_codes("spring", dec!(5), 3, None).await.unwrap();
        f.desk.create_codes("autumn", dec!(5), 2, None).await.unwrap();

        let page = f.desk.search_codes(Some("spring"), 1, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);

        let all = f.desk.search_codes(None, 1, 100).await.unwrap();
        assert_eq!(all.total, 5);
    }

    #[tokio::test]
    async fn claimed_codes_cannot_be_edited_or_deleted() {
        let f = fixture();
        let codes = f.desk.create_codes("promo", dec!(5), 2, None).await.unwrap();
        f.desk.claim(&codes[0].code, &UserId::generate()).await.unwrap();

        assert!(matches!(
            f.desk.update_code(&codes[0].code, "promo", dec!(9), None).await,
            Err(EngineError::CodeAlreadyClaimed)
        ));
        assert!(matches!(
            f.desk.delete_code(&codes[0].code).await,
            Err(EngineError::CodeAlreadyClaimed)
        ));

        let updated = f
            .desk
            .update_code(&codes[1].code, "renamed", dec!(9), None)
            .await
            .unwrap();
        assert_eq!(updated.amount, dec!(9));
        assert_eq!(f.desk.get_code(&codes[1].code).await.unwrap().purpose, "renamed");

        f.desk.delete_code(&codes[1].code).await.unwrap();
        assert!(matches!(
            f.desk.get_code(&codes[1].code).await,
            Err(EngineError::CodeNotFound)
        ));
    }
}
