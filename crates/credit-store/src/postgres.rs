//! `PostgreSQL` storage implementation.
//!
//! Atomicity comes from the database: balance changes are a single
//! `amount = amount + $delta` update in the same transaction as the entry
//! insert, daily grants rely on a unique constraint, and code claims and
//! ticket settlements are conditional updates checked by affected row count.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};

use credit_core::{
    ActiveSubscription, Balance, DailyGrant, EntryDetail, EntryId, GrantKey, LedgerEntry, PlanId,
    ReconciliationTicket, RedemptionCode, SubscriptionId, TicketId, TicketStatus, UserId,
};

use crate::error::{Result, StoreError};
use crate::{lease_expiry, DistributedLock, Store, SubscriptionRegistry};

const BALANCE_COLUMNS: &str = "user_id, amount, created_at, updated_at";
const ENTRY_COLUMNS: &str = "id, user_id, delta, detail, created_at";
const CODE_COLUMNS: &str = "code, purpose, amount, created_at, expired_at, user_id, received_at";
const GRANT_COLUMNS: &str =
    "id, user_id, subscription_id, plan_id, grant_date, credits_granted, created_at";
const TICKET_COLUMNS: &str = "id, user_id, amount, detail, status, settled_at, created_at";

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be established.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        tracing::info!(max_connections, "PostgreSQL pool connected");
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register or replace a subscription in the registry view.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn put_subscription(&self, subscription: &ActiveSubscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO credit_subscriptions \
             (subscription_id, user_id, plan_id, daily_credits, expires_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (subscription_id) DO UPDATE SET \
             user_id = EXCLUDED.user_id, plan_id = EXCLUDED.plan_id, \
             daily_credits = EXCLUDED.daily_credits, expires_at = EXCLUDED.expires_at",
        )
        .bind(subscription.subscription_id.as_str())
        .bind(subscription.user_id.as_uuid())
        .bind(subscription.plan_id.as_str())
        .bind(subscription.daily_credits)
        .bind(subscription.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

fn decode<T>(e: impl std::fmt::Display) -> Result<T> {
    Err(StoreError::Serialization(e.to_string()))
}

fn balance_from_row(row: &PgRow) -> Result<Balance> {
    Ok(Balance {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        amount: row.try_get("amount")?,
        updated_at: row.try_get("updated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let id: String = row.try_get("id")?;
    let Json(detail): Json<EntryDetail> = row.try_get("detail")?;
    Ok(LedgerEntry {
        id: id.parse::<EntryId>().or_else(decode)?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        delta: row.try_get("delta")?,
        detail,
        created_at: row.try_get("created_at")?,
    })
}

fn code_from_row(row: &PgRow) -> Result<RedemptionCode> {
    let user_id: Option<uuid::Uuid> = row.try_get("user_id")?;
    Ok(RedemptionCode {
        code: row.try_get("code")?,
        purpose: row.try_get("purpose")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
        expired_at: row.try_get("expired_at")?,
        user_id: user_id.map(UserId::from_uuid),
        received_at: row.try_get("received_at")?,
    })
}

fn grant_from_row(row: &PgRow) -> Result<DailyGrant> {
    let subscription_id: String = row.try_get("subscription_id")?;
    let plan_id: String = row.try_get("plan_id")?;
    Ok(DailyGrant {
        id: row.try_get("id")?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        subscription_id: SubscriptionId::new(subscription_id).or_else(decode)?,
        plan_id: PlanId::new(plan_id).or_else(decode)?,
        grant_date: row.try_get("grant_date")?,
        credits_granted: row.try_get("credits_granted")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ticket_from_row(row: &PgRow) -> Result<ReconciliationTicket> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let Json(detail): Json<serde_json::Value> = row.try_get("detail")?;
    let status = match status.as_str() {
        "open" => TicketStatus::Open,
        "settled" => TicketStatus::Settled,
        other => return decode(format!("unknown ticket status: {other}")),
    };
    Ok(ReconciliationTicket {
        id: TicketId::new(id).or_else(decode)?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        amount: row.try_get("amount")?,
        detail,
        status,
        settled_at: row.try_get("settled_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<ActiveSubscription> {
    let subscription_id: String = row.try_get("subscription_id")?;
    let plan_id: String = row.try_get("plan_id")?;
    Ok(ActiveSubscription {
        subscription_id: SubscriptionId::new(subscription_id).or_else(decode)?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        plan_id: PlanId::new(plan_id).or_else(decode)?,
        daily_credits: row.try_get("daily_credits")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Map a unique-key violation to `StoreError::Conflict`.
fn unique_or(e: sqlx::Error, entity: &'static str, id: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            tracing::debug!(entity, id, "Unique key conflict");
            StoreError::conflict(entity, id)
        }
        _ => e.into(),
    }
}

async fn insert_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> Result<()> {
    sqlx::query(
        "INSERT INTO credit_ledger_entries (id, user_id, delta, detail, created_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(entry.id.to_string())
    .bind(entry.user_id.as_uuid())
    .bind(entry.delta)
    .bind(Json(&entry.detail))
    .bind(entry.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<Balance>> {
        let query = format!("SELECT {BALANCE_COLUMNS} FROM credit_balances WHERE user_id = $1");
        let row = sqlx::query(&query)
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn open_balance(&self, user_id: &UserId, opening: Decimal) -> Result<Balance> {
        let entry = (!opening.is_zero()).then(|| LedgerEntry::opening(*user_id, opening));
        let amount = entry.as_ref().map_or(Decimal::ZERO, |e| e.delta);

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO credit_balances (user_id, amount) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if let (true, Some(entry)) = (inserted, &entry) {
            insert_entry(&mut tx, entry).await?;
        }

        let query = format!("SELECT {BALANCE_COLUMNS} FROM credit_balances WHERE user_id = $1");
        let row = sqlx::query(&query)
            .bind(user_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        balance_from_row(&row)
    }

    async fn add_balance(&self, entry: &LedgerEntry) -> Result<Balance> {
        let mut tx = self.pool.begin().await?;
        let query = format!(
            "UPDATE credit_balances SET amount = amount + $2, updated_at = now() \
             WHERE user_id = $1 RETURNING {BALANCE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(entry.user_id.as_uuid())
            .bind(entry.delta)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("balance", entry.user_id))?;

        insert_entry(&mut tx, entry).await?;
        tx.commit().await?;

        balance_from_row(&row)
    }

    async fn set_balance(
        &self,
        user_id: &UserId,
        amount: Decimal,
        detail: &EntryDetail,
    ) -> Result<Balance> {
        let mut tx = self.pool.begin().await?;
        let previous: Decimal =
            sqlx::query("SELECT amount FROM credit_balances WHERE user_id = $1 FOR UPDATE")
                .bind(user_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("balance", user_id))?
                .try_get("amount")?;

        let entry = LedgerEntry::new(*user_id, amount - previous, detail.clone());
        let query = format!(
            "UPDATE credit_balances SET amount = amount + $2, updated_at = now() \
             WHERE user_id = $1 RETURNING {BALANCE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(user_id.as_uuid())
            .bind(entry.delta)
            .fetch_one(&mut *tx)
            .await?;

        insert_entry(&mut tx, &entry).await?;
        tx.commit().await?;

        balance_from_row(&row)
    }

    async fn list_entries(
        &self,
        user_id: Option<&UserId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM credit_ledger_entries \
             WHERE ($1::uuid IS NULL OR user_id = $1) \
             ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&query)
            .bind(user_id.map(UserId::as_uuid))
            .bind(sql_count(limit))
            .bind(sql_count(offset))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn count_entries(&self, user_id: Option<&UserId>) -> Result<u64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM credit_ledger_entries \
             WHERE ($1::uuid IS NULL OR user_id = $1)",
        )
        .bind(user_id.map(UserId::as_uuid))
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;
        Ok(row_count(count))
    }

    async fn list_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM credit_ledger_entries \
             WHERE created_at >= $1 AND created_at < $2 ORDER BY id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn delete_entries_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM credit_ledger_entries WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Redemption Code Operations
    // =========================================================================

    async fn insert_codes(&self, codes: &[RedemptionCode]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for code in codes {
            sqlx::query(
                "INSERT INTO credit_redemption_codes \
                 (code, purpose, amount, created_at, expired_at, user_id, received_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&code.code)
            .bind(&code.purpose)
            .bind(code.amount)
            .bind(code.created_at)
            .bind(code.expired_at)
            .bind(code.user_id.as_ref().map(UserId::as_uuid))
            .bind(code.received_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| unique_or(e, "redemption code", &code.code))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_code(&self, code: &str) -> Result<Option<RedemptionCode>> {
        let query = format!("SELECT {CODE_COLUMNS} FROM credit_redemption_codes WHERE code = $1");
        let row = sqlx::query(&query)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(code_from_row).transpose()
    }

    async fn search_codes(
        &self,
        keyword: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(u64, Vec<RedemptionCode>)> {
        const FILTER: &str = "WHERE ($1::text IS NULL OR code = $1 OR purpose = $1)";

        let count_query = format!("SELECT COUNT(*) AS count FROM credit_redemption_codes {FILTER}");
        let total: i64 = sqlx::query(&count_query)
            .bind(keyword)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        let query = format!(
            "SELECT {CODE_COLUMNS} FROM credit_redemption_codes {FILTER} \
             ORDER BY created_at DESC, code ASC LIMIT $2 OFFSET $3"
        );
        let codes = sqlx::query(&query)
            .bind(keyword)
            .bind(sql_count(limit))
            .bind(sql_count(offset))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(code_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok((row_count(total), codes))
    }

    async fn update_unclaimed_code(&self, code: &RedemptionCode) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE credit_redemption_codes SET purpose = $2, amount = $3, expired_at = $4 \
             WHERE code = $1 AND user_id IS NULL",
        )
        .bind(&code.code)
        .bind(&code.purpose)
        .bind(code.amount)
        .bind(code.expired_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_unclaimed_code(&self, code: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM credit_redemption_codes WHERE code = $1 AND user_id IS NULL")
                .bind(code)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_code_claimed(
        &self,
        code: &str,
        user_id: &UserId,
        received_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE credit_redemption_codes SET user_id = $2, received_at = $3 \
             WHERE code = $1 AND user_id IS NULL",
        )
        .bind(code)
        .bind(user_id.as_uuid())
        .bind(received_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Daily Grant Operations
    // =========================================================================

    async fn insert_daily_grant(&self, grant: &DailyGrant) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO credit_daily_grants \
             (id, user_id, subscription_id, plan_id, grant_date, credits_granted, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (user_id, subscription_id, grant_date) DO NOTHING",
        )
        .bind(grant.id)
        .bind(grant.user_id.as_uuid())
        .bind(grant.subscription_id.as_str())
        .bind(grant.plan_id.as_str())
        .bind(grant.grant_date)
        .bind(grant.credits_granted)
        .bind(grant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_daily_grant(&self, key: &GrantKey) -> Result<()> {
        sqlx::query(
            "DELETE FROM credit_daily_grants \
             WHERE user_id = $1 AND subscription_id = $2 AND grant_date = $3",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.subscription_id.as_str())
        .bind(key.grant_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_daily_grant(&self, key: &GrantKey) -> Result<bool> {
        let exists: bool = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM credit_daily_grants \
             WHERE user_id = $1 AND subscription_id = $2 AND grant_date = $3) AS found",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.subscription_id.as_str())
        .bind(key.grant_date)
        .fetch_one(&self.pool)
        .await?
        .try_get("found")?;
        Ok(exists)
    }

    async fn list_daily_grants(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<(u64, Vec<DailyGrant>)> {
        let total: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM credit_daily_grants WHERE user_id = $1")
                .bind(user_id.as_uuid())
                .fetch_one(&self.pool)
                .await?
                .try_get("count")?;

        let query = format!(
            "SELECT {GRANT_COLUMNS} FROM credit_daily_grants WHERE user_id = $1 \
             ORDER BY grant_date DESC, subscription_id ASC LIMIT $2 OFFSET $3"
        );
        let grants = sqlx::query(&query)
            .bind(user_id.as_uuid())
            .bind(sql_count(limit))
            .bind(sql_count(offset))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(grant_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok((row_count(total), grants))
    }

    // =========================================================================
    // Reconciliation Ticket Operations
    // =========================================================================

    async fn insert_ticket(&self, ticket: &ReconciliationTicket) -> Result<()> {
        sqlx::query(
            "INSERT INTO credit_reconciliation_tickets \
             (id, user_id, amount, detail, status, settled_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(ticket.id.as_str())
        .bind(ticket.user_id.as_uuid())
        .bind(ticket.amount)
        .bind(Json(&ticket.detail))
        .bind(ticket.status.as_str())
        .bind(ticket.settled_at)
        .bind(ticket.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or(e, "reconciliation ticket", ticket.id.as_str()))?;
        Ok(())
    }

    async fn get_ticket(&self, id: &TicketId) -> Result<Option<ReconciliationTicket>> {
        let query =
            format!("SELECT {TICKET_COLUMNS} FROM credit_reconciliation_tickets WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(ticket_from_row).transpose()
    }

    async fn settle_ticket(
        &self,
        id: &TicketId,
        detail: &serde_json::Value,
        settled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE credit_reconciliation_tickets \
             SET status = 'settled', detail = $2, settled_at = $3 \
             WHERE id = $1 AND status = 'open'",
        )
        .bind(id.as_str())
        .bind(Json(detail))
        .bind(settled_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_ticket(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::not_found("reconciliation ticket", id)),
        }
    }

    async fn list_tickets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationTicket>> {
        let query = format!(
            "SELECT {TICKET_COLUMNS} FROM credit_reconciliation_tickets \
             WHERE created_at >= $1 AND created_at < $2 ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ticket_from_row).collect()
    }
}

#[async_trait]
impl SubscriptionRegistry for PgStore {
    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<ActiveSubscription>> {
        let rows = sqlx::query(
            "SELECT subscription_id, user_id, plan_id, daily_credits, expires_at \
             FROM credit_subscriptions WHERE expires_at > $1 ORDER BY subscription_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }
}

#[async_trait]
impl DistributedLock for PgStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO engine_locks (key, token, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at \
             WHERE engine_locks.expires_at <= $4",
        )
        .bind(key)
        .bind(token)
        .bind(lease_expiry(now, ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM engine_locks WHERE key = $1 AND token = $2 AND expires_at > $3",
        )
        .bind(key)
        .bind(token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_core::EntrySource;
    use rust_decimal_macros::dec;

    /// Connect to the database named by `TEST_DATABASE_URL`, if any.
    async fn test_store() -> Option<PgStore> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&url, 4).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn balance_and_entry_share_a_transaction() {
        let Some(store) = test_store().await else {
            return;
        };
        let user_id = UserId::generate();

        let opened = store.open_balance(&user_id, dec!(100)).await.unwrap();
        assert_eq!(opened.amount, dec!(100));

        let entry = LedgerEntry::new(
            user_id,
            dec!(-3.2),
            EntryDetail::new(EntrySource::ChatUsage, "gpt-4o"),
        );
        let balance = store.add_balance(&entry).await.unwrap();
        assert_eq!(balance.amount, dec!(96.8));

        let entries = store.list_entries(Some(&user_id), 10, 0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, entry.id);
        assert_eq!(entries[0].detail, entry.detail);
    }

    #[tokio::test]
    async fn claim_and_settle_are_conditional() {
        let Some(store) = test_store().await else {
            return;
        };
        let code = RedemptionCode::batch("pg-test", dec!(5), 1, None)
            .unwrap()
            .remove(0);
        store.insert_codes(std::slice::from_ref(&code)).await.unwrap();
        assert!(store
            .mark_code_claimed(&code.code, &UserId::generate(), Utc::now())
            .await
            .unwrap());
        assert!(!store
            .mark_code_claimed(&code.code, &UserId::generate(), Utc::now())
            .await
            .unwrap());

        let ticket = ReconciliationTicket::open(
            TicketId::new(uuid::Uuid::new_v4().to_string()).unwrap(),
            UserId::generate(),
            dec!(3),
            serde_json::Value::Null,
        )
        .unwrap();
        store.insert_ticket(&ticket).await.unwrap();
        let paid = serde_json::json!({"paid": true});
        assert!(store.settle_ticket(&ticket.id, &paid, Utc::now()).await.unwrap());
        assert!(!store.settle_ticket(&ticket.id, &paid, Utc::now()).await.unwrap());
    }
}
