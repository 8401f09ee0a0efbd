//! Common test utilities for credit engine integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;

use credit_core::{
    ActiveSubscription, ManualClock, PlanId, SubscriptionId, UserId,
};
use credit_engine::{Backend, Engine, EngineConfig, StoreBackend};
use credit_store::MemoryStore;

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The engine under test.
    pub engine: Engine,
    /// The clock every component reads.
    pub clock: Arc<ManualClock>,
    /// Registers subscriptions (memory backend only).
    pub registry: Option<Arc<MemoryStore>>,
    /// A test user.
    pub test_user_id: UserId,
    /// Temporary directory for `RocksDB` (kept alive for test duration).
    pub _temp_dir: Option<TempDir>,
}

impl TestHarness {
    /// Create a harness on a fresh in-memory backend with zero opening balance.
    pub fn new() -> Self {
        Self::with_default_balance(Decimal::ZERO)
    }

    /// Create a harness on a fresh in-memory backend.
    pub fn with_default_balance(default_balance: Decimal) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = Backend {
            store: store.clone(),
            lock: Arc::new(credit_store::MemoryLock::new()),
            registry: store.clone(),
        };
        Self::build(test_config(default_balance), backend, Some(store), None)
    }

    /// Create a harness on a fresh `RocksDB` backend.
    #[cfg(feature = "rocksdb-backend")]
    pub fn rocksdb(default_balance: Decimal) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_string_lossy().to_string();
        let backend = Backend::rocksdb(&path).expect("Failed to open store");
        Self::build(test_config(default_balance), backend, None, Some(temp_dir))
    }

    fn build(
        config: EngineConfig,
        backend: Backend,
        registry: Option<Arc<MemoryStore>>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let engine = Engine::new(&config, backend, clock.clone()).expect("Failed to build engine");
        Self {
            engine,
            clock,
            registry,
            test_user_id: UserId::generate(),
            _temp_dir: temp_dir,
        }
    }

    /// Register an active subscription for `user_id`.
    pub fn subscribe(&self, user_id: UserId, subscription: &str, daily_credits: Decimal) {
        self.registry
            .as_ref()
            .expect("subscriptions need the memory registry")
            .put_subscription(ActiveSubscription {
                subscription_id: SubscriptionId::new(subscription).unwrap(),
                user_id,
                plan_id: PlanId::new("pro").unwrap(),
                daily_credits,
                expires_at: start_time() + chrono::Duration::days(30),
            });
    }

    /// Sum of all ledger deltas of a user.
    pub async fn ledger_sum(&self, user_id: &UserId) -> Decimal {
        let mut sum = Decimal::ZERO;
        let mut page = 1;
        loop {
            let entries = self
                .engine
                .ledger
                .list_entries(Some(user_id), page, 1000)
                .await
                .unwrap();
            sum += entries.iter().map(|e| e.delta).sum::<Decimal>();
            if entries.len() < 1000 {
                return sum;
            }
            page += 1;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// 2024-06-01 09:00 UTC, after the default grant hour.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

fn test_config(default_balance: Decimal) -> EngineConfig {
    EngineConfig {
        backend: StoreBackend::Memory,
        data_dir: String::new(),
        default_balance,
        ..EngineConfig::default()
    }
}
