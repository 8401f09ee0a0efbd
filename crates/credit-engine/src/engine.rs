//! Engine assembly.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use credit_core::Clock;
use credit_store::{DistributedLock, MemoryLock, MemoryStore, Store, SubscriptionRegistry};

use crate::config::{EngineConfig, SettingsHandle, StoreBackend};
use crate::error::{EngineError, Result};
use crate::grants::{run_daily, DailyGrantScheduler, GrantSchedule};
use crate::ledger::Ledger;
use crate::reconciliation::ReconciliationDesk;
use crate::redemption::RedemptionDesk;

/// The storage collaborators of an engine.
#[derive(Clone)]
pub struct Backend {
    /// Balances, ledger, codes, grants and tickets.
    pub store: Arc<dyn Store>,

    /// Locks shared by all engine instances.
    pub lock: Arc<dyn DistributedLock>,

    /// Active subscriptions.
    pub registry: Arc<dyn SubscriptionRegistry>,
}

impl Backend {
    /// An in-process backend. Nothing survives a restart.
    #[must_use]
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            store: store.clone(),
            lock: Arc::new(MemoryLock::new()),
            registry: store,
        }
    }

    /// A `RocksDB` backend rooted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    #[cfg(feature = "rocksdb-backend")]
    pub fn rocksdb(path: &str) -> Result<Self> {
        let store = Arc::new(credit_store::RocksStore::open(path)?);
        Ok(Self {
            store: store.clone(),
            lock: store.clone(),
            registry: store,
        })
    }

    /// A `PostgreSQL` backend. Pending migrations are applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable or a migration fails.
    #[cfg(feature = "postgres")]
    pub async fn postgres(url: &str, max_connections: u32) -> Result<Self> {
        let store = Arc::new(credit_store::PgStore::connect(url, max_connections).await?);
        store.migrate().await?;
        Ok(Self {
            store: store.clone(),
            lock: store.clone(),
            registry: store,
        })
    }

    /// Open the backend selected by `config`.
    ///
    /// # Errors
    ///
    /// - `EngineError::Validation` if the backend is not compiled in or
    ///   `DATABASE_URL` is missing.
    /// - `EngineError::StorageUnavailable` if the backend cannot be opened.
    pub async fn open(config: &EngineConfig) -> Result<Self> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::memory()),
            #[cfg(feature = "rocksdb-backend")]
            StoreBackend::RocksDb => {
                tracing::info!(path = %config.data_dir, "Opening RocksDB store");
                Self::rocksdb(&config.data_dir)
            }
            #[cfg(feature = "postgres")]
            StoreBackend::Postgres => {
                let url = config.database_url.as_deref().ok_or_else(|| {
                    EngineError::Validation("DATABASE_URL is required for postgres".into())
                })?;
                tracing::info!(max_connections = config.max_connections, "Connecting to PostgreSQL");
                Self::postgres(url, config.max_connections).await
            }
            #[allow(unreachable_patterns)]
            other => Err(EngineError::Validation(format!(
                "store backend {other:?} is not compiled into this build"
            ))),
        }
    }
}

/// All engine components wired over one backend.
pub struct Engine {
    /// Prices and exchange rate, reloadable at runtime.
    pub settings: Arc<SettingsHandle>,

    /// Balances and ledger.
    pub ledger: Arc<Ledger>,

    /// Redemption codes.
    pub redemption: RedemptionDesk,

    /// Daily subscription grants.
    pub grants: Arc<DailyGrantScheduler>,

    /// Payment reconciliation.
    pub reconciliation: ReconciliationDesk,

    schedule: GrantSchedule,
}

impl Engine {
    /// Wire the components over `backend`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` if the configured prices or exchange
    /// rate are invalid.
    pub fn new(config: &EngineConfig, backend: Backend, clock: Arc<dyn Clock>) -> Result<Self> {
        let settings = Arc::new(SettingsHandle::new(config.settings()?));
        let ledger = Arc::new(Ledger::new(
            Arc::clone(&backend.store),
            Arc::clone(&settings),
            config.default_balance,
        ));
        let redemption = RedemptionDesk::new(
            Arc::clone(&backend.store),
            Arc::clone(&ledger),
            backend.lock,
            Arc::clone(&clock),
            config.redemption_lock_ttl,
        );
        let grants = Arc::new(DailyGrantScheduler::new(
            Arc::clone(&backend.store),
            Arc::clone(&ledger),
            backend.registry,
            Arc::clone(&clock),
            config.grant_utc_offset,
        ));
        let reconciliation =
            ReconciliationDesk::new(backend.store, Arc::clone(&ledger), Arc::clone(&settings), clock);

        Ok(Self {
            settings,
            ledger,
            redemption,
            grants,
            reconciliation,
            schedule: GrantSchedule {
                grant_hour: config.grant_hour,
                check_interval: config.grant_check_interval,
                retention_days: config.ledger_retention_days,
            },
        })
    }

    /// When the daily grant loop runs.
    #[must_use]
    pub const fn schedule(&self) -> GrantSchedule {
        self.schedule
    }

    /// Start the daily grant loop on the current runtime.
    #[must_use]
    pub fn spawn_scheduler(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(run_daily(Arc::clone(&self.grants), self.schedule, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credit_core::{EntryDetail, EntrySource, SystemClock, UserId};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn memory_config() -> EngineConfig {
        EngineConfig {
            backend: StoreBackend::Memory,
            default_balance: dec!(100),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn opens_memory_backend() {
        let backend = Backend::open(&memory_config()).await.unwrap();
        let engine = Engine::new(&memory_config(), backend, Arc::new(SystemClock)).unwrap();

        let user_id = UserId::generate();
        let balance = engine
            .ledger
            .deduct(&user_id, dec!(3.2), EntryDetail::new(EntrySource::ChatUsage, "chat"))
            .await
            .unwrap();
        assert_eq!(balance.amount, dec!(96.8));
    }

    #[tokio::test]
    async fn rejects_invalid_exchange_rate() {
        let config = EngineConfig {
            exchange_rate: Decimal::ZERO,
            ..memory_config()
        };
        assert!(Engine::new(&config, Backend::memory(), Arc::new(SystemClock)).is_err());
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn postgres_requires_database_url() {
        let config = EngineConfig {
            backend: StoreBackend::Postgres,
            database_url: None,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Backend::open(&config).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn scheduler_stops_on_shutdown() {
        let engine = Engine::new(&memory_config(), Backend::memory(), Arc::new(SystemClock)).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = engine.spawn_scheduler(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
