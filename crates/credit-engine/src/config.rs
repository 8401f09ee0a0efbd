//! Engine configuration.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use rust_decimal::Decimal;

use credit_core::PricingConfig;

use crate::error::{EngineError, Result};

/// Which storage backend the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store. Data is lost on exit.
    Memory,
    /// `RocksDB` under `data_dir`.
    RocksDb,
    /// `PostgreSQL` at `database_url`.
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(EngineError::Validation(format!(
                "unknown store backend: {other}"
            ))),
        }
    }
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Storage backend (default: postgres).
    pub backend: StoreBackend,

    /// Path to `RocksDB` data directory (default: "/data/credit-engine").
    pub data_dir: String,

    /// `PostgreSQL` connection URL.
    pub database_url: Option<String>,

    /// Maximum pooled database connections.
    pub max_connections: u32,

    /// Opening balance of a user seen for the first time.
    pub default_balance: Decimal,

    /// Credits per unit of external payment currency.
    pub exchange_rate: Decimal,

    /// Pricing configuration.
    pub pricing: PricingConfig,

    /// Lease duration of the per-code redemption lock.
    pub redemption_lock_ttl: Duration,

    /// Local hour from which the daily grant run may start.
    pub grant_hour: u32,

    /// Offset of the calendar day used for daily grants.
    pub grant_utc_offset: FixedOffset,

    /// How often the scheduler wakes up to check for a due run.
    pub grant_check_interval: Duration,

    /// Delete ledger entries older than this many days (disabled when unset).
    pub ledger_retention_days: Option<u32>,
}

impl EngineConfig {
    /// Load configuration from environment variables and the pricing file.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let backend = match std::env::var("STORE_BACKEND") {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring STORE_BACKEND");
                defaults.backend
            }),
            Err(_) => defaults.backend,
        };

        let grant_utc_offset = env_parse::<i32>("GRANT_UTC_OFFSET_MINUTES")
            .and_then(|minutes| minutes.checked_mul(60))
            .and_then(FixedOffset::east_opt)
            .unwrap_or(defaults.grant_utc_offset);

        Self {
            backend,
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            database_url: std::env::var("DATABASE_URL").ok(),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            default_balance: env_parse("DEFAULT_BALANCE").unwrap_or(defaults.default_balance),
            exchange_rate: env_parse("EXCHANGE_RATE").unwrap_or(defaults.exchange_rate),
            pricing: load_pricing(),
            redemption_lock_ttl: env_parse("REDEMPTION_LOCK_TTL_SECONDS")
                .map_or(defaults.redemption_lock_ttl, Duration::from_secs),
            grant_hour: env_parse::<u32>("GRANT_HOUR")
                .filter(|hour| *hour < 24)
                .unwrap_or(defaults.grant_hour),
            grant_utc_offset,
            grant_check_interval: env_parse("GRANT_CHECK_INTERVAL_SECONDS")
                .filter(|secs| *secs > 0)
                .map_or(defaults.grant_check_interval, Duration::from_secs),
            ledger_retention_days: env_parse("LEDGER_RETENTION_DAYS"),
        }
    }

    /// The pricing and exchange-rate snapshot derived from this configuration.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` for a negative price or a
    /// non-positive exchange rate.
    pub fn settings(&self) -> Result<Settings> {
        Settings::new(self.pricing.clone(), self.exchange_rate)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            data_dir: "/data/credit-engine".into(),
            database_url: None,
            max_connections: 10,
            default_balance: Decimal::ZERO,
            exchange_rate: Decimal::ONE,
            pricing: PricingConfig::default(),
            redemption_lock_ttl: Duration::from_secs(60),
            grant_hour: 1,
            grant_utc_offset: Utc.fix(),
            grant_check_interval: Duration::from_secs(3600),
            ledger_retention_days: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Load pricing from `PRICING_FILE` or a well-known path, else use defaults.
fn load_pricing() -> PricingConfig {
    let explicit = std::env::var("PRICING_FILE").ok();
    let candidates = [
        "config/pricing.json",
        ".config/pricing.json",
        "credit-engine/config/pricing.json",
        "../config/pricing.json",
    ];

    for path in explicit.iter().map(String::as_str).chain(candidates) {
        match load_json_file::<PricingConfig>(path) {
            Ok(pricing) => match pricing.validate() {
                Ok(()) => {
                    tracing::info!(path = %path, models = pricing.models.len(), "Loaded pricing from file");
                    return pricing;
                }
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "Rejected invalid pricing file");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(path = %path, error = %e, "Failed to read pricing file"),
        }
    }

    tracing::debug!("Pricing file not found, using default pricing");
    PricingConfig::default()
}

/// Load a JSON file.
fn load_json_file<T: serde::de::DeserializeOwned>(path: &str) -> std::io::Result<T> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Prices and exchange rate in effect for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Model and feature prices.
    pub pricing: PricingConfig,

    /// Credits per unit of external payment currency.
    pub exchange_rate: Decimal,
}

impl Settings {
    /// Build a validated settings snapshot.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` for a negative price or a
    /// non-positive exchange rate.
    pub fn new(pricing: PricingConfig, exchange_rate: Decimal) -> Result<Self> {
        pricing.validate()?;
        if exchange_rate <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "exchange rate must be positive".into(),
            ));
        }
        Ok(Self {
            pricing,
            exchange_rate,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pricing: PricingConfig::default(),
            exchange_rate: Decimal::ONE,
        }
    }
}

/// Shared, swappable settings.
///
/// Each call takes a [`snapshot`](Self::snapshot) once and uses it
/// throughout, so a concurrent [`reload`](Self::reload) never mixes old and
/// new prices inside one charge.
#[derive(Debug, Default)]
pub struct SettingsHandle {
    current: RwLock<Arc<Settings>>,
}

impl SettingsHandle {
    /// Wrap an initial settings value.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// The settings in effect right now.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the settings for all subsequent calls.
    pub fn reload(&self, settings: Settings) {
        tracing::info!(
            models = settings.pricing.models.len(),
            exchange_rate = %settings.exchange_rate,
            "Settings reloaded"
        );
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
    }
}
