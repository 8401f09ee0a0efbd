//! Credit accounting and metering engine.
//!
//! This crate wires the credit components over a storage backend:
//!
//! - [`Ledger`]: balances, deductions, grants, usage charges and the ledger log
//! - [`RedemptionDesk`]: one-time redemption codes
//! - [`DailyGrantScheduler`]: daily subscription credits, plus the
//!   [`run_daily`] background loop
//! - [`ReconciliationDesk`]: external payments awaiting confirmation
//!
//! Prices and the payment exchange rate live in a [`SettingsHandle`] that can
//! be reloaded while the engine runs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use credit_core::{EntryDetail, EntrySource, SystemClock, UserId};
//! use credit_engine::{Backend, Engine, EngineConfig};
//! use rust_decimal::Decimal;
//!
//! # async fn demo() -> credit_engine::Result<()> {
//! let config = EngineConfig::from_env();
//! let backend = Backend::open(&config).await?;
//! let engine = Engine::new(&config, backend, Arc::new(SystemClock))?;
//!
//! let user_id = UserId::generate();
//! engine
//!     .ledger
//!     .grant(&user_id, Decimal::TEN, EntryDetail::new(EntrySource::AdminAdjustment, "welcome"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod error;
pub mod grants;
pub mod ledger;
pub mod paging;
pub mod reconciliation;
pub mod redemption;

pub use config::{EngineConfig, Settings, SettingsHandle, StoreBackend};
pub use engine::{Backend, Engine};
pub use error::{EngineError, Result};
pub use grants::{run_daily, DailyGrantScheduler, GrantFailure, GrantOutcome, GrantReport, GrantSchedule};
pub use ledger::{Ledger, UsageCharge};
pub use paging::{Page, MAX_PAGE_SIZE};
pub use reconciliation::{ReconciliationDesk, Settlement};
pub use redemption::RedemptionDesk;
