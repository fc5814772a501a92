//! RVM Core - shared foundation of the edge orchestrator
//!
//! Provides the pieces both the startup and the rollback side build on:
//! - Record types (`StepResult`, `StartupReport`, `RollbackRecord`, `MetricsSnapshot`)
//! - Configuration loading (TOML / YAML / JSON)
//! - The append-only, hash-chained history log
//! - The `ServiceController` capability
//!
//! # Example
//!
//! ```rust,ignore
//! use rvm_core::{HistoryLog, OrchestratorConfig, StartupReport};
//!
//! let config = OrchestratorConfig::load("orchestrator.toml")?;
//! let history: HistoryLog<StartupReport> = HistoryLog::open(
//!     config.orchestrator.startup_history_path(),
//!     config.orchestrator.history_max_entries,
//! )?;
//! ```

#![allow(missing_docs)]

pub mod config;
pub mod control;
pub mod error;
pub mod history;
pub mod types;

pub use config::{
    saturating_seconds, ConfigFormat, MetricsSettings, OrchestratorConfig, OrchestratorSettings,
    ProbeSpec, ResourceLimits, RollbackSettings, RollbackTarget, RuleConfig, StepConfig,
    MAX_CONFIG_SECONDS,
};
pub use control::{ServiceController, SystemctlController};
pub use error::{ConfigError, ControlError, HistoryError};
pub use history::{HistoryEntry, HistoryLog};
pub use types::{
    MetricsSnapshot, RecordId, RollbackRecord, RollbackStatus, RollbackStrategy, StartupReport,
    StepResult, StepStatus, UnknownStrategy, MANUAL_TRIGGER,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
