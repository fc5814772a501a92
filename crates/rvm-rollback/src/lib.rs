//! RVM Rollback - trigger evaluation and rollback strategies
//!
//! - [`TriggerEvaluator`] decides which rules fire for a metrics snapshot
//! - [`RollbackCoordinator`] restores a target from its newest backup and
//!   validates the result, writing one record per attempt
//! - [`TriggerMonitor`] connects the two on a periodic, cancellable task
//!
//! Backups, metrics and service control are reached through the
//! [`BackupStore`], [`MetricsSource`] and `ServiceController` traits.

#![allow(missing_docs)]

pub mod backup;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod rollback;
pub mod trigger;

pub use backup::{copy_tree, replace_tree, BackupStore, DirectoryBackupStore};
pub use error::{BackupError, MetricsError, RollbackError};
pub use metrics::{MetricsSource, SystemMetricsSource};
pub use monitor::{MonitorHandle, TriggerMonitor};
pub use rollback::{RollbackContext, RollbackCoordinator};
pub use trigger::{
    default_strategy, rules_from_config, TriggerCondition, TriggerEvaluator, TriggerRule,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
