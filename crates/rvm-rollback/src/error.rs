//! Error types for triggers and rollbacks
//!
//! `RollbackError` never escapes `RollbackCoordinator::rollback`; every
//! variant ends up in the `details` of a failed `RollbackRecord`.

use rvm_core::{ControlError, HistoryError, RollbackStrategy};
use std::path::PathBuf;

/// Backup store failures
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("walking {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("no snapshot for category {0}")]
    NotFound(String),

    #[error("backup store unavailable: {0}")]
    Unavailable(String),

    #[error("backup task failed: {0}")]
    Task(String),
}

/// Metrics source failures
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics source unavailable: {0}")]
    Unavailable(String),

    #[error("metrics task failed: {0}")]
    Task(String),
}

/// Why a rollback attempt failed
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("no backup available for category {category}")]
    NoBackupAvailable { category: String },

    #[error("no rollback target configured for strategy {0}")]
    MissingTarget(RollbackStrategy),

    #[error("backup: {0}")]
    Backup(#[from] BackupError),

    #[error("service control: {0}")]
    Control(#[from] ControlError),

    #[error("metrics: {0}")]
    Metrics(#[from] MetricsError),

    #[error("post-rollback validation failed: {0}")]
    ValidationFailed(String),

    #[error("history: {0}")]
    History(#[from] HistoryError),
}

impl RollbackError {
    /// Stable name used in rollback record details
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoBackupAvailable { .. } => "NoBackupAvailableError",
            Self::MissingTarget(_) => "MissingTargetError",
            Self::Backup(_) => "BackupError",
            Self::Control(_) => "ControlError",
            Self::Metrics(_) => "MetricsError",
            Self::ValidationFailed(_) => "ValidationError",
            Self::History(_) => "HistoryError",
        }
    }
}
