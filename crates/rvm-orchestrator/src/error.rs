//! Wiring errors
//!
//! Everything here happens before the first step runs; once the
//! coordinators exist, failures are reports and records.

use rvm_core::{ConfigError, HistoryError};
use rvm_rollback::MetricsError;
use rvm_startup::{ProbeError, StartupError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("probe setup: {0}")]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("history: {0}")]
    History(#[from] HistoryError),

    #[error("metrics source: {0}")]
    Metrics(#[from] MetricsError),
}
