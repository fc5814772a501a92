//! Periodic trigger evaluation
//!
//! The monitor owns the evaluator and runs on its own task. Each tick it
//! optionally reloads the rules from the configuration file, takes a
//! metrics snapshot, evaluates the rules and runs the strategy mapped to
//! every rule that fired. It stops when its cancellation token fires.

use crate::metrics::MetricsSource;
use crate::rollback::RollbackCoordinator;
use crate::trigger::{rules_from_config, TriggerEvaluator};
use rvm_core::{OrchestratorConfig, RollbackRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Drives the trigger evaluator on an interval
pub struct TriggerMonitor {
    evaluator: TriggerEvaluator,
    metrics: Arc<dyn MetricsSource>,
    rollback: Arc<RollbackCoordinator>,
    interval: Duration,
    config_path: Option<PathBuf>,
    config_modified: Option<SystemTime>,
}

impl std::fmt::Debug for TriggerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerMonitor")
            .field("evaluator", &self.evaluator)
            .field("interval", &self.interval)
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl TriggerMonitor {
    #[must_use]
    pub fn new(
        evaluator: TriggerEvaluator,
        metrics: Arc<dyn MetricsSource>,
        rollback: Arc<RollbackCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            evaluator,
            metrics,
            rollback,
            interval,
            config_path: None,
            config_modified: None,
        }
    }

    /// Reload rules whenever the file's modification time changes
    #[must_use]
    pub fn with_config_reload(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.config_modified = modified(&path);
        self.config_path = Some(path);
        self
    }

    #[must_use]
    pub fn evaluator(&self) -> &TriggerEvaluator {
        &self.evaluator
    }

    /// One evaluation cycle; returns the rollbacks it ran
    pub async fn tick(&mut self) -> Vec<RollbackRecord> {
        self.reload_if_changed();

        let snapshot = match self.metrics.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "metrics unavailable, skipping evaluation");
                return Vec::new();
            }
        };

        let fired = self.evaluator.evaluate(&snapshot);
        let mut records = Vec::with_capacity(fired.len());
        for name in fired {
            let Some(strategy) = self.evaluator.rule(&name).map(|r| r.strategy) else {
                continue;
            };
            records.push(self.rollback.rollback(strategy, &name).await);
        }
        records
    }

    fn reload_if_changed(&mut self) {
        let Some(path) = &self.config_path else {
            return;
        };
        let current = modified(path);
        if current.is_none() || current == self.config_modified {
            return;
        }

        match OrchestratorConfig::load(path) {
            Ok(config) => {
                self.evaluator.reload(rules_from_config(&config.rules));
                self.config_modified = current;
                tracing::info!(path = %path.display(), "trigger rules reloaded");
            }
            Err(e) => {
                // retried on the next change only
                self.config_modified = current;
                tracing::warn!(path = %path.display(), error = %e, "config reload failed, keeping current rules");
            }
        }
    }

    /// Run until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, rules = self.evaluator.rules().count(), "trigger monitor started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let records = self.tick().await;
                    if !records.is_empty() {
                        tracing::info!(rollbacks = records.len(), "monitor tick ran rollbacks");
                    }
                }
            }
        }
        tracing::info!("trigger monitor stopped");
    }

    /// Spawn onto the runtime
    #[must_use]
    pub fn spawn(self) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        MonitorHandle { cancel, task }
    }
}

/// Handle to a running monitor task
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the monitor and wait for its task to end
    ///
    /// # Errors
    /// `JoinError` if the task panicked.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.task.await
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
