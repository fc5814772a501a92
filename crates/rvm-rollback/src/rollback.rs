//! Rollback coordinator
//!
//! A non-composite strategy restores one target:
//! 1. Check the backup store has a snapshot for the target's category
//! 2. Save the current destination into the scratch area
//! 3. Restore the newest snapshot over the destination
//! 4. Restart the target's services (service strategy only)
//! 5. Validate: config files parse, services are ready, resources are sane
//!
//! `full_system` runs configuration, service and data in that order and
//! stops at the first failure. Every call produces exactly one
//! `RollbackRecord`, success or not, and appends it to the history. A
//! failed record still names the scratch copy taken in step 2, so the
//! pre-rollback state can be put back by hand.
//!
//! Only the newest `scratch_keep` copies per strategy are kept.

use crate::backup::{copy_tree, BackupStore};
use crate::error::{BackupError, RollbackError};
use crate::metrics::MetricsSource;
use chrono::Utc;
use rvm_core::{
    ConfigFormat, HistoryLog, RecordId, RollbackRecord, RollbackSettings, RollbackStatus,
    RollbackStrategy, RollbackTarget, ServiceController,
};
use rvm_startup::ProbeRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use walkdir::WalkDir;

/// External capabilities a rollback needs
#[derive(Clone)]
pub struct RollbackContext {
    pub store: Arc<dyn BackupStore>,
    pub controller: Arc<dyn ServiceController>,
    pub metrics: Arc<dyn MetricsSource>,
    /// Probes used to check restored services
    pub probes: Arc<ProbeRegistry>,
}

/// How far a non-composite strategy got, filled in as it goes
#[derive(Debug, Clone, Default)]
struct Progress {
    snapshot: Option<String>,
    scratch_path: Option<PathBuf>,
}

impl Progress {
    fn saved_to(&self) -> String {
        self.scratch_path
            .as_ref()
            .map(|path| format!("; previous state saved to {}", path.display()))
            .unwrap_or_default()
    }
}

/// Executes rollback strategies and keeps their audit trail
pub struct RollbackCoordinator {
    settings: RollbackSettings,
    context: RollbackContext,
    history: Arc<HistoryLog<RollbackRecord>>,
    // one restore at a time, destinations may overlap
    in_flight: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RollbackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackCoordinator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RollbackCoordinator {
    #[must_use]
    pub fn new(
        settings: RollbackSettings,
        context: RollbackContext,
        history: Arc<HistoryLog<RollbackRecord>>,
    ) -> Self {
        Self {
            settings,
            context,
            history,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RollbackSettings {
        &self.settings
    }

    #[must_use]
    pub fn history(&self) -> &Arc<HistoryLog<RollbackRecord>> {
        &self.history
    }

    /// Records held in memory, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<RollbackRecord> {
        self.history.records()
    }

    /// Run `strategy` on behalf of `trigger_name` and record the outcome
    pub async fn rollback(&self, strategy: RollbackStrategy, trigger_name: &str) -> RollbackRecord {
        let _guard = self.in_flight.lock().await;
        let started = Instant::now();
        let timestamp = Utc::now();
        tracing::info!(strategy = %strategy, trigger = %trigger_name, "rollback started");

        let (status, details, snapshot, scratch_path) = if strategy.is_composite() {
            let (ok, details) = self.run_chain().await;
            let status = if ok {
                RollbackStatus::Success
            } else {
                RollbackStatus::Failed
            };
            (status, details, None, None)
        } else {
            let mut progress = Progress::default();
            let (status, details) = match self.execute(strategy, &mut progress).await {
                Ok(snapshot) => (
                    RollbackStatus::Success,
                    format!("restored snapshot {snapshot} and validated{}", progress.saved_to()),
                ),
                Err(e) => (
                    RollbackStatus::Failed,
                    format!("{}{}", describe(&e), progress.saved_to()),
                ),
            };
            (status, details, progress.snapshot, progress.scratch_path)
        };

        let record = RollbackRecord {
            id: RecordId::new(),
            rollback_type: strategy,
            status,
            trigger_name: trigger_name.to_string(),
            timestamp,
            duration_seconds: started.elapsed().as_secs_f64(),
            details,
            snapshot,
            scratch_path,
        };

        ::metrics::counter!(
            "rvm_rollbacks_total",
            "strategy" => strategy.as_str(),
            "status" => if record.succeeded() { "success" } else { "failed" }
        )
        .increment(1);

        if record.succeeded() {
            tracing::info!(id = %record.id, strategy = %strategy, details = %record.details, "rollback succeeded");
        } else {
            tracing::error!(id = %record.id, strategy = %strategy, details = %record.details, "rollback failed");
        }

        if let Err(e) = self.history.append(record.clone()) {
            tracing::error!(error = %e, "failed to persist rollback record");
        }
        record
    }

    /// configuration → service → data, stopping at the first failure
    async fn run_chain(&self) -> (bool, String) {
        let mut lines = Vec::with_capacity(RollbackStrategy::FULL_SYSTEM_CHAIN.len());
        for sub in RollbackStrategy::FULL_SYSTEM_CHAIN {
            let mut progress = Progress::default();
            match self.execute(sub, &mut progress).await {
                Ok(snapshot) => {
                    lines.push(format!(
                        "{sub}: success (snapshot {snapshot}{})",
                        progress.saved_to()
                    ));
                }
                Err(e) => {
                    lines.push(format!("{sub}: failed: {}{}", describe(&e), progress.saved_to()));
                    tracing::warn!(strategy = %sub, error = %e, "full system rollback aborted");
                    return (false, lines.join("; "));
                }
            }
        }
        (true, lines.join("; "))
    }

    /// Returns the restored snapshot name. `progress` keeps what was done
    /// even when a later stage fails.
    async fn execute(
        &self,
        strategy: RollbackStrategy,
        progress: &mut Progress,
    ) -> Result<String, RollbackError> {
        let target = self
            .settings
            .target(strategy)
            .ok_or(RollbackError::MissingTarget(strategy))?;

        if !self.context.store.has_snapshot(&target.category).await? {
            return Err(RollbackError::NoBackupAvailable {
                category: target.category.clone(),
            });
        }

        progress.scratch_path = self.preserve_current(strategy, &target.destination).await?;
        let snapshot = self
            .context
            .store
            .restore_latest(&target.category, &target.destination)
            .await?;
        progress.snapshot = Some(snapshot.clone());

        if strategy == RollbackStrategy::Service {
            for service in &target.services {
                tracing::info!(service = %service, "restarting service");
                self.context.controller.restart(service).await?;
            }
        }

        self.validate(target).await?;
        Ok(snapshot)
    }

    /// Copy the destination to `<scratch>/<strategy>/<timestamp>`, then
    /// prune that strategy's older copies
    async fn preserve_current(
        &self,
        strategy: RollbackStrategy,
        destination: &Path,
    ) -> Result<Option<PathBuf>, RollbackError> {
        if !destination.exists() {
            tracing::debug!(destination = %destination.display(), "nothing to preserve");
            return Ok(None);
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let parent = self.settings.scratch_dir.join(strategy.as_str());
        let scratch = parent.join(stamp);
        let from = destination.to_path_buf();
        let to = scratch.clone();
        let keep = self.settings.scratch_keep.max(1);
        let copied = tokio::task::spawn_blocking(move || {
            let copied = copy_tree(&from, &to)?;
            if let Err(e) = prune_scratch(&parent, keep) {
                tracing::warn!(
                    dir = %parent.display(),
                    error = %e,
                    "failed to prune scratch copies"
                );
            }
            Ok::<_, BackupError>(copied)
        })
        .await
        .map_err(|e| BackupError::Task(e.to_string()))??;

        tracing::debug!(scratch = %scratch.display(), files = copied, "preserved current state");
        Ok(Some(scratch))
    }

    async fn validate(&self, target: &RollbackTarget) -> Result<(), RollbackError> {
        if target.validate_config {
            let root = target.destination.clone();
            let problems = tokio::task::spawn_blocking(move || config_problems(&root))
                .await
                .map_err(|e| BackupError::Task(e.to_string()))?;
            if !problems.is_empty() {
                return Err(RollbackError::ValidationFailed(problems.join("; ")));
            }
        }

        let timeout = self.settings.validation_timeout();
        for service in &target.services {
            let outcome = self.context.probes.check(service, timeout).await;
            if !outcome.is_ready() {
                return Err(RollbackError::ValidationFailed(format!(
                    "service {service} health check: {outcome}"
                )));
            }
        }

        let snapshot = self.context.metrics.snapshot().await?;
        let limits = &self.settings.sanity;
        let checks = [
            ("cpu", snapshot.cpu_percent, limits.cpu_percent),
            ("memory", snapshot.memory_percent, limits.memory_percent),
            ("disk", snapshot.disk_percent, limits.disk_percent),
        ];
        if let Some((name, value, limit)) = checks.iter().find(|(_, value, limit)| value > limit) {
            return Err(RollbackError::ValidationFailed(format!(
                "{name} usage {value:.1}% above limit {limit:.1}%"
            )));
        }
        Ok(())
    }
}

/// Remove all but the `keep` greatest-named directories under `dir`
///
/// Names are timestamps, so the greatest are the newest.
fn prune_scratch(dir: &Path, keep: usize) -> Result<Vec<PathBuf>, BackupError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| BackupError::Io { path, source }
    };

    let mut copies = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        if entry.file_type().map_err(io_err(&entry.path()))?.is_dir() {
            copies.push(entry.path());
        }
    }
    copies.sort();

    let excess = copies.len().saturating_sub(keep);
    let removed: Vec<PathBuf> = copies.into_iter().take(excess).collect();
    for path in &removed {
        std::fs::remove_dir_all(path).map_err(io_err(path))?;
        tracing::debug!(scratch = %path.display(), "pruned scratch copy");
    }
    Ok(removed)
}

fn describe(error: &RollbackError) -> String {
    format!("{}: {error}", error.kind())
}

/// Config files under `root` that fail to parse, as `path: message`
fn config_problems(root: &Path) -> Vec<String> {
    let mut problems = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                problems.push(format!("{}: {e}", root.display()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(format) = ConfigFormat::from_path(entry.path()) else {
            continue;
        };
        let result = std::fs::read_to_string(entry.path())
            .map_err(|e| e.to_string())
            .and_then(|text| format.check_syntax(&text));
        if let Err(message) = result {
            problems.push(format!("{}: {message}", entry.path().display()));
        }
    }
    problems
}
