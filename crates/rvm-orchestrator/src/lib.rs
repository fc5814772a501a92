//! RVM Orchestrator - process wiring
//!
//! Builds the explicit context the coordinators run in: probes resolved
//! from the step table, both history logs, the backup store, the metrics
//! source and the service controller. Nothing is global; the binary owns
//! one [`Orchestrator`] and tests build their own with fakes through
//! [`Orchestrator::with_capabilities`].
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::from_config_path("orchestrator.toml")?;
//! let report = orchestrator.run_startup(&CancellationToken::new()).await;
//! if report.overall_success {
//!     let monitor = orchestrator.monitor().spawn();
//!     // ...
//!     monitor.shutdown().await?;
//! }
//! ```

#![allow(missing_docs)]

pub mod error;

pub use error::OrchestratorError;

use rvm_core::{
    HistoryLog, OrchestratorConfig, RollbackRecord, RollbackStrategy, ServiceController,
    StartupReport, SystemctlController,
};
use rvm_rollback::{
    rules_from_config, BackupStore, DirectoryBackupStore, MetricsSource, RollbackContext,
    RollbackCoordinator, SystemMetricsSource, TriggerEvaluator, TriggerMonitor,
};
use rvm_startup::{ProbeRegistry, ShutdownOutcome, StartupCoordinator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// External systems the orchestrator talks to
#[derive(Clone)]
pub struct Capabilities {
    pub store: Arc<dyn BackupStore>,
    pub controller: Arc<dyn ServiceController>,
    pub metrics: Arc<dyn MetricsSource>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

impl Capabilities {
    /// Directory backups, `systemctl` and host metrics
    ///
    /// # Errors
    /// `OrchestratorError::Metrics` if the HTTP client cannot be built.
    pub fn system(
        config: &OrchestratorConfig,
        probes: Arc<ProbeRegistry>,
    ) -> Result<Self, OrchestratorError> {
        let metrics = SystemMetricsSource::new(config.metrics.clone(), probes)?;
        Ok(Self {
            store: Arc::new(DirectoryBackupStore::new(config.rollback.backup_root.clone())),
            controller: Arc::new(SystemctlController::new()),
            metrics: Arc::new(metrics),
        })
    }
}

/// The wired process: one startup coordinator, one rollback coordinator
pub struct Orchestrator {
    config: OrchestratorConfig,
    config_path: Option<PathBuf>,
    capabilities: Capabilities,
    startup: StartupCoordinator,
    rollback: Arc<RollbackCoordinator>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config_path", &self.config_path)
            .field("startup", &self.startup)
            .field("rollback", &self.rollback)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Load `path` and wire production capabilities
    ///
    /// The path is remembered so the trigger monitor can hot-reload rules.
    ///
    /// # Errors
    /// Any configuration, probe, graph or history problem.
    pub fn from_config_path(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let config = OrchestratorConfig::load(path)?;
        let probes = Arc::new(ProbeRegistry::from_steps(&config.steps)?);
        let capabilities = Capabilities::system(&config, Arc::clone(&probes))?;

        let mut orchestrator = Self::wire(config, probes, capabilities)?;
        orchestrator.config_path = Some(path.to_path_buf());
        Ok(orchestrator)
    }

    /// Wire with caller-supplied probes and capabilities
    ///
    /// `probes` is used as given; configured `probe` entries are not
    /// resolved.
    ///
    /// # Errors
    /// Graph, missing-probe or history problems.
    pub fn with_capabilities(
        config: OrchestratorConfig,
        probes: ProbeRegistry,
        capabilities: Capabilities,
    ) -> Result<Self, OrchestratorError> {
        Self::wire(config, Arc::new(probes), capabilities)
    }

    fn wire(
        config: OrchestratorConfig,
        probes: Arc<ProbeRegistry>,
        capabilities: Capabilities,
    ) -> Result<Self, OrchestratorError> {
        let settings = &config.orchestrator;
        let startup_history: HistoryLog<StartupReport> =
            HistoryLog::open(settings.startup_history_path(), settings.history_max_entries)?;
        let rollback_history: HistoryLog<RollbackRecord> =
            HistoryLog::open(settings.rollback_history_path(), settings.history_max_entries)?;

        let startup =
            StartupCoordinator::from_config(&config, Arc::clone(&probes), Arc::new(startup_history))?;

        let context = RollbackContext {
            store: Arc::clone(&capabilities.store),
            controller: Arc::clone(&capabilities.controller),
            metrics: Arc::clone(&capabilities.metrics),
            probes,
        };
        let rollback = Arc::new(RollbackCoordinator::new(
            config.rollback.clone(),
            context,
            Arc::new(rollback_history),
        ));

        tracing::debug!(
            steps = config.steps.len(),
            rules = config.rules.len(),
            targets = config.rollback.targets.len(),
            "orchestrator wired"
        );
        Ok(Self {
            config,
            config_path: None,
            capabilities,
            startup,
            rollback,
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn startup(&self) -> &StartupCoordinator {
        &self.startup
    }

    #[inline]
    #[must_use]
    pub fn rollback(&self) -> &Arc<RollbackCoordinator> {
        &self.rollback
    }

    /// Run the startup sequence once
    pub async fn run_startup(&self, cancel: &CancellationToken) -> StartupReport {
        self.startup.run_with_cancel(cancel).await
    }

    /// Run one strategy on demand
    pub async fn rollback_now(&self, strategy: RollbackStrategy, trigger_name: &str) -> RollbackRecord {
        self.rollback.rollback(strategy, trigger_name).await
    }

    /// Stop every service in shutdown order
    pub async fn shutdown_services(&self) -> Vec<ShutdownOutcome> {
        self.startup.shutdown(self.capabilities.controller.as_ref()).await
    }

    /// Build a trigger monitor over the configured rules
    ///
    /// When the orchestrator was loaded from a file, the monitor reloads
    /// its rules whenever that file changes.
    #[must_use]
    pub fn monitor(&self) -> TriggerMonitor {
        let evaluator = TriggerEvaluator::with_rules(rules_from_config(&self.config.rules));
        let monitor = TriggerMonitor::new(
            evaluator,
            Arc::clone(&self.capabilities.metrics),
            Arc::clone(&self.rollback),
            self.config.orchestrator.monitor_interval(),
        );
        match &self.config_path {
            Some(path) => monitor.with_config_reload(path),
            None => monitor,
        }
    }

    #[must_use]
    pub fn startup_reports(&self) -> Vec<StartupReport> {
        self.startup.reports()
    }

    #[must_use]
    pub fn rollback_records(&self) -> Vec<RollbackRecord> {
        self.rollback.records()
    }
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
