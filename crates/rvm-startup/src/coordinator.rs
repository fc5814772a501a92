//! Startup coordinator
//!
//! Walks the finalized startup order one step at a time. Each step is gated
//! on its dependencies having completed in the current run, then checked
//! with its readiness probe under the step timeout. A critical failure stops
//! the run and every step not yet attempted is recorded as skipped.
//!
//! Every call to [`StartupCoordinator::run`] appends exactly one
//! `StartupReport` to the startup history. There is no internal retry.

use crate::error::StartupError;
use crate::graph::DependencyGraph;
use crate::probe::{ProbeOutcome, ProbeRegistry};
use crate::state_machine::validate_transition;
use chrono::Utc;
use indexmap::IndexMap;
use rvm_core::{
    HistoryLog, OrchestratorConfig, RecordId, ServiceController, StartupReport, StepConfig,
    StepResult, StepStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One startup step as the coordinator sees it
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    pub name: String,
    /// Declared dependencies, in declaration order
    pub dependencies: Vec<String>,
    pub critical: bool,
    pub timeout: Duration,
}

impl StepDescriptor {
    /// Critical step with a 10 second timeout
    pub fn new<I, S>(name: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            critical: true,
            timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn from_config(name: &str, step: &StepConfig) -> Self {
        Self {
            name: name.to_string(),
            dependencies: step.dependencies.clone(),
            critical: step.critical,
            timeout: step.timeout(),
        }
    }
}

/// Result of stopping one service during shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub service: String,
    pub error: Option<String>,
}

impl ShutdownOutcome {
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Tracks one step through its state machine
struct StepTracker {
    result: StepResult,
    started: Instant,
}

impl StepTracker {
    fn begin(name: &str, critical: bool) -> Self {
        Self {
            result: StepResult::pending(name, critical),
            started: Instant::now(),
        }
    }

    fn advance(&mut self, to: StepStatus, error_message: Option<String>) {
        match validate_transition(self.result.status, to) {
            Ok(()) => {
                self.result.status = to;
                if error_message.is_some() {
                    self.result.error_message = error_message;
                }
            }
            Err(e) => {
                tracing::error!(step = %self.result.step_name, error = %e, "rejected step transition");
            }
        }
    }

    fn finish(mut self) -> StepResult {
        self.result.duration_seconds = self.started.elapsed().as_secs_f64();
        self.result
    }
}

/// Runs the startup sequence over a finalized dependency graph
pub struct StartupCoordinator {
    graph: DependencyGraph,
    steps: IndexMap<String, StepDescriptor>,
    probes: Arc<ProbeRegistry>,
    history: Arc<HistoryLog<StartupReport>>,
}

impl std::fmt::Debug for StartupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupCoordinator")
            .field("startup_order", &self.graph.startup_order())
            .field("probes", &self.probes)
            .finish_non_exhaustive()
    }
}

impl StartupCoordinator {
    /// Build the graph and check that every step has a probe
    ///
    /// # Errors
    /// - `StartupError::Graph` for duplicate, unknown or circular dependencies
    /// - `StartupError::MissingProbe` if a step has no registered probe
    /// - `StartupError::UnknownStep` if a probe is registered for a non-step
    pub fn new<I>(
        steps: I,
        probes: Arc<ProbeRegistry>,
        history: Arc<HistoryLog<StartupReport>>,
    ) -> Result<Self, StartupError>
    where
        I: IntoIterator<Item = StepDescriptor>,
    {
        let mut graph = DependencyGraph::new();
        let mut by_name = IndexMap::new();
        for step in steps {
            graph.add_service(step.name.clone(), step.dependencies.iter().cloned())?;
            by_name.insert(step.name.clone(), step);
        }
        graph.finalize()?;

        if let Some(missing) = by_name.keys().find(|name| !probes.contains(name)) {
            return Err(StartupError::MissingProbe(missing.clone()));
        }
        let mut extra: Vec<&str> = probes.steps().filter(|s| !by_name.contains_key(*s)).collect();
        extra.sort_unstable();
        if let Some(unknown) = extra.first() {
            return Err(StartupError::UnknownStep((*unknown).to_string()));
        }

        tracing::info!(
            steps = by_name.len(),
            order = ?graph.startup_order(),
            "startup coordinator ready"
        );

        Ok(Self {
            graph,
            steps: by_name,
            probes,
            history,
        })
    }

    /// Build from the `[steps]` table of a loaded configuration
    ///
    /// # Errors
    /// See [`StartupCoordinator::new`].
    pub fn from_config(
        config: &OrchestratorConfig,
        probes: Arc<ProbeRegistry>,
        history: Arc<HistoryLog<StartupReport>>,
    ) -> Result<Self, StartupError> {
        let steps = config
            .steps
            .iter()
            .map(|(name, step)| StepDescriptor::from_config(name, step));
        Self::new(steps, probes, history)
    }

    #[inline]
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    #[inline]
    #[must_use]
    pub fn startup_order(&self) -> &[String] {
        self.graph.startup_order()
    }

    #[inline]
    #[must_use]
    pub fn shutdown_order(&self) -> &[String] {
        self.graph.shutdown_order()
    }

    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name)
    }

    #[must_use]
    pub fn probes(&self) -> &Arc<ProbeRegistry> {
        &self.probes
    }

    #[must_use]
    pub fn history(&self) -> &Arc<HistoryLog<StartupReport>> {
        &self.history
    }

    /// Reports held in memory, oldest first
    #[must_use]
    pub fn reports(&self) -> Vec<StartupReport> {
        self.history.records()
    }

    /// Run the startup sequence once
    pub async fn run(&self) -> StartupReport {
        self.run_with_cancel(&CancellationToken::new()).await
    }

    /// Run the startup sequence, stopping at the next step boundary once
    /// `cancel` fires
    pub async fn run_with_cancel(&self, cancel: &CancellationToken) -> StartupReport {
        let run_started = Instant::now();
        let started_at = Utc::now();
        let order = self.graph.startup_order();

        tracing::info!(steps = order.len(), "starting startup sequence");

        let mut results = Vec::with_capacity(order.len());
        let mut statuses: HashMap<&str, StepStatus> = HashMap::with_capacity(order.len());
        let mut overall_success = true;
        let mut cancelled = false;

        for (position, name) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(remaining = order.len() - position, "startup cancelled");
                cancelled = true;
                overall_success = false;
                results.extend(self.skip_all(&order[position..], "startup cancelled"));
                break;
            }

            let Some(step) = self.steps.get(name) else {
                continue;
            };

            let result = self.run_step(step, &statuses).await;
            metrics::counter!("rvm_startup_steps_total", "status" => result.status.as_str())
                .increment(1);
            statuses.insert(name.as_str(), result.status);

            let failed = result.status != StepStatus::Completed;
            results.push(result);

            if failed && step.critical {
                tracing::error!(step = %name, "critical step failed, aborting startup");
                overall_success = false;
                let reason = format!("aborted after critical step {name} failed");
                results.extend(self.skip_all(&order[position + 1..], &reason));
                break;
            }
        }

        let report = StartupReport {
            id: RecordId::new(),
            started_at,
            duration_seconds: run_started.elapsed().as_secs_f64(),
            steps: results,
            overall_success,
            cancelled,
        };

        metrics::counter!(
            "rvm_startup_runs_total",
            "outcome" => if report.overall_success { "success" } else { "failure" }
        )
        .increment(1);
        tracing::info!(
            id = %report.id,
            success = report.overall_success,
            cancelled = report.cancelled,
            duration = report.duration_seconds,
            "startup sequence finished"
        );

        if let Err(e) = self.history.append(report.clone()) {
            tracing::error!(error = %e, "failed to persist startup report");
        }

        report
    }

    async fn run_step(
        &self,
        step: &StepDescriptor,
        statuses: &HashMap<&str, StepStatus>,
    ) -> StepResult {
        let mut tracker = StepTracker::begin(&step.name, step.critical);

        let unmet = step
            .dependencies
            .iter()
            .find(|dep| statuses.get(dep.as_str()) != Some(&StepStatus::Completed));
        if let Some(dep) = unmet {
            tracing::warn!(step = %step.name, dependency = %dep, "dependency not met");
            tracker.advance(StepStatus::Failed, Some(format!("dependency not met: {dep}")));
            return tracker.finish();
        }

        tracker.advance(StepStatus::Running, None);
        tracing::debug!(step = %step.name, timeout = ?step.timeout, "step running");

        match self.probes.check(&step.name, step.timeout).await {
            ProbeOutcome::Ready => tracker.advance(StepStatus::Completed, None),
            ProbeOutcome::NotReady => tracker.advance(
                StepStatus::Failed,
                Some("readiness probe reported not ready".to_string()),
            ),
            ProbeOutcome::TimedOut => tracker.advance(
                StepStatus::Timeout,
                Some(format!(
                    "readiness probe timed out after {:.1}s",
                    step.timeout.as_secs_f64()
                )),
            ),
            ProbeOutcome::Errored(e) => tracker.advance(StepStatus::Error, Some(e)),
        }

        let result = tracker.finish();
        match result.status {
            StepStatus::Completed => {
                tracing::info!(step = %step.name, duration = result.duration_seconds, "step completed");
            }
            status if step.critical => {
                tracing::error!(step = %step.name, %status, error = ?result.error_message, "critical step failed");
            }
            status => {
                tracing::warn!(step = %step.name, %status, error = ?result.error_message, "non-critical step failed, continuing");
            }
        }
        result
    }

    fn skip_all(&self, names: &[String], reason: &str) -> Vec<StepResult> {
        names
            .iter()
            .map(|name| {
                let critical = self.steps.get(name).is_some_and(|s| s.critical);
                let mut tracker = StepTracker::begin(name, critical);
                tracker.advance(StepStatus::Skipped, Some(reason.to_string()));
                tracker.finish()
            })
            .collect()
    }

    /// Stop every service in shutdown order
    ///
    /// A failing stop is logged and recorded; the remaining services are
    /// still stopped.
    pub async fn shutdown(&self, controller: &dyn ServiceController) -> Vec<ShutdownOutcome> {
        let mut outcomes = Vec::with_capacity(self.graph.len());
        for service in self.graph.shutdown_order() {
            let error = match controller.stop(service).await {
                Ok(()) => {
                    tracing::info!(service = %service, "service stopped");
                    None
                }
                Err(e) => {
                    tracing::warn!(service = %service, error = %e, "failed to stop service");
                    Some(e.to_string())
                }
            };
            outcomes.push(ShutdownOutcome {
                service: service.clone(),
                error,
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::FnProbe;

    fn registry(names: &[&str]) -> Arc<ProbeRegistry> {
        let mut registry = ProbeRegistry::new();
        for name in names {
            registry.register(*name, Arc::new(FnProbe::new(|| true)));
        }
        Arc::new(registry)
    }

    #[test]
    fn missing_probe_is_rejected() {
        let err = StartupCoordinator::new(
            [StepDescriptor::new("db", Vec::<String>::new()), StepDescriptor::new("api", ["db"])],
            registry(&["db"]),
            Arc::new(HistoryLog::in_memory(10)),
        )
        .unwrap_err();
        assert!(matches!(err, StartupError::MissingProbe(name) if name == "api"));
    }

    #[test]
    fn probe_for_unknown_step_is_rejected() {
        let err = StartupCoordinator::new(
            [StepDescriptor::new("db", Vec::<String>::new())],
            registry(&["db", "ghost"]),
            Arc::new(HistoryLog::in_memory(10)),
        )
        .unwrap_err();
        assert!(matches!(err, StartupError::UnknownStep(name) if name == "ghost"));
    }

    #[test]
    fn cycle_is_a_construction_error() {
        let err = StartupCoordinator::new(
            [StepDescriptor::new("a", ["b"]), StepDescriptor::new("b", ["a"])],
            registry(&["a", "b"]),
            Arc::new(HistoryLog::in_memory(10)),
        )
        .unwrap_err();
        assert!(matches!(err, StartupError::Graph(_)));
    }

    #[test]
    fn tracker_ignores_illegal_transition() {
        let mut tracker = StepTracker::begin("db", true);
        tracker.advance(StepStatus::Completed, None);
        assert_eq!(tracker.result.status, StepStatus::Pending);
        tracker.advance(StepStatus::Running, None);
        tracker.advance(StepStatus::Completed, None);
        assert_eq!(tracker.finish().status, StepStatus::Completed);
    }
}
