//! Error types for the startup side
//!
//! Everything here is a construction-time error: a bad graph, a step
//! without a probe, an unusable history file. Step-level failures during a
//! run are recorded in the `StartupReport` instead.

use rvm_core::{HistoryError, StepStatus};

/// Dependency graph errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate service: {0}")]
    DuplicateService(String),

    #[error("service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    /// `cycle` is a closed path, first and last element are equal
    #[error("circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("graph is finalized, services can no longer be added")]
    GraphFinalized,
}

/// Step status transition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("illegal step transition {from} -> {to}")]
    IllegalTransition { from: StepStatus, to: StepStatus },
}

/// Probe execution and construction errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("probe task failed: {0}")]
    Task(String),

    #[error("invalid probe: {0}")]
    Invalid(String),
}

/// Startup coordinator construction errors
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("dependency graph: {0}")]
    Graph(#[from] GraphError),

    /// Every step must resolve to a probe before any run starts
    #[error("no readiness probe registered for step {0}")]
    MissingProbe(String),

    /// A probe was registered for a name that is not a step
    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("probe configuration: {0}")]
    Probe(#[from] ProbeError),

    #[error("history: {0}")]
    History(#[from] HistoryError),
}
