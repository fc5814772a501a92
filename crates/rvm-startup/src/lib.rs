//! RVM Startup - dependency-ordered service startup
//!
//! Two phases, as in any graph executor:
//! 1. **Construction**: steps are added to a [`DependencyGraph`], which is
//!    finalized into a startup order; every step must resolve to a probe
//! 2. **Execution**: [`StartupCoordinator::run`] walks that order, gating
//!    each step on its dependencies and its readiness probe
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rvm_startup::prelude::*;
//!
//! let probes = Arc::new(ProbeRegistry::from_steps(&config.steps)?);
//! let history = Arc::new(HistoryLog::open(path, 500)?);
//! let coordinator = StartupCoordinator::from_config(&config, probes, history)?;
//!
//! let report = coordinator.run().await;
//! assert!(report.overall_success);
//! ```

#![allow(missing_docs)]

pub mod coordinator;
pub mod error;
pub mod graph;
pub mod probe;
pub mod state_machine;

pub use coordinator::{ShutdownOutcome, StartupCoordinator, StepDescriptor};
pub use error::{GraphError, ProbeError, StartupError, StateMachineError};
pub use graph::{DependencyGraph, ServiceNode};
pub use probe::{
    build_probe, run_probe, FileExistsProbe, FnProbe, HttpGetProbe, ProbeOutcome, ProbeRegistry,
    ProcessProbe, ReadinessProbe, TcpPortProbe,
};

/// Re-exports for wiring a coordinator
pub mod prelude {
    pub use crate::coordinator::{StartupCoordinator, StepDescriptor};
    pub use crate::probe::{ProbeRegistry, ReadinessProbe};
    pub use rvm_core::{HistoryLog, StartupReport, StepStatus};
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
