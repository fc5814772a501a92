//! Core record types shared by the startup and rollback sides
//!
//! Everything in here is plain data: it is serialized into the history
//! logs and handed out read-only to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use ulid::Ulid;

/// Trigger name used for rollbacks requested by an operator.
pub const MANUAL_TRIGGER: &str = "manual";

/// Unique record identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Ulid);

impl RecordId {
    /// Generate new record ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a single startup step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Skipped,
    Error,
}

impl StepStatus {
    /// Terminal states never transition again.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Any terminal state other than `Completed` and `Skipped`.
    #[inline]
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one startup step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step (service) name
    pub step_name: String,
    /// Final status once the step has been finalized
    pub status: StepStatus,
    /// Whether a failure of this step aborts the run
    pub critical: bool,
    /// Wall-clock time spent in the step
    pub duration_seconds: f64,
    /// When the step began
    pub timestamp: DateTime<Utc>,
    /// Reason for a non-successful outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepResult {
    /// Fresh result in the `Pending` state
    #[must_use]
    pub fn pending(step_name: impl Into<String>, critical: bool) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            critical,
            duration_seconds: 0.0,
            timestamp: Utc::now(),
            error_message: None,
        }
    }
}

/// Result of one `StartupCoordinator::run` invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupReport {
    pub id: RecordId,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Steps in startup order
    pub steps: Vec<StepResult>,
    pub overall_success: bool,
    /// Run stopped early because the caller cancelled it
    #[serde(default)]
    pub cancelled: bool,
}

impl StartupReport {
    /// Look up a step by name
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    /// Status of a step, if it is part of the report
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.step(name).map(|s| s.status)
    }
}

/// Rollback strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    Configuration,
    Service,
    Data,
    FullSystem,
}

impl RollbackStrategy {
    /// Sub-strategies executed, in order, by `FullSystem`.
    pub const FULL_SYSTEM_CHAIN: [RollbackStrategy; 3] =
        [Self::Configuration, Self::Service, Self::Data];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Service => "service",
            Self::Data => "data",
            Self::FullSystem => "full_system",
        }
    }

    /// Whether this strategy is a chain of other strategies
    #[inline]
    #[must_use]
    pub fn is_composite(self) -> bool {
        matches!(self, Self::FullSystem)
    }
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown strategy name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rollback strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for RollbackStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configuration" | "config" => Ok(Self::Configuration),
            "service" => Ok(Self::Service),
            "data" => Ok(Self::Data),
            "full_system" | "full-system" => Ok(Self::FullSystem),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Outcome of a rollback attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Success,
    Failed,
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// One entry of the rollback audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub id: RecordId,
    pub rollback_type: RollbackStrategy,
    pub status: RollbackStatus,
    pub trigger_name: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Human-readable outcome, including the error class on failure
    pub details: String,
    /// Snapshot that was restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    /// Where the pre-rollback state was saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_path: Option<PathBuf>,
}

impl RollbackRecord {
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == RollbackStatus::Success
    }
}

/// Point-in-time view of node health, pulled from a metrics source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub response_time_seconds: f64,
    /// Liveness per monitored service (`true` = alive)
    #[serde(default)]
    pub service_liveness: BTreeMap<String, bool>,
    /// Fraction of failed requests over the source's window, 0.0..=1.0
    pub error_ratio: f64,
}
