//! Orchestrator configuration
//!
//! One file drives the whole process: startup steps, trigger rules,
//! rollback targets and the metrics source. The format is picked from the
//! file extension (TOML, YAML or JSON). Unknown keys are ignored; missing
//! required keys fail loading with serde's `missing field` message, which
//! names the key.
//!
//! Step and rule tables keep document order so the startup tie-break
//! follows the file.

use crate::error::ConfigError;
use crate::types::RollbackStrategy;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supported on-disk formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Pick a format from a path's extension
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Check that `text` is well-formed in this format, without mapping it
    /// onto any particular type
    ///
    /// # Errors
    /// The parser's message.
    pub fn check_syntax(self, text: &str) -> Result<(), String> {
        match self {
            Self::Toml => toml::from_str::<toml::Table>(text).map(drop).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::from_str::<serde_yaml::Value>(text)
                .map(drop)
                .map_err(|e| e.to_string()),
            Self::Json => serde_json::from_str::<serde_json::Value>(text)
                .map(drop)
                .map_err(|e| e.to_string()),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// Startup steps keyed by service name
    pub steps: IndexMap<String, StepConfig>,
    /// Trigger rules keyed by rule name
    #[serde(default)]
    pub rules: IndexMap<String, RuleConfig>,
    #[serde(default)]
    pub rollback: RollbackSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Directory holding `startup_history.json` and `rollback_history.json`
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    /// In-memory cap applied when history is read back
    #[serde(default = "default_history_max_entries")]
    pub history_max_entries: usize,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: f64,
}

impl OrchestratorSettings {
    #[inline]
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        saturating_seconds(self.monitor_interval_seconds)
    }

    #[must_use]
    pub fn startup_history_path(&self) -> PathBuf {
        self.history_dir.join("startup_history.json")
    }

    #[must_use]
    pub fn rollback_history_path(&self) -> PathBuf {
        self.history_dir.join("rollback_history.json")
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            history_dir: default_history_dir(),
            history_max_entries: default_history_max_entries(),
            monitor_interval_seconds: default_monitor_interval(),
        }
    }
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("history")
}

fn default_history_max_entries() -> usize {
    500
}

fn default_monitor_interval() -> f64 {
    30.0
}

/// Startup step descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub dependencies: Vec<String>,
    pub critical: bool,
    pub timeout_seconds: f64,
    /// Readiness probe; steps without one need a programmatic registration
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
}

impl StepConfig {
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        saturating_seconds(self.timeout_seconds)
    }
}

/// Declarative readiness probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// Ready when the path exists
    File { path: PathBuf },
    /// Ready when a TCP connect succeeds
    Tcp { address: String },
    /// Ready when a GET returns the expected (or any 2xx) status
    Http {
        url: String,
        #[serde(default)]
        expect_status: Option<u16>,
    },
    /// Ready when a process with this name is running
    Process { name: String },
}

/// Trigger rule descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub cooldown_seconds: f64,
    /// `service_failure` observation window
    #[serde(default)]
    pub time_window_seconds: Option<f64>,
    /// `resource_exhaustion` per-resource limits (fall back to `threshold`)
    #[serde(default)]
    pub cpu_threshold: Option<f64>,
    #[serde(default)]
    pub memory_threshold: Option<f64>,
    #[serde(default)]
    pub disk_threshold: Option<f64>,
    /// Overrides the built-in rule → strategy mapping
    #[serde(default)]
    pub strategy: Option<RollbackStrategy>,
}

impl RuleConfig {
    #[inline]
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        saturating_seconds(self.cooldown_seconds)
    }
}

/// Rollback side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSettings {
    /// Root of the directory backup store
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,
    /// Where the current state is copied before each restore
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Saved states kept per strategy; older ones are pruned after each save
    #[serde(default = "default_scratch_keep")]
    pub scratch_keep: usize,
    /// Per-strategy restore targets, keyed by strategy name
    #[serde(default)]
    pub targets: IndexMap<String, RollbackTarget>,
    /// Post-rollback resource sanity limits
    #[serde(default)]
    pub sanity: ResourceLimits,
    /// Timeout applied to each post-rollback health probe
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_seconds: f64,
}

impl RollbackSettings {
    /// Target configured for a non-composite strategy
    #[must_use]
    pub fn target(&self, strategy: RollbackStrategy) -> Option<&RollbackTarget> {
        self.targets.get(strategy.as_str())
    }

    #[inline]
    #[must_use]
    pub fn validation_timeout(&self) -> Duration {
        saturating_seconds(self.validation_timeout_seconds)
    }
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            scratch_dir: default_scratch_dir(),
            scratch_keep: default_scratch_keep(),
            targets: IndexMap::new(),
            sanity: ResourceLimits::default(),
            validation_timeout_seconds: default_validation_timeout(),
        }
    }
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("backups")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("rollback")
}

fn default_scratch_keep() -> usize {
    5
}

fn default_validation_timeout() -> f64 {
    10.0
}

/// What a single strategy restores and how it is validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackTarget {
    /// Backup category to restore from
    pub category: String,
    /// Local directory fully replaced by the restore
    pub destination: PathBuf,
    /// Services restarted (service strategy) and health-probed afterwards
    #[serde(default)]
    pub services: Vec<String>,
    /// Parse every config file under `destination` after restoring
    #[serde(default)]
    pub validate_config: bool,
}

/// Upper bounds a node must be under after a rollback
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_percent: 95.0,
            memory_percent: 95.0,
            disk_percent: 98.0,
        }
    }
}

/// System metrics source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Endpoint timed for response time and error ratio
    #[serde(default)]
    pub health_url: Option<String>,
    /// Mount point whose usage is reported as disk percent
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,
    /// Services whose step probe doubles as a liveness probe
    #[serde(default)]
    pub liveness_services: Vec<String>,
    /// Number of health checks kept for the error ratio
    #[serde(default = "default_error_window")]
    pub error_window: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
}

impl MetricsSettings {
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        saturating_seconds(self.request_timeout_seconds)
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            health_url: None,
            disk_mount: default_disk_mount(),
            liveness_services: Vec::new(),
            error_window: default_error_window(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_error_window() -> usize {
    20
}

fn default_request_timeout() -> f64 {
    5.0
}

impl OrchestratorConfig {
    /// Load and validate a configuration file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::UnsupportedFormat` for unknown extensions
    /// - `ConfigError::Parse` for syntax errors and missing keys
    /// - `ConfigError::Invalid` for out-of-range values
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)
            .ok_or_else(|| ConfigError::UnsupportedFormat(path.to_path_buf()))?;
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text, format).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            steps = config.steps.len(),
            rules = config.rules.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration text
    ///
    /// # Errors
    /// Same as [`OrchestratorConfig::load`], minus I/O.
    pub fn from_str_with_format(text: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config = Self::parse(text, format).map_err(|message| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn parse(text: &str, format: ConfigFormat) -> Result<Self, String> {
        match format {
            ConfigFormat::Toml => toml::from_str(text).map_err(|e| e.to_string()),
            ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
        }
    }

    /// Range and cross-reference checks serde cannot express
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, step) in &self.steps {
            seconds(&format!("steps.{name}.timeout_seconds"), step.timeout_seconds, false)?;
        }
        for (name, rule) in &self.rules {
            seconds(&format!("rules.{name}.cooldown_seconds"), rule.cooldown_seconds, true)?;
            if let Some(window) = rule.time_window_seconds {
                seconds(&format!("rules.{name}.time_window_seconds"), window, false)?;
            }
        }
        seconds(
            "orchestrator.monitor_interval_seconds",
            self.orchestrator.monitor_interval_seconds,
            false,
        )?;
        seconds(
            "rollback.validation_timeout_seconds",
            self.rollback.validation_timeout_seconds,
            false,
        )?;
        seconds(
            "metrics.request_timeout_seconds",
            self.metrics.request_timeout_seconds,
            false,
        )?;

        for (key, target) in &self.rollback.targets {
            match key.parse::<RollbackStrategy>() {
                Ok(s) if s.is_composite() => {
                    return Err(ConfigError::Invalid(format!(
                        "rollback.targets.{key} is derived and cannot be configured"
                    )))
                }
                // targets are looked up by canonical name only
                Ok(s) if s.as_str() != key => {
                    return Err(ConfigError::Invalid(format!(
                        "rollback.targets.{key} must be named {}",
                        s.as_str()
                    )))
                }
                Ok(_) => {}
                Err(e) => return Err(ConfigError::Invalid(format!("rollback.targets: {e}"))),
            }
            for service in &target.services {
                if !self.steps.contains_key(service) {
                    return Err(ConfigError::Invalid(format!(
                        "rollback.targets.{key}.services references unknown step {service}"
                    )));
                }
            }
        }
        for service in &self.metrics.liveness_services {
            if !self.steps.contains_key(service) {
                return Err(ConfigError::Invalid(format!(
                    "metrics.liveness_services references unknown step {service}"
                )));
            }
        }
        Ok(())
    }
}

/// Accessor conversion for values that skipped [`OrchestratorConfig::validate`]
///
/// Negative and NaN become zero; anything longer is capped at
/// [`MAX_CONFIG_SECONDS`].
#[must_use]
pub fn saturating_seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0).min(MAX_CONFIG_SECONDS)).unwrap_or_default()
}

/// Longest duration any seconds key may hold (ten years)
///
/// Keeps `Instant + Duration` arithmetic in timers from overflowing.
pub const MAX_CONFIG_SECONDS: f64 = 10.0 * 365.0 * 24.0 * 3600.0;

/// Check that `value` is a usable number of seconds
fn seconds(key: &str, value: f64, allow_zero: bool) -> Result<Duration, ConfigError> {
    let lower = if allow_zero { "non-negative" } else { "positive" };
    match Duration::try_from_secs_f64(value) {
        Ok(_) if value > MAX_CONFIG_SECONDS => Err(ConfigError::Invalid(format!(
            "{key} must be at most {MAX_CONFIG_SECONDS} seconds, got {value}"
        ))),
        Ok(d) if allow_zero || !d.is_zero() => Ok(d),
        _ => Err(ConfigError::Invalid(format!(
            "{key} must be a {lower} number of seconds, got {value}"
        ))),
    }
}
