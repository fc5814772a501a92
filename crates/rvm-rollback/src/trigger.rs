//! Trigger rules
//!
//! A rule is a predicate over a `MetricsSnapshot` plus a threshold and a
//! cooldown. The evaluator's only state is when each rule last fired and
//! the recent liveness failures seen per service.

use indexmap::IndexMap;
use rvm_core::{saturating_seconds, MetricsSnapshot, RollbackStrategy, RuleConfig};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const HIGH_ERROR_RATE: &str = "high_error_rate";
pub const SERVICE_FAILURE: &str = "service_failure";
pub const PERFORMANCE_DEGRADATION: &str = "performance_degradation";
pub const RESOURCE_EXHAUSTION: &str = "resource_exhaustion";

pub const DEFAULT_ERROR_RATE: f64 = 0.10;
pub const DEFAULT_MAX_FAILURES: f64 = 3.0;
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_RESPONSE_TIME: f64 = 5.0;
pub const DEFAULT_CPU_LIMIT: f64 = 90.0;
pub const DEFAULT_MEMORY_LIMIT: f64 = 90.0;
pub const DEFAULT_DISK_LIMIT: f64 = 95.0;

type Predicate = Arc<dyn Fn(&MetricsSnapshot, f64) -> bool + Send + Sync>;

/// What a rule checks
#[derive(Clone)]
pub enum TriggerCondition {
    /// `error_ratio > threshold`
    HighErrorRate,
    /// A service was seen down more than `threshold` times within `window`
    ServiceFailure { window: Duration },
    /// `response_time_seconds > threshold`
    PerformanceDegradation,
    /// Any of cpu / memory / disk above its own limit
    ResourceExhaustion { cpu: f64, memory: f64, disk: f64 },
    /// Arbitrary predicate, called with the snapshot and the threshold
    Custom(Predicate),
}

impl fmt::Debug for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighErrorRate => f.write_str("HighErrorRate"),
            Self::ServiceFailure { window } => {
                f.debug_struct("ServiceFailure").field("window", window).finish()
            }
            Self::PerformanceDegradation => f.write_str("PerformanceDegradation"),
            Self::ResourceExhaustion { cpu, memory, disk } => f
                .debug_struct("ResourceExhaustion")
                .field("cpu", cpu)
                .field("memory", memory)
                .field("disk", disk)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A named, thresholded condition with a cooldown
#[derive(Debug, Clone)]
pub struct TriggerRule {
    pub name: String,
    pub enabled: bool,
    pub threshold: f64,
    pub condition: TriggerCondition,
    pub cooldown: Duration,
    /// Strategy the monitor runs when this rule fires
    pub strategy: RollbackStrategy,
}

impl TriggerRule {
    /// Enabled rule with no cooldown, mapped to the service strategy
    pub fn new(name: impl Into<String>, threshold: f64, condition: TriggerCondition) -> Self {
        let name = name.into();
        let strategy = default_strategy(&name);
        Self {
            name,
            enabled: true,
            threshold,
            condition,
            cooldown: Duration::ZERO,
            strategy,
        }
    }

    pub fn custom<F>(name: impl Into<String>, threshold: f64, predicate: F) -> Self
    where
        F: Fn(&MetricsSnapshot, f64) -> bool + Send + Sync + 'static,
    {
        Self::new(name, threshold, TriggerCondition::Custom(Arc::new(predicate)))
    }

    #[must_use]
    pub fn high_error_rate() -> Self {
        Self::new(HIGH_ERROR_RATE, DEFAULT_ERROR_RATE, TriggerCondition::HighErrorRate)
    }

    #[must_use]
    pub fn service_failure() -> Self {
        Self::new(
            SERVICE_FAILURE,
            DEFAULT_MAX_FAILURES,
            TriggerCondition::ServiceFailure {
                window: DEFAULT_FAILURE_WINDOW,
            },
        )
    }

    #[must_use]
    pub fn performance_degradation() -> Self {
        Self::new(
            PERFORMANCE_DEGRADATION,
            DEFAULT_RESPONSE_TIME,
            TriggerCondition::PerformanceDegradation,
        )
    }

    #[must_use]
    pub fn resource_exhaustion() -> Self {
        Self::new(
            RESOURCE_EXHAUSTION,
            DEFAULT_CPU_LIMIT,
            TriggerCondition::ResourceExhaustion {
                cpu: DEFAULT_CPU_LIMIT,
                memory: DEFAULT_MEMORY_LIMIT,
                disk: DEFAULT_DISK_LIMIT,
            },
        )
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: RollbackStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Build a built-in rule from its configuration entry
    ///
    /// Returns `None` for names that are not built-in rules.
    #[must_use]
    pub fn from_config(name: &str, config: &RuleConfig) -> Option<Self> {
        let condition = match name {
            HIGH_ERROR_RATE => TriggerCondition::HighErrorRate,
            SERVICE_FAILURE => TriggerCondition::ServiceFailure {
                window: config
                    .time_window_seconds
                    .map_or(DEFAULT_FAILURE_WINDOW, saturating_seconds),
            },
            PERFORMANCE_DEGRADATION => TriggerCondition::PerformanceDegradation,
            RESOURCE_EXHAUSTION => TriggerCondition::ResourceExhaustion {
                cpu: config.cpu_threshold.unwrap_or(config.threshold),
                memory: config.memory_threshold.unwrap_or(config.threshold),
                disk: config.disk_threshold.unwrap_or(config.threshold),
            },
            _ => return None,
        };

        let mut rule = Self::new(name, config.threshold, condition)
            .enabled(config.enabled)
            .with_cooldown(config.cooldown());
        if let Some(strategy) = config.strategy {
            rule.strategy = strategy;
        }
        Some(rule)
    }
}

/// Strategy run for a rule when the configuration does not name one
#[must_use]
pub fn default_strategy(rule: &str) -> RollbackStrategy {
    match rule {
        PERFORMANCE_DEGRADATION => RollbackStrategy::Configuration,
        RESOURCE_EXHAUSTION => RollbackStrategy::FullSystem,
        _ => RollbackStrategy::Service,
    }
}

/// Built-in rules from the `[rules]` table, in file order
///
/// Unknown names are skipped with a warning.
#[must_use]
pub fn rules_from_config(rules: &IndexMap<String, RuleConfig>) -> Vec<TriggerRule> {
    rules
        .iter()
        .filter_map(|(name, config)| {
            let rule = TriggerRule::from_config(name, config);
            if rule.is_none() {
                tracing::warn!(rule = %name, "ignoring unknown trigger rule");
            }
            rule
        })
        .collect()
}

/// Evaluates trigger rules against metrics snapshots
#[derive(Debug, Default)]
pub struct TriggerEvaluator {
    rules: IndexMap<String, TriggerRule>,
    last_fired: HashMap<String, Instant>,
    failures: HashMap<String, VecDeque<Instant>>,
}

impl TriggerEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_rules(rules: impl IntoIterator<Item = TriggerRule>) -> Self {
        let mut evaluator = Self::new();
        for rule in rules {
            evaluator.register_rule(rule);
        }
        evaluator
    }

    /// Add or replace a rule; a replaced rule keeps its last-fired time
    pub fn register_rule(&mut self, rule: TriggerRule) {
        tracing::debug!(rule = %rule.name, enabled = rule.enabled, "registered trigger rule");
        self.rules.insert(rule.name.clone(), rule);
    }

    /// Replace the rule set
    ///
    /// Last-fired times survive for rules whose name is still present.
    pub fn reload(&mut self, rules: impl IntoIterator<Item = TriggerRule>) {
        self.rules = rules.into_iter().map(|r| (r.name.clone(), r)).collect();
        self.last_fired.retain(|name, _| self.rules.contains_key(name));
        tracing::info!(rules = self.rules.len(), "reloaded trigger rules");
    }

    #[must_use]
    pub fn rule(&self, name: &str) -> Option<&TriggerRule> {
        self.rules.get(name)
    }

    pub fn rules(&self) -> impl Iterator<Item = &TriggerRule> + '_ {
        self.rules.values()
    }

    #[must_use]
    pub fn last_fired(&self, name: &str) -> Option<Instant> {
        self.last_fired.get(name).copied()
    }

    /// Names of enabled rules that hold now and are outside their cooldown
    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot) -> BTreeSet<String> {
        self.evaluate_at(snapshot, Instant::now())
    }

    /// [`TriggerEvaluator::evaluate`] with an explicit clock
    pub fn evaluate_at(&mut self, snapshot: &MetricsSnapshot, now: Instant) -> BTreeSet<String> {
        self.observe_liveness(snapshot, now);

        let mut fired = BTreeSet::new();
        for rule in self.rules.values().filter(|r| r.enabled) {
            if !self.holds(rule, snapshot, now) {
                continue;
            }
            if let Some(last) = self.last_fired.get(&rule.name) {
                if now.saturating_duration_since(*last) < rule.cooldown {
                    tracing::debug!(rule = %rule.name, "trigger suppressed by cooldown");
                    continue;
                }
            }
            fired.insert(rule.name.clone());
        }

        for name in &fired {
            self.last_fired.insert(name.clone(), now);
            ::metrics::counter!("rvm_triggers_fired_total", "rule" => name.clone()).increment(1);
            tracing::warn!(rule = %name, "trigger fired");
        }
        fired
    }

    fn observe_liveness(&mut self, snapshot: &MetricsSnapshot, now: Instant) {
        for (service, alive) in &snapshot.service_liveness {
            if !alive {
                self.failures.entry(service.clone()).or_default().push_back(now);
            }
        }

        let keep = self
            .rules
            .values()
            .filter_map(|r| match r.condition {
                TriggerCondition::ServiceFailure { window } => Some(window),
                _ => None,
            })
            .max()
            .unwrap_or(DEFAULT_FAILURE_WINDOW);
        for seen in self.failures.values_mut() {
            while seen
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) > keep)
            {
                seen.pop_front();
            }
        }
        self.failures.retain(|_, seen| !seen.is_empty());
    }

    #[allow(clippy::cast_precision_loss)]
    fn holds(&self, rule: &TriggerRule, snapshot: &MetricsSnapshot, now: Instant) -> bool {
        match &rule.condition {
            TriggerCondition::HighErrorRate => snapshot.error_ratio > rule.threshold,
            TriggerCondition::ServiceFailure { window } => self.failures.values().any(|seen| {
                let recent = seen
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) <= *window)
                    .count();
                recent as f64 > rule.threshold
            }),
            TriggerCondition::PerformanceDegradation => {
                snapshot.response_time_seconds > rule.threshold
            }
            TriggerCondition::ResourceExhaustion { cpu, memory, disk } => {
                snapshot.cpu_percent > *cpu
                    || snapshot.memory_percent > *memory
                    || snapshot.disk_percent > *disk
            }
            TriggerCondition::Custom(predicate) => predicate(snapshot, rule.threshold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot::default()
    }

    fn names(fired: &BTreeSet<String>) -> Vec<&str> {
        fired.iter().map(String::as_str).collect()
    }

    #[test]
    fn error_rate_threshold_is_exclusive() {
        let mut evaluator = TriggerEvaluator::with_rules([TriggerRule::high_error_rate()]);
        let mut s = snapshot();
        s.error_ratio = 0.10;
        assert!(evaluator.evaluate(&s).is_empty());
        s.error_ratio = 0.11;
        assert_eq!(names(&evaluator.evaluate(&s)), vec![HIGH_ERROR_RATE]);
    }

    #[test]
    fn cooldown_suppresses_refire() {
        let mut evaluator = TriggerEvaluator::with_rules([
            TriggerRule::high_error_rate().with_cooldown(Duration::from_secs(300))
        ]);
        let mut s = snapshot();
        s.error_ratio = 0.5;

        let t0 = Instant::now();
        assert_eq!(evaluator.evaluate_at(&s, t0).len(), 1);
        assert!(evaluator.evaluate_at(&s, t0 + Duration::from_secs(10)).is_empty());
        assert!(evaluator.evaluate_at(&s, t0 + Duration::from_secs(299)).is_empty());
        assert_eq!(evaluator.evaluate_at(&s, t0 + Duration::from_secs(300)).len(), 1);
    }

    #[test]
    fn disabled_rules_never_fire() {
        let mut evaluator =
            TriggerEvaluator::with_rules([TriggerRule::performance_degradation().enabled(false)]);
        let mut s = snapshot();
        s.response_time_seconds = 60.0;
        assert!(evaluator.evaluate(&s).is_empty());
    }

    #[test]
    fn resource_exhaustion_is_any_of_three() {
        let mut evaluator = TriggerEvaluator::with_rules([TriggerRule::resource_exhaustion()]);
        let mut s = snapshot();
        s.disk_percent = 96.0;
        assert_eq!(names(&evaluator.evaluate(&s)), vec![RESOURCE_EXHAUSTION]);

        let mut evaluator = TriggerEvaluator::with_rules([TriggerRule::resource_exhaustion()]);
        s.disk_percent = 50.0;
        s.cpu_percent = 90.0;
        assert!(evaluator.evaluate(&s).is_empty());
        s.memory_percent = 90.5;
        assert_eq!(evaluator.evaluate(&s).len(), 1);
    }

    #[test]
    fn service_failure_needs_more_than_max_failures_in_window() {
        let mut evaluator = TriggerEvaluator::with_rules([TriggerRule::service_failure()]);
        let mut down = snapshot();
        down.service_liveness.insert("api".to_string(), false);
        down.service_liveness.insert("db".to_string(), true);

        let t0 = Instant::now();
        for i in 0..3 {
            assert!(evaluator.evaluate_at(&down, t0 + Duration::from_secs(i)).is_empty());
        }
        assert_eq!(
            names(&evaluator.evaluate_at(&down, t0 + Duration::from_secs(3))),
            vec![SERVICE_FAILURE]
        );
    }

    #[test]
    fn service_failures_age_out_of_window() {
        let mut evaluator = TriggerEvaluator::with_rules([TriggerRule::service_failure()]);
        let mut down = snapshot();
        down.service_liveness.insert("api".to_string(), false);

        let t0 = Instant::now();
        for i in 0..3 {
            evaluator.evaluate_at(&down, t0 + Duration::from_secs(i));
        }
        // first three observations are older than the 300s window by now
        assert!(evaluator.evaluate_at(&down, t0 + Duration::from_secs(400)).is_empty());
    }

    #[test]
    fn custom_predicate_gets_threshold() {
        let rule = TriggerRule::custom("hot", 70.0, |s, t| s.cpu_percent > t);
        let mut evaluator = TriggerEvaluator::with_rules([rule]);
        let mut s = snapshot();
        s.cpu_percent = 71.0;
        assert_eq!(names(&evaluator.evaluate(&s)), vec!["hot"]);
    }

    #[test]
    fn reload_keeps_last_fired_for_surviving_rules() {
        let mut evaluator = TriggerEvaluator::with_rules([
            TriggerRule::high_error_rate().with_cooldown(Duration::from_secs(60)),
            TriggerRule::performance_degradation(),
        ]);
        let mut s = snapshot();
        s.error_ratio = 1.0;
        let t0 = Instant::now();
        evaluator.evaluate_at(&s, t0);
        assert!(evaluator.last_fired(HIGH_ERROR_RATE).is_some());

        evaluator.reload([TriggerRule::high_error_rate().with_cooldown(Duration::from_secs(60))]);
        assert!(evaluator.rule(PERFORMANCE_DEGRADATION).is_none());
        assert!(evaluator.evaluate_at(&s, t0 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn config_rules_map_thresholds_and_strategies() {
        let mut rules = IndexMap::new();
        rules.insert(
            RESOURCE_EXHAUSTION.to_string(),
            RuleConfig {
                enabled: true,
                threshold: 80.0,
                cooldown_seconds: 0.0,
                time_window_seconds: None,
                cpu_threshold: None,
                memory_threshold: Some(70.0),
                disk_threshold: None,
                strategy: None,
            },
        );
        rules.insert(
            "gremlins".to_string(),
            RuleConfig {
                enabled: true,
                threshold: 1.0,
                cooldown_seconds: 0.0,
                time_window_seconds: None,
                cpu_threshold: None,
                memory_threshold: None,
                disk_threshold: None,
                strategy: Some(RollbackStrategy::Data),
            },
        );

        let built = rules_from_config(&rules);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].strategy, RollbackStrategy::FullSystem);
        match built[0].condition {
            TriggerCondition::ResourceExhaustion { cpu, memory, disk } => {
                assert!((cpu - 80.0).abs() < f64::EPSILON);
                assert!((memory - 70.0).abs() < f64::EPSILON);
                assert!((disk - 80.0).abs() < f64::EPSILON);
            }
            ref other => panic!("unexpected condition {other:?}"),
        }
    }

    #[test]
    fn default_strategies() {
        assert_eq!(default_strategy(HIGH_ERROR_RATE), RollbackStrategy::Service);
        assert_eq!(default_strategy(SERVICE_FAILURE), RollbackStrategy::Service);
        assert_eq!(
            default_strategy(PERFORMANCE_DEGRADATION),
            RollbackStrategy::Configuration
        );
        assert_eq!(default_strategy(RESOURCE_EXHAUSTION), RollbackStrategy::FullSystem);
    }
}
