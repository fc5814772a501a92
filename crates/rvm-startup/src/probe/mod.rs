//! Readiness probes
//!
//! A probe answers "does this step's precondition hold right now" without
//! changing anything. Probes are looked up by step name in a typed
//! registry that is filled once, at configuration time, so a step without
//! a probe is caught before any run starts.
//!
//! Every check runs on its own tokio task under a timeout. A probe that
//! hangs is aborted and reported as `TimedOut`; a probe that panics is
//! reported as `Errored`. Neither can stall the coordinator.

mod builtin;

pub use builtin::{FileExistsProbe, FnProbe, HttpGetProbe, ProcessProbe, TcpPortProbe};

use crate::error::ProbeError;
use indexmap::IndexMap;
use rvm_core::{ProbeSpec, StepConfig};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Side-effect-free readiness check
#[async_trait::async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// `Ok(true)` when ready, `Ok(false)` when not (yet) ready
    async fn check(&self) -> Result<bool, ProbeError>;

    /// Short description for logs
    fn describe(&self) -> String {
        "probe".to_string()
    }
}

/// Result of a bounded probe check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    NotReady,
    TimedOut,
    Errored(String),
}

impl ProbeOutcome {
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::NotReady => f.write_str("not ready"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Errored(e) => write!(f, "error: {e}"),
        }
    }
}

/// Run one probe on its own task, bounded by `timeout`
pub async fn run_probe(probe: Arc<dyn ReadinessProbe>, timeout: Duration) -> ProbeOutcome {
    let handle = tokio::spawn(async move { probe.check().await });
    let abort = handle.abort_handle();

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(true))) => ProbeOutcome::Ready,
        Ok(Ok(Ok(false))) => ProbeOutcome::NotReady,
        Ok(Ok(Err(e))) => ProbeOutcome::Errored(e.to_string()),
        Ok(Err(join)) if join.is_panic() => ProbeOutcome::Errored("probe panicked".to_string()),
        Ok(Err(_)) => ProbeOutcome::Errored("probe task cancelled".to_string()),
        Err(_) => {
            abort.abort();
            ProbeOutcome::TimedOut
        }
    }
}

/// Step name → probe
#[derive(Default, Clone)]
pub struct ProbeRegistry {
    probes: HashMap<String, Arc<dyn ReadinessProbe>>,
}

impl fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.probes.keys().collect();
        names.sort();
        f.debug_struct("ProbeRegistry").field("steps", &names).finish()
    }
}

impl ProbeRegistry {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every configured `ProbeSpec` into a concrete probe
    ///
    /// Steps without a `probe` entry are left out; register them with
    /// [`ProbeRegistry::register`] before building the coordinator.
    ///
    /// # Errors
    /// `ProbeError` if a probe cannot be constructed (e.g. HTTP client).
    pub fn from_steps(steps: &IndexMap<String, StepConfig>) -> Result<Self, ProbeError> {
        let mut registry = Self::new();
        for (name, step) in steps {
            if let Some(spec) = &step.probe {
                registry.register(name.clone(), build_probe(spec)?);
            }
        }
        Ok(registry)
    }

    /// Register (or replace) the probe for `step`
    pub fn register(
        &mut self,
        step: impl Into<String>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Option<Arc<dyn ReadinessProbe>> {
        self.probes.insert(step.into(), probe)
    }

    #[must_use]
    pub fn get(&self, step: &str) -> Option<Arc<dyn ReadinessProbe>> {
        self.probes.get(step).cloned()
    }

    /// Names with a registered probe, in no particular order
    pub fn steps(&self) -> impl Iterator<Item = &str> + '_ {
        self.probes.keys().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, step: &str) -> bool {
        self.probes.contains_key(step)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Check `step` under `timeout`
    pub async fn check(&self, step: &str, timeout: Duration) -> ProbeOutcome {
        match self.get(step) {
            Some(probe) => {
                tracing::debug!(step, probe = %probe.describe(), ?timeout, "running probe");
                run_probe(probe, timeout).await
            }
            None => ProbeOutcome::Errored(format!("no probe registered for {step}")),
        }
    }
}

/// Turn a declarative spec into a probe
///
/// # Errors
/// `ProbeError::Invalid` / `ProbeError::Http` when the spec cannot be built.
pub fn build_probe(spec: &ProbeSpec) -> Result<Arc<dyn ReadinessProbe>, ProbeError> {
    Ok(match spec {
        ProbeSpec::File { path } => Arc::new(FileExistsProbe::new(path.clone())),
        ProbeSpec::Tcp { address } => Arc::new(TcpPortProbe::new(address.clone())?),
        ProbeSpec::Http { url, expect_status } => {
            Arc::new(HttpGetProbe::new(url.clone(), *expect_status)?)
        }
        ProbeSpec::Process { name } => Arc::new(ProcessProbe::new(name.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Hangs(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ReadinessProbe for Hangs {
        async fn check(&self) -> Result<bool, ProbeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            self.0.store(true, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_times_out_and_is_aborted() {
        let finished = Arc::new(AtomicBool::new(false));
        let outcome = run_probe(Arc::new(Hangs(finished.clone())), Duration::from_secs(2)).await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_probe_is_an_error() {
        let probe = FnProbe::new(|| panic!("boom"));
        let outcome = run_probe(Arc::new(probe), Duration::from_secs(1)).await;
        assert_eq!(outcome, ProbeOutcome::Errored("probe panicked".to_string()));
    }

    #[tokio::test]
    async fn unknown_step_is_an_error() {
        let registry = ProbeRegistry::new();
        let outcome = registry.check("ghost", Duration::from_secs(1)).await;
        assert!(matches!(outcome, ProbeOutcome::Errored(_)));
    }

    #[tokio::test]
    async fn registry_resolves_specs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ready");
        let mut steps = IndexMap::new();
        steps.insert(
            "cfg".to_string(),
            StepConfig {
                dependencies: vec![],
                critical: true,
                timeout_seconds: 1.0,
                probe: Some(ProbeSpec::File { path: marker.clone() }),
            },
        );
        steps.insert(
            "manual".to_string(),
            StepConfig {
                dependencies: vec![],
                critical: false,
                timeout_seconds: 1.0,
                probe: None,
            },
        );

        let registry = ProbeRegistry::from_steps(&steps).unwrap();
        assert!(registry.contains("cfg"));
        assert!(!registry.contains("manual"));

        assert_eq!(registry.check("cfg", Duration::from_secs(1)).await, ProbeOutcome::NotReady);
        std::fs::write(&marker, b"").unwrap();
        assert_eq!(registry.check("cfg", Duration::from_secs(1)).await, ProbeOutcome::Ready);
    }
}
