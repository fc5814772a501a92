//! Testing utilities for the RVM workspace
//!
//! Scripted probes, an in-memory backup store, a settable metrics source
//! and a service controller that records what it was asked to do.

#![allow(missing_docs)]

use parking_lot::Mutex;
use rvm_core::{
    ControlError, MetricsSnapshot, RollbackSettings, RollbackStrategy, RollbackTarget,
    ServiceController,
};
use rvm_rollback::{BackupError, BackupStore, MetricsError, MetricsSource};
use rvm_startup::{ProbeError, ReadinessProbe, StepDescriptor};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted probe does on one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStep {
    Ready,
    NotReady,
    Fail(String),
    /// Sleep far past any sensible timeout
    Hang,
    Panic,
}

/// Probe that plays back a script; the last step repeats
#[derive(Debug)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeStep>>,
    last: Mutex<ProbeStep>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(script: impl IntoIterator<Item = ProbeStep>) -> Arc<Self> {
        let script: VecDeque<ProbeStep> = script.into_iter().collect();
        let last = script.back().cloned().unwrap_or(ProbeStep::Ready);
        Arc::new(Self {
            script: Mutex::new(script),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn ready() -> Arc<Self> {
        Self::new([ProbeStep::Ready])
    }

    pub fn not_ready() -> Arc<Self> {
        Self::new([ProbeStep::NotReady])
    }

    pub fn hanging() -> Arc<Self> {
        Self::new([ProbeStep::Hang])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ProbeStep {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(step) => step,
            None => self.last.lock().clone(),
        }
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        match self.next_step() {
            ProbeStep::Ready => Ok(true),
            ProbeStep::NotReady => Ok(false),
            ProbeStep::Fail(message) => Err(ProbeError::Invalid(message)),
            ProbeStep::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(true)
            }
            ProbeStep::Panic => panic!("scripted probe panic"),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Probe whose answer is flipped from the test
#[derive(Debug, Default)]
pub struct FlagProbe {
    ready: AtomicBool,
}

impl FlagProbe {
    pub fn new(ready: bool) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(ready),
        })
    }

    pub fn set(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for FlagProbe {
    async fn check(&self) -> Result<bool, ProbeError> {
        Ok(self.ready.load(Ordering::SeqCst))
    }
}

/// Snapshot contents: relative path → file body
pub type SnapshotFiles = BTreeMap<PathBuf, String>;

/// Backup store holding snapshots in memory
#[derive(Debug, Default)]
pub struct InMemoryBackupStore {
    snapshots: Mutex<BTreeMap<String, Vec<(String, SnapshotFiles)>>>,
    unavailable: AtomicBool,
    restores: AtomicUsize,
}

impl InMemoryBackupStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a snapshot; later additions are newer
    pub fn add_snapshot<P, B>(&self, category: &str, name: &str, files: impl IntoIterator<Item = (P, B)>)
    where
        P: Into<PathBuf>,
        B: Into<String>,
    {
        let files = files
            .into_iter()
            .map(|(p, b)| (p.into(), b.into()))
            .collect();
        self.snapshots
            .lock()
            .entry(category.to_string())
            .or_default()
            .push((name.to_string(), files));
    }

    /// Make every call fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BackupError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BackupError::Unavailable("in-memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }

    fn latest(&self, category: &str) -> Option<(String, SnapshotFiles)> {
        self.snapshots.lock().get(category).and_then(|s| s.last().cloned())
    }
}

#[async_trait::async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn has_snapshot(&self, category: &str) -> Result<bool, BackupError> {
        self.check_available()?;
        Ok(self.latest(category).is_some())
    }

    async fn latest_snapshot(&self, category: &str) -> Result<Option<String>, BackupError> {
        self.check_available()?;
        Ok(self.latest(category).map(|(name, _)| name))
    }

    async fn restore_latest(&self, category: &str, destination: &Path) -> Result<String, BackupError> {
        self.check_available()?;
        let (name, files) = self
            .latest(category)
            .ok_or_else(|| BackupError::NotFound(category.to_string()))?;

        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| BackupError::Io { path, source }
        };
        if destination.exists() {
            std::fs::remove_dir_all(destination).map_err(io(destination))?;
        }
        std::fs::create_dir_all(destination).map_err(io(destination))?;
        for (relative, body) in &files {
            let path = destination.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(io(parent))?;
            }
            std::fs::write(&path, body).map_err(io(&path))?;
        }
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(name)
    }
}

/// Metrics source returning whatever the test last set
#[derive(Debug, Default)]
pub struct StaticMetricsSource {
    snapshot: Mutex<MetricsSnapshot>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
}

impl StaticMetricsSource {
    pub fn new(snapshot: MetricsSnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(snapshot),
            ..Self::default()
        })
    }

    /// Everything idle and healthy
    pub fn healthy() -> Arc<Self> {
        Self::new(MetricsSnapshot {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            disk_percent: 30.0,
            response_time_seconds: 0.05,
            ..MetricsSnapshot::default()
        })
    }

    pub fn set(&self, snapshot: MetricsSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        f(&mut self.snapshot.lock());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn snapshot(&self) -> Result<MetricsSnapshot, MetricsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MetricsError::Unavailable("static source switched off".to_string()));
        }
        Ok(self.snapshot.lock().clone())
    }
}

/// Service controller that records `(verb, service)` calls
#[derive(Debug, Default)]
pub struct RecordingController {
    calls: Mutex<Vec<(String, String)>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call for `service` fails from now on
    pub fn fail_on(&self, service: &str) {
        self.failing.lock().push(service.to_string());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    fn record(&self, verb: &str, service: &str) -> Result<(), ControlError> {
        self.calls.lock().push((verb.to_string(), service.to_string()));
        if self.failing.lock().iter().any(|s| s == service) {
            return Err(ControlError::CommandFailed {
                verb: verb.to_string(),
                service: service.to_string(),
                code: Some(1),
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServiceController for RecordingController {
    async fn start(&self, service: &str) -> Result<(), ControlError> {
        self.record("start", service)
    }

    async fn stop(&self, service: &str) -> Result<(), ControlError> {
        self.record("stop", service)
    }

    async fn restart(&self, service: &str) -> Result<(), ControlError> {
        self.record("restart", service)
    }
}

/// Critical step with a one second timeout
pub fn step(name: &str, dependencies: &[&str]) -> StepDescriptor {
    StepDescriptor::new(name, dependencies.iter().copied()).timeout(Duration::from_secs(1))
}

/// Rollback settings with one target per non-composite strategy under
/// `root`, validated for config syntax but not for services
pub fn rollback_settings(root: &Path) -> RollbackSettings {
    let mut settings = RollbackSettings {
        backup_root: root.join("backups"),
        scratch_dir: root.join("scratch"),
        validation_timeout_seconds: 1.0,
        ..RollbackSettings::default()
    };
    for strategy in RollbackStrategy::FULL_SYSTEM_CHAIN {
        settings.targets.insert(
            strategy.as_str().to_string(),
            RollbackTarget {
                category: category_for(strategy).to_string(),
                destination: root.join("live").join(strategy.as_str()),
                services: Vec::new(),
                validate_config: true,
            },
        );
    }
    settings
}

/// Backup category used by [`rollback_settings`] for a strategy
pub fn category_for(strategy: RollbackStrategy) -> &'static str {
    match strategy {
        RollbackStrategy::Configuration => "config",
        RollbackStrategy::Service => "services",
        RollbackStrategy::Data => "data",
        RollbackStrategy::FullSystem => "full",
    }
}
