//! Metrics sources feeding the trigger evaluator and rollback validation

use crate::error::MetricsError;
use futures::future::join_all;
use parking_lot::Mutex;
use rvm_core::{MetricsSettings, MetricsSnapshot};
use rvm_startup::ProbeRegistry;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::time::Instant;

/// Produces point-in-time health snapshots
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn snapshot(&self) -> Result<MetricsSnapshot, MetricsError>;
}

/// Local node metrics
///
/// CPU and memory come from sysinfo; disk usage is that of the configured
/// mount. Response time and error ratio come from timing a GET against the
/// health URL, with the error ratio taken over the last `error_window`
/// checks. Liveness reuses the startup probes of `liveness_services`.
///
/// CPU usage is a delta between two refreshes. The first refresh happens
/// in [`SystemMetricsSource::new`], and a snapshot taken sooner than
/// `MINIMUM_CPU_UPDATE_INTERVAL` after the previous one waits out the rest.
pub struct SystemMetricsSource {
    settings: MetricsSettings,
    probes: Arc<ProbeRegistry>,
    client: reqwest::Client,
    cpu: Arc<Mutex<CpuSampler>>,
    outcomes: Mutex<VecDeque<bool>>,
}

impl std::fmt::Debug for SystemMetricsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMetricsSource")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SystemMetricsSource {
    /// # Errors
    /// `MetricsError::Http` if the HTTP client cannot be built.
    pub fn new(settings: MetricsSettings, probes: Arc<ProbeRegistry>) -> Result<Self, MetricsError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        let capacity = settings.error_window.max(1);
        Ok(Self {
            settings,
            probes,
            client,
            cpu: Arc::new(Mutex::new(CpuSampler::primed())),
            outcomes: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    async fn resources(&self) -> Result<(f64, f64, f64), MetricsError> {
        let sampler = Arc::clone(&self.cpu);
        let mount = self.settings.disk_mount.clone();
        tokio::task::spawn_blocking(move || {
            let mut sampler = sampler.lock();
            let cpu = sampler.sample();
            let system = &mut sampler.system;
            system.refresh_memory();
            let memory = percent(system.used_memory(), system.total_memory());
            (cpu, memory, disk_usage(&mount))
        })
        .await
        .map_err(|e| MetricsError::Task(e.to_string()))
    }

    /// Time one health check and fold it into the error window
    async fn health(&self) -> (f64, f64) {
        let Some(url) = &self.settings.health_url else {
            return (0.0, 0.0);
        };

        let started = Instant::now();
        let ok = match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "health check failed");
                false
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(ok);
        while outcomes.len() > self.settings.error_window.max(1) {
            outcomes.pop_front();
        }
        (elapsed, error_ratio(&outcomes))
    }

    async fn liveness(&self) -> BTreeMap<String, bool> {
        let timeout = self.settings.request_timeout();
        let checks = self.settings.liveness_services.iter().map(|service| async move {
            let outcome = self.probes.check(service, timeout).await;
            (service.clone(), outcome.is_ready())
        });
        join_all(checks).await.into_iter().collect()
    }
}

#[async_trait::async_trait]
impl MetricsSource for SystemMetricsSource {
    async fn snapshot(&self) -> Result<MetricsSnapshot, MetricsError> {
        let (cpu_percent, memory_percent, disk_percent) = self.resources().await?;
        let (response_time_seconds, error_ratio) = self.health().await;
        let service_liveness = self.liveness().await;

        let snapshot = MetricsSnapshot {
            cpu_percent,
            memory_percent,
            disk_percent,
            response_time_seconds,
            service_liveness,
            error_ratio,
        };
        tracing::debug!(?snapshot, "collected metrics");
        Ok(snapshot)
    }
}

struct CpuSampler {
    system: System,
    refreshed: std::time::Instant,
}

impl CpuSampler {
    fn primed() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system,
            refreshed: std::time::Instant::now(),
        }
    }

    /// Global CPU percent since the previous refresh
    fn sample(&mut self) -> f64 {
        let wait = settle_time(self.refreshed.elapsed());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        self.system.refresh_cpu_usage();
        self.refreshed = std::time::Instant::now();
        f64::from(self.system.global_cpu_usage())
    }
}

/// How much longer to wait before a CPU refresh yields a real delta
fn settle_time(since_refresh: Duration) -> Duration {
    MINIMUM_CPU_UPDATE_INTERVAL.saturating_sub(since_refresh)
}

#[allow(clippy::cast_precision_loss)]
fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn error_ratio(outcomes: &VecDeque<bool>) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let failures = outcomes.iter().filter(|ok| !**ok).count();
    failures as f64 / outcomes.len() as f64
}

/// Usage of the disk mounted at the longest prefix of `mount`
fn disk_usage(mount: &Path) -> f64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| mount.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map_or(0.0, |disk| {
            let total = disk.total_space();
            percent(total.saturating_sub(disk.available_space()), total)
        })
}
