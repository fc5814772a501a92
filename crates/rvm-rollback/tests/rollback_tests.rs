use pretty_assertions::assert_eq;
use rvm_core::{HistoryLog, MetricsSnapshot, RollbackRecord, RollbackStatus, RollbackStrategy};
use rvm_rollback::{DirectoryBackupStore, RollbackContext, RollbackCoordinator};
use rvm_startup::ProbeRegistry;
use rvm_test_utils::{
    category_for, rollback_settings, InMemoryBackupStore, RecordingController, ScriptedProbe,
    StaticMetricsSource,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

struct Fixture {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    store: Arc<InMemoryBackupStore>,
    metrics: Arc<StaticMetricsSource>,
    controller: Arc<RecordingController>,
    coordinator: RollbackCoordinator,
}

fn fixture_with(configure: impl FnOnce(&mut rvm_core::RollbackSettings, &mut ProbeRegistry)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut settings = rollback_settings(&root);
    let mut probes = ProbeRegistry::new();
    configure(&mut settings, &mut probes);

    let store = InMemoryBackupStore::new();
    let metrics = StaticMetricsSource::healthy();
    let controller = RecordingController::new();
    let context = RollbackContext {
        store: store.clone(),
        controller: controller.clone(),
        metrics: metrics.clone(),
        probes: Arc::new(probes),
    };
    let coordinator = RollbackCoordinator::new(settings, context, Arc::new(HistoryLog::in_memory(100)));
    Fixture {
        _dir: dir,
        root,
        store,
        metrics,
        controller,
        coordinator,
    }
}

fn fixture() -> Fixture {
    fixture_with(|_, _| {})
}

fn live(root: &Path, strategy: RollbackStrategy) -> std::path::PathBuf {
    root.join("live").join(strategy.as_str())
}

fn seed_all(store: &InMemoryBackupStore) {
    for strategy in RollbackStrategy::FULL_SYSTEM_CHAIN {
        store.add_snapshot(
            category_for(strategy),
            "20240101T000000Z",
            [("settings.json", r#"{"mode": "known-good"}"#)],
        );
    }
}

#[tokio::test]
async fn test_no_backup_fails_without_touching_state() {
    let f = fixture();
    let destination = live(&f.root, RollbackStrategy::Configuration);
    fs::create_dir_all(&destination).unwrap();
    fs::write(destination.join("settings.json"), "{\"mode\": \"current\"}").unwrap();

    let record = f.coordinator.rollback(RollbackStrategy::Configuration, "manual").await;

    assert_eq!(record.status, RollbackStatus::Failed);
    assert!(record.details.contains("NoBackupAvailableError"));
    assert_eq!(
        fs::read_to_string(destination.join("settings.json")).unwrap(),
        "{\"mode\": \"current\"}"
    );
    assert!(!f.root.join("scratch").exists());
    assert_eq!(f.store.restores(), 0);
    assert_eq!(f.coordinator.records().len(), 1);
}

#[tokio::test]
async fn test_restore_preserves_previous_state() {
    let f = fixture();
    seed_all(&f.store);
    let destination = live(&f.root, RollbackStrategy::Configuration);
    fs::create_dir_all(&destination).unwrap();
    fs::write(destination.join("settings.json"), "{\"mode\": \"broken\"}").unwrap();
    fs::write(destination.join("extra.json"), "{}").unwrap();

    let record = f.coordinator.rollback(RollbackStrategy::Configuration, "high_error_rate").await;

    assert!(record.succeeded(), "{}", record.details);
    assert_eq!(record.trigger_name, "high_error_rate");
    assert_eq!(record.snapshot.as_deref(), Some("20240101T000000Z"));
    assert!(!destination.join("extra.json").exists());

    let scratch = record.scratch_path.unwrap();
    assert!(scratch.starts_with(f.root.join("scratch").join("configuration")));
    assert_eq!(
        fs::read_to_string(scratch.join("settings.json")).unwrap(),
        "{\"mode\": \"broken\"}"
    );
}

#[tokio::test]
async fn test_rollback_is_idempotent() {
    let f = fixture();
    seed_all(&f.store);
    let destination = live(&f.root, RollbackStrategy::Data);

    let first = f.coordinator.rollback(RollbackStrategy::Data, "manual").await;
    let after_first = fs::read_to_string(destination.join("settings.json")).unwrap();
    let second = f.coordinator.rollback(RollbackStrategy::Data, "manual").await;
    let after_second = fs::read_to_string(destination.join("settings.json")).unwrap();

    assert!(first.succeeded());
    assert!(second.succeeded());
    assert_eq!(after_first, after_second);
    assert_eq!(fs::read_dir(&destination).unwrap().count(), 1);

    let statuses: Vec<RollbackStatus> = f.coordinator.records().iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![RollbackStatus::Success, RollbackStatus::Success]);
}

#[tokio::test]
async fn test_invalid_config_fails_validation() {
    let f = fixture();
    f.store.add_snapshot(
        category_for(RollbackStrategy::Configuration),
        "20240101T000000Z",
        [("app.toml", "port = ")],
    );
    let destination = live(&f.root, RollbackStrategy::Configuration);
    fs::create_dir_all(&destination).unwrap();
    fs::write(destination.join("app.toml"), "port = 8080\n").unwrap();

    let record = f.coordinator.rollback(RollbackStrategy::Configuration, "manual").await;
    assert_eq!(record.status, RollbackStatus::Failed);
    assert!(record.details.starts_with("ValidationError"));
    assert!(record.details.contains("app.toml"));
    // the copy itself happened
    assert_eq!(f.store.restores(), 1);
    assert_eq!(record.snapshot.as_deref(), Some("20240101T000000Z"));

    // the state before the attempt is still reachable from the record
    let scratch = record.scratch_path.clone().unwrap();
    assert!(record.details.contains(&scratch.display().to_string()));
    assert_eq!(fs::read_to_string(scratch.join("app.toml")).unwrap(), "port = 8080\n");
    assert_eq!(f.coordinator.records(), vec![record]);
}

#[tokio::test]
async fn test_failed_restart_keeps_scratch_path() {
    let f = fixture_with(|settings, _| {
        settings.targets["service"].services = vec!["api".to_string()];
    });
    seed_all(&f.store);
    f.controller.fail_on("api");
    let destination = live(&f.root, RollbackStrategy::Service);
    fs::create_dir_all(&destination).unwrap();
    fs::write(destination.join("unit.json"), "{}").unwrap();

    let record = f.coordinator.rollback(RollbackStrategy::Service, "manual").await;
    assert_eq!(record.status, RollbackStatus::Failed);
    let scratch = record.scratch_path.unwrap();
    assert!(scratch.join("unit.json").is_file());
}

#[tokio::test]
async fn test_full_system_details_name_scratch_copies() {
    let f = fixture();
    seed_all(&f.store);
    for strategy in RollbackStrategy::FULL_SYSTEM_CHAIN {
        let destination = live(&f.root, strategy);
        fs::create_dir_all(&destination).unwrap();
        fs::write(destination.join("settings.json"), "{}").unwrap();
    }
    f.metrics.update(|s| s.cpu_percent = 99.0);

    let record = f.coordinator.rollback(RollbackStrategy::FullSystem, "manual").await;
    assert_eq!(record.status, RollbackStatus::Failed);
    let scratch = f.root.join("scratch").join("configuration");
    assert!(record.details.starts_with("configuration: failed: ValidationError"));
    assert!(record.details.contains(&format!("previous state saved to {}", scratch.display())));
}

#[tokio::test]
async fn test_old_scratch_copies_are_pruned() {
    let f = fixture_with(|settings, _| settings.scratch_keep = 2);
    seed_all(&f.store);
    let destination = live(&f.root, RollbackStrategy::Data);
    fs::create_dir_all(&destination).unwrap();
    fs::write(destination.join("settings.json"), "{}").unwrap();

    let mut kept = Vec::new();
    for _ in 0..4 {
        let record = f.coordinator.rollback(RollbackStrategy::Data, "manual").await;
        assert!(record.succeeded(), "{}", record.details);
        kept.push(record.scratch_path.unwrap());
    }

    let mut remaining: Vec<_> = fs::read_dir(f.root.join("scratch").join("data"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    remaining.sort();
    assert_eq!(remaining, kept[2..].to_vec());
}

#[tokio::test]
async fn test_resource_sanity_check() {
    let f = fixture();
    seed_all(&f.store);
    f.metrics.update(|s| s.disk_percent = 99.5);

    let record = f.coordinator.rollback(RollbackStrategy::Data, "manual").await;
    assert_eq!(record.status, RollbackStatus::Failed);
    assert!(record.details.contains("disk usage"));
}

#[tokio::test]
async fn test_metrics_unreachable_is_a_failed_record() {
    let f = fixture();
    seed_all(&f.store);
    f.metrics.set_unavailable(true);

    let record = f.coordinator.rollback(RollbackStrategy::Data, "manual").await;
    assert_eq!(record.status, RollbackStatus::Failed);
    assert!(record.details.starts_with("MetricsError"));
}

#[tokio::test]
async fn test_service_strategy_restarts_and_probes() {
    let api = ScriptedProbe::ready();
    let probe = api.clone();
    let f = fixture_with(move |settings, probes| {
        settings.targets["service"].services = vec!["api".to_string()];
        probes.register("api", probe);
    });
    seed_all(&f.store);

    let record = f.coordinator.rollback(RollbackStrategy::Service, "service_failure").await;
    assert!(record.succeeded(), "{}", record.details);
    assert_eq!(
        f.controller.calls(),
        vec![("restart".to_string(), "api".to_string())]
    );
    assert_eq!(api.calls(), 1);
}

#[tokio::test]
async fn test_unhealthy_service_fails_validation() {
    let f = fixture_with(|settings, probes| {
        settings.targets["service"].services = vec!["api".to_string()];
        probes.register("api", ScriptedProbe::not_ready());
    });
    seed_all(&f.store);

    let record = f.coordinator.rollback(RollbackStrategy::Service, "manual").await;
    assert_eq!(record.status, RollbackStatus::Failed);
    assert!(record.details.contains("service api health check"));
}

#[tokio::test]
async fn test_full_system_runs_chain_in_order() {
    let f = fixture();
    seed_all(&f.store);

    let record = f.coordinator.rollback(RollbackStrategy::FullSystem, "resource_exhaustion").await;
    assert!(record.succeeded(), "{}", record.details);
    assert_eq!(record.rollback_type, RollbackStrategy::FullSystem);

    let order: Vec<usize> = ["configuration:", "service:", "data:"]
        .iter()
        .map(|p| record.details.find(p).unwrap())
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(f.store.restores(), 3);
    // one composite record
    assert_eq!(f.coordinator.records().len(), 1);
}

#[tokio::test]
async fn test_full_system_stops_at_first_failure() {
    let f = fixture();
    f.store.add_snapshot(
        category_for(RollbackStrategy::Configuration),
        "20240101T000000Z",
        [("settings.json", "{}")],
    );
    // no snapshot for the service category
    f.store.add_snapshot(
        category_for(RollbackStrategy::Data),
        "20240101T000000Z",
        [("settings.json", "{}")],
    );

    let record = f.coordinator.rollback(RollbackStrategy::FullSystem, "manual").await;
    assert_eq!(record.status, RollbackStatus::Failed);
    assert!(record.details.contains("configuration: success"));
    assert!(record.details.contains("service: failed: NoBackupAvailableError"));
    assert!(!record.details.contains("data:"));
    assert_eq!(f.store.restores(), 1);
    assert!(!live(&f.root, RollbackStrategy::Data).exists());
}

#[tokio::test]
async fn test_missing_target() {
    let f = fixture_with(|settings, _| {
        settings.targets.shift_remove("data");
    });
    let record = f.coordinator.rollback(RollbackStrategy::Data, "manual").await;
    assert_eq!(record.status, RollbackStatus::Failed);
    assert!(record.details.starts_with("MissingTargetError"));
}

#[tokio::test]
async fn test_directory_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut settings = rollback_settings(root);
    settings.targets["configuration"].category = "config".to_string();

    let snapshot = root.join("backups/config/20240501T000000Z");
    fs::create_dir_all(snapshot.join("conf.d")).unwrap();
    fs::write(snapshot.join("conf.d/rvm.yaml"), "mode: known-good\n").unwrap();

    let history_path = root.join("history/rollback_history.json");
    let history: Arc<HistoryLog<RollbackRecord>> =
        Arc::new(HistoryLog::open(&history_path, 10).unwrap());
    let context = RollbackContext {
        store: Arc::new(DirectoryBackupStore::new(root.join("backups"))),
        controller: RecordingController::new(),
        metrics: StaticMetricsSource::new(MetricsSnapshot::default()),
        probes: Arc::new(ProbeRegistry::new()),
    };
    let coordinator = RollbackCoordinator::new(settings, context, history);

    let record = coordinator.rollback(RollbackStrategy::Configuration, "manual").await;
    assert!(record.succeeded(), "{}", record.details);
    assert_eq!(
        fs::read_to_string(root.join("live/configuration/conf.d/rvm.yaml")).unwrap(),
        "mode: known-good\n"
    );

    let reopened: HistoryLog<RollbackRecord> = HistoryLog::open(&history_path, 10).unwrap();
    assert_eq!(reopened.records(), vec![record]);
}
