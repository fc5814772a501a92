//! `rvm-orchestrator` command line

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rvm_core::{HistoryLog, OrchestratorConfig, RollbackRecord, RollbackStrategy, StartupReport, MANUAL_TRIGGER};
use rvm_orchestrator::Orchestrator;
use rvm_startup::DependencyGraph;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("rvm-orchestrator")
        .version(rvm_orchestrator::VERSION)
        .about("Startup, trigger monitoring and rollback for RVM edge nodes")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .default_value("orchestrator.toml")
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file (.toml, .yaml, .yml or .json)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(Command::new("order").about("Print startup and shutdown order"))
        .subcommand(Command::new("startup").about("Run the startup sequence once"))
        .subcommand(
            Command::new("rollback")
                .about("Run a rollback strategy now")
                .arg(
                    Arg::new("strategy")
                        .required(true)
                        .value_parser(value_parser!(RollbackStrategy))
                        .help("configuration, service, data or full_system"),
                )
                .arg(
                    Arg::new("trigger")
                        .long("trigger")
                        .default_value(MANUAL_TRIGGER)
                        .help("Trigger name recorded in the history"),
                ),
        )
        .subcommand(
            Command::new("monitor")
                .about("Run startup, then evaluate triggers until interrupted")
                .arg(
                    Arg::new("skip-startup")
                        .long("skip-startup")
                        .action(ArgAction::SetTrue)
                        .help("Start monitoring without running the startup sequence"),
                ),
        )
        .subcommand(Command::new("shutdown").about("Stop services in shutdown order"))
        .subcommand(
            Command::new("history")
                .about("Show recorded startup reports or rollback records")
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .default_value("rollback")
                        .value_parser(["startup", "rollback"]),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(global_flag(&matches, "log-json"));

    match run(&matches).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            ExitCode::from(2)
        }
    }
}

// globals are propagated down into the subcommand's matches
fn global_flag(matches: &ArgMatches, id: &str) -> bool {
    matches.get_flag(id) || matches.subcommand().is_some_and(|(_, args)| args.get_flag(id))
}

async fn run(matches: &ArgMatches) -> anyhow::Result<ExitCode> {
    let Some((command, args)) = matches.subcommand() else {
        anyhow::bail!("no command given");
    };
    let config_path = args
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("orchestrator.toml"));
    let config_path = config_path.as_path();

    match command {
        "order" => {
            let config = OrchestratorConfig::load(config_path)?;
            let graph = DependencyGraph::from_steps(&config.steps)?;
            println!("startup:  {}", graph.startup_order().join(" -> "));
            println!("shutdown: {}", graph.shutdown_order().join(" -> "));
            Ok(ExitCode::SUCCESS)
        }
        "startup" => {
            let orchestrator = load(config_path)?;
            let report = orchestrator.run_startup(&CancellationToken::new()).await;
            print_report(&report);
            Ok(exit_code(report.overall_success))
        }
        "rollback" => {
            let strategy = args
                .get_one::<RollbackStrategy>("strategy")
                .copied()
                .context("strategy is required")?;
            let trigger = args
                .get_one::<String>("trigger")
                .map_or(MANUAL_TRIGGER, String::as_str);

            let orchestrator = load(config_path)?;
            let record = orchestrator.rollback_now(strategy, trigger).await;
            print_record(&record);
            Ok(exit_code(record.succeeded()))
        }
        "monitor" => monitor(config_path, args.get_flag("skip-startup")).await,
        "shutdown" => {
            let orchestrator = load(config_path)?;
            let outcomes = orchestrator.shutdown_services().await;
            for outcome in &outcomes {
                match &outcome.error {
                    None => println!("{:<24} stopped", outcome.service),
                    Some(e) => println!("{:<24} FAILED: {e}", outcome.service),
                }
            }
            Ok(exit_code(outcomes.iter().all(|o| o.succeeded())))
        }
        "history" => {
            let json = args.get_flag("json");
            let kind = args.get_one::<String>("kind").map_or("rollback", String::as_str);
            history(config_path, kind, json)?;
            Ok(ExitCode::SUCCESS)
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn load(path: &Path) -> anyhow::Result<Orchestrator> {
    Orchestrator::from_config_path(path)
        .with_context(|| format!("cannot set up orchestrator from {}", path.display()))
}

async fn monitor(config_path: &Path, skip_startup: bool) -> anyhow::Result<ExitCode> {
    let orchestrator = load(config_path)?;
    let cancel = CancellationToken::new();

    if !skip_startup {
        let startup = orchestrator.run_startup(&cancel);
        tokio::pin!(startup);
        let report = tokio::select! {
            report = &mut startup => report,
            _ = tokio::signal::ctrl_c() => {
                // the running step finishes, the rest are skipped and recorded
                tracing::warn!("interrupted during startup");
                cancel.cancel();
                print_report(&startup.await);
                return Ok(ExitCode::from(130));
            }
        };
        print_report(&report);
        if !report.overall_success {
            tracing::error!("startup failed, not starting the trigger monitor");
            return Ok(ExitCode::FAILURE);
        }
    }

    let handle = orchestrator.monitor().spawn();
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for ctrl-c")?;
    tracing::info!("interrupt received, stopping trigger monitor");
    handle.shutdown().await.context("trigger monitor task failed")?;
    Ok(ExitCode::SUCCESS)
}

fn history(config_path: &Path, kind: &str, json: bool) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(config_path)?;
    let settings = &config.orchestrator;

    if kind == "startup" {
        let log: HistoryLog<StartupReport> =
            HistoryLog::open(settings.startup_history_path(), settings.history_max_entries)?;
        let reports = log.records();
        if json {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        } else {
            reports.iter().for_each(print_report);
        }
    } else {
        let log: HistoryLog<RollbackRecord> =
            HistoryLog::open(settings.rollback_history_path(), settings.history_max_entries)?;
        let records = log.records();
        if json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else {
            records.iter().for_each(print_record);
        }
    }
    Ok(())
}

fn print_report(report: &StartupReport) {
    println!(
        "startup {} at {}: {}{}",
        report.id,
        report.started_at.to_rfc3339(),
        if report.overall_success { "OK" } else { "FAILED" },
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for step in &report.steps {
        print!(
            "  {:<24} {:<10} {:>7.2}s",
            step.step_name,
            step.status.as_str(),
            step.duration_seconds
        );
        match &step.error_message {
            Some(message) => println!("  {message}"),
            None => println!(),
        }
    }
}

fn print_record(record: &RollbackRecord) {
    println!(
        "rollback {} at {}: {} {} (trigger {}, {:.2}s)",
        record.id,
        record.timestamp.to_rfc3339(),
        record.rollback_type,
        record.status,
        record.trigger_name,
        record.duration_seconds
    );
    println!("  {}", record.details);
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
