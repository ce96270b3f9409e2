use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use cb_core::error::BootstrapError;
use cb_core::models::{Phase, Reachability};
use cb_core::services::config_loader;
use cb_core::services::orchestrator::Orchestrator;
use cb_core::services::planner::PhasePlanner;
use cb_core::services::registry::HostRegistry;
use cb_core::services::remote::RemoteChannel;
use cb_core::services::ssh::SshChannel;
use cb_core::services::state::StateTracker;
use cb_cli::cli::{self, Cli, Command, GlobalArgs};
use cb_cli::render;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let guard = setup_logging(&cli.global);

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, preflight = e.is_preflight(), "run_failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    // flush the file writer; process::exit skips destructors
    drop(guard);
    std::process::exit(code);
}

/// Log to stderr, or to `--log-file` through a non-blocking writer.
/// Returns the guard that must be held alive for the duration of the program.
fn setup_logging(args: &GlobalArgs) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli::log_level(args.verbose)));

    let Some(path) = &args.log_file else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .with_target(false)
            .init();
        return None;
    };

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "clusterboot.log".to_string());
    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn execute(cli: Cli) -> Result<i32, BootstrapError> {
    let global = cli.global;
    let inventory = config_loader::load(&global.inventory)?;
    let mut registry = HostRegistry::new(inventory.hosts)?;
    let planner = match &global.steps {
        Some(path) => PhasePlanner::new(config_loader::load_steps(path)?)?,
        None => PhasePlanner::bootstrap(&inventory.cluster)?,
    };
    let channel: Arc<dyn RemoteChannel> = Arc::new(SshChannel::new(
        global.ssh_user.clone(),
        global.identity_file.clone(),
    ));

    if let Command::Probe = cli.command {
        registry.probe_all(channel.as_ref(), PROBE_TIMEOUT).await;
        let hosts = registry.hosts();
        if global.json {
            let entries: Vec<_> = hosts
                .iter()
                .map(|h| {
                    serde_json::json!({
                        "host": h.id(),
                        "address": h.address,
                        "role": h.role,
                        "reachability": h.reachability,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        } else {
            println!("{}", render::probe_table(hosts));
        }
        let all_reachable = hosts
            .iter()
            .all(|h| h.reachability == Reachability::Reachable);
        return Ok(if all_reachable { 0 } else { 20 });
    }

    let tracker = Arc::new(StateTracker::open(&global.state_dir).await?);
    let orchestrator = Orchestrator::new(
        registry,
        planner,
        inventory.cluster,
        channel,
        tracker.clone(),
    );

    match cli.command {
        Command::Run(args) => {
            let cancel = orchestrator.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, letting in-flight steps finish");
                    cancel.cancel();
                }
            });

            let report = orchestrator
                .run(&args.selection.phases, &args.selection.hosts, &args.options())
                .await?;
            if global.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render::report_table(&report));
            }
            Ok(report.exit_code())
        }
        Command::Plan(selection) => {
            let plan = orchestrator
                .plan(&selection.phases, &selection.hosts)
                .await?;
            if global.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("{}", render::plan_table(&plan));
            }
            Ok(0)
        }
        Command::Status(selection) => {
            let phases = Phase::parse_selection(selection.phases.as_slice())?;
            let hosts: HashSet<String> = orchestrator
                .registry()
                .select(&selection.hosts)?
                .iter()
                .map(|h| h.id().to_string())
                .collect();
            let records: Vec<_> = tracker
                .snapshot()
                .await
                .into_values()
                .filter(|r| hosts.contains(&r.host) && phases.contains(&r.phase))
                .collect();
            if global.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!("{}", render::status_table(&records));
            }
            Ok(0)
        }
        Command::Reset(args) => {
            let report = orchestrator
                .reset(
                    &args.hosts,
                    args.step.as_deref(),
                    args.remote,
                    Duration::from_secs(args.timeout_secs),
                )
                .await?;
            if global.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render::reset_summary(&report));
            }
            Ok(report.exit_code())
        }
        Command::Probe => Ok(0),
    }
}
