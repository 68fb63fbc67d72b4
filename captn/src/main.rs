//! captn - rule-driven container updater.
//!
//! Thin front-end over `captn-core`: argument parsing, logging setup, the
//! daemon scheduler loop, and the self-update helper entry point.

mod schedule;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use captn_core::config::Config;
use captn_core::coordinator::{Coordinator, RunOptions};
use captn_core::docker::DockerDriver;
use captn_core::report::RunReport;
use captn_core::self_update;

use schedule::CronSchedule;

#[derive(Parser, Debug)]
#[command(name = "captn")]
#[command(version, about = "A rule-driven container updater that automates container upgrades based on semantic versioning and registry metadata")]
struct Cli {
    /// Run in dry-run mode to review what would be done (default comes from
    /// the configuration)
    #[arg(short = 't', long)]
    dry_run: bool,

    /// Force actual execution, overriding a dry-run configuration
    #[arg(short, long)]
    run: bool,

    /// Force lock acquisition
    #[arg(short, long)]
    force: bool,

    /// Filter containers to process, e.g. name=nginx or name=web-0?
    /// (repeatable, OR-semantics)
    #[arg(long = "filter", value_name = "FILTER")]
    filters: Vec<String>,

    /// Set the logging level
    #[arg(short, long, value_parser = ["debug", "info", "warning", "error", "critical"])]
    log_level: Option<String>,

    /// Delete all log files before starting
    #[arg(short, long)]
    clear_logs: bool,

    /// Run as a long-lived scheduler driven by general.cronSchedule
    #[arg(short, long)]
    daemon: bool,

    /// Path to the configuration file
    #[arg(long, default_value = "/app/conf/captn.cfg")]
    config: PathBuf,
}

fn tracing_level(level: &str) -> &'static str {
    match level {
        "debug" => "debug",
        "warning" => "warn",
        "error" => "error",
        "critical" => "error",
        _ => "info",
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing_level(level)));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn clear_logs(directory: &std::path::Path) {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(_) => {
            eprintln!("Log directory not found");
            return;
        }
    };
    let mut deleted = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("captn.log") {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    deleted += 1;
                    println!("Deleted log file: {name}");
                }
                Err(e) => eprintln!("Failed to delete log file {name}: {e}"),
            }
        }
    }
    println!("Deleted {deleted} log file(s)");
}

/// `name=<glob>` filter expressions from the command line.
fn parse_name_filters(filters: &[String]) -> Vec<String> {
    let mut names = Vec::new();
    for filter in filters {
        match filter.split_once('=') {
            Some(("name", value)) => names.push(value.to_string()),
            Some((key, _)) => warn!(key, "unsupported filter key, ignoring"),
            None => warn!(filter = %filter, "ignoring malformed filter"),
        }
    }
    names
}

fn summarize(report: &RunReport) {
    info!(
        run_id = %report.run_id,
        containers = report.outcomes.len(),
        updated = report.updated_count(),
        dry_run = report.dry_run,
        cancelled = report.cancelled,
        "run finished"
    );
    for outcome in &report.outcomes {
        info!(
            container = %outcome.container,
            state = ?outcome.final_state,
            steps = outcome.steps_applied,
            reason = outcome.reason.as_deref().unwrap_or("-"),
            "container outcome"
        );
    }
    if report.has_inconsistent_containers() {
        error!("one or more containers were left under their backup name; manual intervention required");
    }
    if let Ok(json) = serde_json::to_string(report) {
        tracing::debug!(report = %json, "full run report");
    }
}

/// Watches for SIGTERM / Ctrl-C once per process: requests run cancellation
/// (the step in flight completes) and flags process shutdown for the daemon
/// loop.
struct Shutdown {
    requested: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl Shutdown {
    fn install(cancel: captn_core::CancelFlag) -> Shutdown {
        let requested = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let notify = Arc::new(tokio::sync::Notify::new());
        {
            let requested = Arc::clone(&requested);
            let notify = Arc::clone(&notify);
            tokio::spawn(async move {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("installing SIGTERM handler");
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                warn!("termination requested, finishing current step before exiting");
                requested.store(true, std::sync::atomic::Ordering::SeqCst);
                cancel.cancel();
                notify.notify_waiters();
            });
        }
        Shutdown { requested, notify }
    }

    fn is_requested(&self) -> bool {
        self.requested.load(std::sync::atomic::Ordering::SeqCst)
    }
}

async fn single_run(coordinator: &Coordinator, opts: &RunOptions) -> Result<RunReport> {
    let report = coordinator.run(opts).await.context("run failed")?;
    summarize(&report);
    Ok(report)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| cfg.logging.level.to_lowercase());
    init_logging(&level);

    if cli.clear_logs {
        clear_logs(&cfg.logging.directory);
    }

    match run(cli, cfg).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, cfg: Config) -> Result<()> {
    let dry_run = if cli.run {
        false
    } else if cli.dry_run {
        true
    } else {
        cfg.general.dry_run
    };

    let mut name_filters = parse_name_filters(&cli.filters);
    let mut force_lock = cli.force;
    let mut run_dry = dry_run;

    // As a self-update helper we perform exactly one forced, real update of
    // the target container and exit.
    if let Some(target) = self_update::helper_target() {
        info!(target = %target, "running as self-update helper");
        name_filters = vec![target];
        force_lock = true;
        run_dry = false;
    }

    let driver = Arc::new(
        DockerDriver::connect()
            .await
            .context("connecting to the container daemon")?,
    );
    let cron = cfg.general.cron_schedule.clone();
    let coordinator = Coordinator::new(cfg, driver).context("initializing coordinator")?;

    let opts = RunOptions {
        dry_run: run_dry,
        force_lock,
        name_filters,
        lock_path: PathBuf::from("/tmp/captn.lock"),
    };

    let shutdown = Shutdown::install(coordinator.cancel_flag());

    if cli.daemon {
        let schedule = CronSchedule::parse(&cron)
            .with_context(|| format!("invalid cron schedule '{cron}'"))?;
        info!(schedule = %cron, "daemon mode, waiting for scheduled runs");
        loop {
            let now = chrono::Local::now();
            let next = schedule
                .next_after(now)
                .context("cron schedule yields no future run")?;
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next = %next, "next run scheduled");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.notify.notified() => {}
            }
            if shutdown.is_requested() {
                info!("daemon shutting down");
                return Ok(());
            }
            // A failed scheduled run is logged; the next one proceeds
            // normally.
            if let Err(e) = single_run(&coordinator, &opts).await {
                error!("scheduled run failed: {e:#}");
            }
            if shutdown.is_requested() {
                info!("daemon shutting down");
                return Ok(());
            }
        }
    } else {
        let report = single_run(&coordinator, &opts).await?;
        if report.has_inconsistent_containers() {
            anyhow::bail!("run left one or more containers under their backup name");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_name_filters() {
        let filters = vec![
            "name=nginx".to_string(),
            "name=*cloud*".to_string(),
            "status=running".to_string(),
            "garbage".to_string(),
        ];
        let names = parse_name_filters(&filters);
        assert_eq!(names, vec!["nginx".to_string(), "*cloud*".to_string()]);
    }

    #[test]
    fn test_tracing_level_mapping() {
        assert_eq!(tracing_level("critical"), "error");
        assert_eq!(tracing_level("warning"), "warn");
        assert_eq!(tracing_level("info"), "info");
    }
}
