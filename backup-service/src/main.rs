//! Backup Service - Main entry point

use anyhow::{Context, Result};
use backup_service::config::Config;
use backup_service::daemon::scheduler::BackupScheduler;
use backup_service::daemon::shutdown::ShutdownCoordinator;
use backup_service::executor::BackupExecutor;
use backup_service::rotation::RotationPlan;
use backup_service::utils::{self, RunLog};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one backup now
    Run {
        /// Write the run report as JSON to this file
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
    /// Show which slots a run on the given date would write
    Plan {
        /// Date to plan for (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run backups on a cron schedule until SIGINT/SIGTERM
    Daemon {
        /// Six-field cron expression (sec min hour day month weekday)
        #[arg(long, default_value = "0 0 3 * * *")]
        cron: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .context("--config <FILE> is required")?;
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting backup-service v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Run { report } => run_once(&config, report).await,
        Command::Plan { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let plan = RotationPlan::for_date(date, &config.service.frequency);
            println!("{}:", plan.date);
            for slot in plan.refreshed_slots() {
                println!("  {}", slot.name());
            }
            Ok(())
        }
        Command::Daemon { cron } => run_daemon(config, &cron).await,
    }
}

async fn run_once(config: &Config, report_path: Option<PathBuf>) -> Result<()> {
    let executor = BackupExecutor::from_config(config, RunLog::new()).await?;
    let report = executor.execute(Local::now().date_naive()).await;

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }

    if !report.success {
        anyhow::bail!(
            "backup failed during {:?}: {}",
            report.failed_stage,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }

    tracing::info!(
        run_id = %report.run_id,
        slots = report.manifest.entry_count(),
        "Backup completed"
    );
    Ok(())
}

async fn run_daemon(config: Config, cron: &str) -> Result<()> {
    let shutdown_coordinator = ShutdownCoordinator::new();

    let scheduler = BackupScheduler::new(config).await?;
    scheduler.schedule(cron).await?;
    scheduler.start().await?;

    let shutdown = shutdown_coordinator.subscribe();
    let (_, stopped) = tokio::join!(
        shutdown_coordinator.wait_for_signal(),
        scheduler.stop_on(shutdown)
    );
    stopped?;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}
