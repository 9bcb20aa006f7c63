//! Cron-driven backup runs.
//!
//! Each tick builds a fresh executor (and run log) from configuration. A tick
//! that fires while the previous run is still going is skipped.

use crate::config::Config;
use crate::executor::BackupExecutor;
use crate::utils::format::format_elapsed;
use crate::utils::RunLog;
use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};

/// Held for the duration of one run; released on drop.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl RunGuard {
    /// `None` when a run is already in progress.
    pub fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
}

impl BackupScheduler {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn schedule(&self, cron_expression: &str) -> anyhow::Result<()> {
        let config = self.config.clone();
        let running = self.running.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let config = config.clone();
            let running = running.clone();
            Box::pin(async move {
                let Some(_guard) = RunGuard::try_acquire(&running) else {
                    tracing::warn!("Skipping scheduled run: previous backup still running");
                    return;
                };
                run_scheduled(&config).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Backup scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    /// Wait for the shutdown broadcast, then stop the scheduler.
    pub async fn stop_on(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        if let Err(e) = shutdown.recv().await {
            tracing::warn!("Shutdown channel closed: {}", e);
        }
        tracing::info!("Stopping scheduler");
        self.shutdown().await
    }

    /// Stop firing new ticks, then wait for an in-flight run to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        while self.running.load(Ordering::Acquire) {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        Ok(())
    }
}

async fn run_scheduled(config: &Config) {
    tracing::info!("Starting scheduled backup");
    let log = RunLog::new();
    let executor = match BackupExecutor::from_config(config, log).await {
        Ok(executor) => executor,
        Err(e) => {
            tracing::error!(error = %e, "Scheduled backup could not start");
            return;
        }
    };

    let report = executor.execute(Local::now().date_naive()).await;
    if report.success {
        tracing::info!(
            run_id = %report.run_id,
            slots = report.manifest.entry_count(),
            elapsed = %format_elapsed(report.elapsed),
            "Scheduled backup completed"
        );
    } else {
        tracing::error!(
            run_id = %report.run_id,
            stage = ?report.failed_stage,
            error = report.error.as_deref().unwrap_or("unknown"),
            "Scheduled backup failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::shutdown::ShutdownCoordinator;

    #[test]
    fn test_run_guard_blocks_overlap() {
        let flag = Arc::new(AtomicBool::new(false));

        let first = RunGuard::try_acquire(&flag).expect("first run");
        assert!(RunGuard::try_acquire(&flag).is_none());

        drop(first);
        assert!(RunGuard::try_acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn test_rejects_bad_cron_expression() {
        let config = Config::from_toml(
            "[service]\ntemp_path = \"/tmp/backup\"\n[[storage]]\ntype = \"local\"\npath = \"/mnt\"\n",
        )
        .unwrap();
        let scheduler = BackupScheduler::new(config).await.unwrap();
        assert!(scheduler.schedule("not a cron line").await.is_err());
        assert!(scheduler.schedule("0 0 3 * * *").await.is_ok());
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_broadcast() {
        let config = Config::from_toml(
            "[service]\ntemp_path = \"/tmp/backup\"\n[[storage]]\ntype = \"local\"\npath = \"/mnt\"\n",
        )
        .unwrap();
        let scheduler = BackupScheduler::new(config).await.unwrap();
        scheduler.schedule("0 0 3 * * *").await.unwrap();
        scheduler.start().await.unwrap();

        let coordinator = ShutdownCoordinator::new();
        let shutdown = coordinator.subscribe();
        assert!(coordinator.trigger());

        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            scheduler.stop_on(shutdown),
        )
        .await
        .expect("scheduler did not stop")
        .unwrap();
    }
}
