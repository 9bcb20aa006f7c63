//! Backup run executor - orchestrates one backup run.
//!
//! Stages run strictly in sequence:
//! export -> archive -> encrypt (optional) -> ship to each target -> cleanup -> report.
//!
//! Any error in export, archive, encrypt or ship jumps straight to cleanup.
//! The workspace is drained exactly once per run whatever happened before,
//! and the report carries whatever part of the manifest was written.
//! Targets are shipped one after the other; a failure on one target does
//! not undo the rotation already done on an earlier one.

pub mod manifest;

use crate::archive::{Archiver, TarZstdArchiver};
use crate::config::Config;
use crate::encrypt::{Encryptor, ToolEncryptor};
use crate::export::{MongoExporter, SourceExporter};
use crate::rotation::{rotate, Frequency, RotationPlan};
use crate::storage::StorageBackend;
use crate::utils::format::format_elapsed;
use crate::utils::{ErrorKind, Result, RunLog, ServiceError};
use crate::workspace::Workspace;
use chrono::{DateTime, Local, NaiveDate};
use manifest::{RunManifest, TargetManifest};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Pipeline states. `Failed` is reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Initializing,
    Exporting,
    Archiving,
    Encrypting,
    Shipping,
    CleaningUp,
    Reporting,
    Failed,
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Local>,
    pub success: bool,
    pub manifest: RunManifest,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub failed_stage: Option<RunStage>,
    /// Where the run log was written, when persistence is configured
    pub log_file: Option<PathBuf>,
}

fn serialize_secs<S: Serializer>(elapsed: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(elapsed.as_secs_f64())
}

type StageResult<T> = std::result::Result<T, (RunStage, ServiceError)>;

/// Main backup executor
pub struct BackupExecutor {
    temp_root: PathBuf,
    folders: Vec<PathBuf>,
    frequencies: Vec<Frequency>,
    exporter: Box<dyn SourceExporter>,
    archiver: Box<dyn Archiver>,
    encryptor: Option<Box<dyn Encryptor>>,
    targets: Vec<Box<dyn StorageBackend>>,
    log_dir: Option<PathBuf>,
    log: RunLog,
}

impl BackupExecutor {
    pub fn new(
        temp_root: PathBuf,
        exporter: Box<dyn SourceExporter>,
        archiver: Box<dyn Archiver>,
        targets: Vec<Box<dyn StorageBackend>>,
        log: RunLog,
    ) -> Self {
        Self {
            temp_root,
            folders: Vec::new(),
            frequencies: Vec::new(),
            exporter,
            archiver,
            encryptor: None,
            targets,
            log_dir: None,
            log,
        }
    }

    pub fn with_folders(mut self, folders: Vec<PathBuf>) -> Self {
        self.folders = folders;
        self
    }

    pub fn with_frequencies(mut self, frequencies: Vec<Frequency>) -> Self {
        self.frequencies = frequencies;
        self
    }

    pub fn with_encryptor(mut self, encryptor: Box<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_log_dir(mut self, log_dir: Option<PathBuf>) -> Self {
        self.log_dir = log_dir;
        self
    }

    /// Resolve every collaborator from configuration.
    pub async fn from_config(config: &Config, log: RunLog) -> Result<Self> {
        config.validate()?;

        let exporter = MongoExporter::new(config.mongo_databases.clone(), log.clone());
        let archiver = TarZstdArchiver::new(
            config.archive.compression_level,
            config.archive.exclude_patterns.clone(),
            log.clone(),
        );

        let mut targets = Vec::with_capacity(config.storage.len());
        for target in &config.storage {
            targets.push(target.connect(&log).await?);
        }

        let mut executor = Self::new(
            config.temp_root()?,
            Box::new(exporter),
            Box::new(archiver),
            targets,
            log.clone(),
        )
        .with_folders(config.service.folders.clone())
        .with_frequencies(config.service.frequency.clone())
        .with_log_dir(config.service.log_dir.clone());

        if let Some(encryption) = &config.encryption {
            let passphrase = encryption.resolve_passphrase().ok_or_else(|| {
                ServiceError::Config("encryption passphrase is not set".to_string())
            })?;
            executor = executor.with_encryptor(Box::new(ToolEncryptor::new(
                encryption.scheme,
                passphrase,
                log,
            )));
        }

        Ok(executor)
    }

    /// Execute one run as of calendar date `today`.
    pub async fn execute(&self, today: NaiveDate) -> RunReport {
        let start_time = Instant::now();
        let started_at = Local::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut manifest = RunManifest::default();

        self.enter(RunStage::Initializing);
        self.log.msg(format!("Backup {} started", run_id));

        let failure = match Workspace::open(&self.temp_root, self.log.clone()) {
            Ok(mut workspace) => {
                let outcome = self
                    .run_pipeline(&mut workspace, today, started_at, &mut manifest)
                    .await;
                if let Err((stage, e)) = &outcome {
                    self.enter(RunStage::Failed);
                    error!(stage = ?stage, "Backup failed: {}", e);
                }

                self.enter(RunStage::CleaningUp);
                let cleanup = workspace.drain_async().await;
                merge_failures(outcome.err(), cleanup.err())
            }
            // Nothing was created yet, so there is nothing to clean up.
            Err(e) => Some(RunFailure::new(RunStage::Initializing, e)),
        };

        self.enter(RunStage::Reporting);
        let elapsed = start_time.elapsed();
        let (error, error_kind, failed_stage) = match &failure {
            Some(failure) => {
                let message = failure.message();
                self.log.msg(format!("ERROR: {}", message));
                (Some(message), Some(failure.error.kind()), Some(failure.stage))
            }
            None => {
                self.log.msg("Backup ended");
                (None, None, None)
            }
        };
        self.log
            .msg(format!("Execution time: {}", format_elapsed(elapsed)));

        let log_file = self.log_dir.as_ref().and_then(|dir| match self.log.persist(dir) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Failed to write run log to {}: {}", dir.display(), e);
                None
            }
        });

        RunReport {
            run_id,
            started_at,
            success: failure.is_none(),
            manifest,
            elapsed,
            error,
            error_kind,
            failed_stage,
            log_file,
        }
    }

    async fn run_pipeline(
        &self,
        workspace: &mut Workspace,
        today: NaiveDate,
        started_at: DateTime<Local>,
        manifest: &mut RunManifest,
    ) -> StageResult<()> {
        let stage = self.enter(RunStage::Exporting);
        let exports = self
            .exporter
            .export_all(workspace)
            .await
            .map_err(|e| (stage, e))?;
        let mut sources: Vec<PathBuf> = exports.into_iter().map(|a| a.path).collect();
        sources.extend(self.folders.iter().cloned());

        let stage = self.enter(RunStage::Archiving);
        let name = format!("backup-{}", started_at.format("%Y-%m-%d_%H-%M-%S"));
        let archive = self
            .archiver
            .archive(&sources, &name, workspace)
            .await
            .map_err(|e| (stage, e))?;

        let (artifact, encrypted) = match &self.encryptor {
            Some(encryptor) => {
                let stage = self.enter(RunStage::Encrypting);
                let encrypted = encryptor
                    .encrypt(&archive, workspace)
                    .await
                    .map_err(|e| (stage, e))?;
                (encrypted, true)
            }
            None => (archive, false),
        };

        let stage = self.enter(RunStage::Shipping);
        let plan = RotationPlan::for_date(today, &self.frequencies);
        info!(
            date = %plan.date,
            slots = ?plan.refreshed_slots(),
            "Rotation plan"
        );
        for backend in &self.targets {
            let mut record = TargetManifest::new(backend.describe());
            let result = rotate(
                &**backend,
                &artifact,
                encrypted,
                &plan,
                &self.log,
                &mut record,
            )
            .await;
            manifest.targets.push(record);
            result.map_err(|e| (stage, e))?;
        }

        Ok(())
    }

    fn enter(&self, stage: RunStage) -> RunStage {
        debug!(stage = ?stage, "Entering stage");
        stage
    }
}

/// Why a run failed.
#[derive(Debug)]
struct RunFailure {
    /// First stage that failed
    stage: RunStage,
    error: ServiceError,
    /// Pipeline error that preceded a cleanup failure
    earlier: Option<ServiceError>,
}

impl RunFailure {
    fn new(stage: RunStage, error: ServiceError) -> Self {
        Self {
            stage,
            error,
            earlier: None,
        }
    }

    fn message(&self) -> String {
        match &self.earlier {
            Some(earlier) => format!("{} (after {:?} failed: {})", self.error, self.stage, earlier),
            None => self.error.to_string(),
        }
    }
}

/// The pipeline error keeps the stage; a cleanup error keeps its own variant.
fn merge_failures(
    pipeline: Option<(RunStage, ServiceError)>,
    cleanup: Option<ServiceError>,
) -> Option<RunFailure> {
    match (pipeline, cleanup) {
        (None, None) => None,
        (Some((stage, e)), None) => Some(RunFailure::new(stage, e)),
        (None, Some(e)) => Some(RunFailure::new(RunStage::CleaningUp, e)),
        (Some((stage, first)), Some(cleanup)) => Some(RunFailure {
            stage,
            error: cleanup,
            earlier: Some(first),
        }),
    }
}
