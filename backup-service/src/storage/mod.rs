//! Storage targets.
//!
//! A [`StorageBackend`] exposes the four primitives rotation needs. Slot
//! writes are destructive: at most one object lives under a slot name.

pub mod local;
#[cfg(test)]
pub(crate) mod memory;
pub mod s3;

use crate::utils::{Result, RunLog};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub use local::LocalBackend;
pub use s3::{S3Backend, S3TargetConfig};

/// Metadata of an object written into a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedRef {
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable target name for logs and the manifest.
    fn describe(&self) -> String;

    /// Place the file at `source` under `slot`, replacing what was there.
    async fn upload(&self, source: &Path, slot: &str) -> Result<UploadedRef>;

    /// Remove `slot`. A missing slot is not an error.
    async fn delete_slot(&self, slot: &str) -> Result<()>;

    /// Duplicate `source_slot` into `dest_slot` inside the target.
    async fn copy_from_slot(&self, source_slot: &str, dest_slot: &str) -> Result<UploadedRef>;

    async fn slot_exists(&self, slot: &str) -> Result<bool>;
}

/// One configured destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageTargetConfig {
    Local { path: PathBuf },
    S3(S3TargetConfig),
}

impl StorageTargetConfig {
    /// Build the backend for this target.
    pub async fn connect(&self, log: &RunLog) -> Result<Box<dyn StorageBackend>> {
        match self {
            StorageTargetConfig::Local { path } => {
                Ok(Box::new(LocalBackend::new(path.clone(), log.clone())?))
            }
            StorageTargetConfig::S3(config) => {
                Ok(Box::new(S3Backend::connect(config.clone(), log.clone()).await?))
            }
        }
    }
}
