//! Configuration management for the backup service.
//!
//! Loads configuration from a TOML file. The encryption passphrase may come
//! from the `BACKUP_SERVICE_PASSPHRASE` environment variable instead.

use crate::encrypt::EncryptionScheme;
use crate::export::MongoSource;
use crate::rotation::Frequency;
use crate::storage::StorageTargetConfig;
use crate::utils::{Result, ServiceError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const PASSPHRASE_ENV: &str = "BACKUP_SERVICE_PASSPHRASE";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,

    #[serde(default)]
    pub mongo_databases: Vec<MongoSource>,

    #[serde(default)]
    pub storage: Vec<StorageTargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Root of the run workspace; everything under it is scratch
    #[serde(default)]
    pub temp_path: String,

    /// Long-period slots to maintain
    #[serde(default)]
    pub frequency: Vec<Frequency>,

    /// Folders included verbatim in the archive
    #[serde(default)]
    pub folders: Vec<PathBuf>,

    /// Where run logs are persisted (not persisted when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// File name substrings skipped while archiving folders
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Clone, Deserialize)]
pub struct EncryptionConfig {
    #[serde(rename = "type", default)]
    pub scheme: EncryptionScheme,

    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("scheme", &self.scheme)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl EncryptionConfig {
    /// Configured passphrase, falling back to the environment.
    pub fn resolve_passphrase(&self) -> Option<String> {
        self.passphrase
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var(PASSPHRASE_ENV).ok().filter(|p| !p.is_empty()))
    }
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_compression_level() -> i32 {
    3
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Field-presence checks. Nothing has been created on disk when these fail.
    pub fn validate(&self) -> Result<()> {
        self.temp_root()?;

        for source in &self.mongo_databases {
            source.validate()?;
        }

        if self.storage.is_empty() {
            return Err(ServiceError::Config(
                "Please configure at least one storage target.".to_string(),
            ));
        }
        for target in &self.storage {
            match target {
                StorageTargetConfig::Local { path } if path.as_os_str().is_empty() => {
                    return Err(ServiceError::Config(
                        "local storage path cannot be empty".to_string(),
                    ));
                }
                StorageTargetConfig::Local { .. } => {}
                StorageTargetConfig::S3(s3) => s3.validate()?,
            }
        }

        if let Some(encryption) = &self.encryption {
            if encryption.resolve_passphrase().is_none() {
                return Err(ServiceError::Config(format!(
                    "Encryption is configured but no passphrase is set (config or {}).",
                    PASSPHRASE_ENV
                )));
            }
        }

        if !(1..=22).contains(&self.archive.compression_level) {
            return Err(ServiceError::Config(format!(
                "compression_level must be between 1 and 22, got {}",
                self.archive.compression_level
            )));
        }

        Ok(())
    }

    /// `temp_path` with trailing separators trimmed.
    pub fn temp_root(&self) -> Result<PathBuf> {
        let raw = self.service.temp_path.trim();
        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ServiceError::Config(
                "Please set the TempPath in your configuration.".to_string(),
            ));
        }
        let path = PathBuf::from(trimmed);
        if !path.is_absolute() {
            return Err(ServiceError::Config(format!(
                "TempPath must be an absolute path, got \"{}\"",
                raw
            )));
        }
        Ok(path)
    }
}
