//! Custom error types for the backup service.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing \"{field}\" parameter for {descriptor}")]
    MissingField {
        descriptor: String,
        field: &'static str,
    },

    #[error("Export failed for {descriptor}: {message}")]
    ExportFailed { descriptor: String, message: String },

    #[error("Unable to archive {0} because it doesn't exist")]
    MissingSource(PathBuf),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{tool} failed: {message}")]
    Collaborator { tool: String, message: String },

    #[error("Storage error on {target}: {message}")]
    Storage { target: String, message: String },

    #[error("Path \"{}\" is not within the temp folder \"{}\"", path.display(), root.display())]
    PathSafety { path: PathBuf, root: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse failure classes a run reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Raised before any pipeline stage starts.
    Configuration,
    /// An export, archive, encrypt or storage call failed.
    CollaboratorFailure,
    /// A cleanup entry escaped the temp root. Never downgraded.
    PathSafetyViolation,
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Config(_) | ServiceError::MissingField { .. } => ErrorKind::Configuration,
            ServiceError::PathSafety { .. } => ErrorKind::PathSafetyViolation,
            ServiceError::ExportFailed { .. }
            | ServiceError::MissingSource(_)
            | ServiceError::InvalidInput(_)
            | ServiceError::Collaborator { .. }
            | ServiceError::Storage { .. }
            | ServiceError::Io(_) => ErrorKind::CollaboratorFailure,
        }
    }

    pub(crate) fn storage(target: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ServiceError::Storage {
            target: target.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
