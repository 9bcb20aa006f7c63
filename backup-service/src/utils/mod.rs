//! Utility modules for the backup service.

pub mod command;
pub mod errors;
pub mod format;
pub mod logger;
pub mod run_log;

pub use errors::{ErrorKind, Result, ServiceError};
pub use run_log::RunLog;
