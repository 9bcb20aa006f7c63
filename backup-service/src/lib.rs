//! Backup Service Library
//!
//! Generational backups: export databases, archive them together with plain
//! folders, optionally encrypt, then ship to each storage target and rotate
//! the daily, weekly, monthly and yearly slots there.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod encrypt;
pub mod executor;
pub mod export;
pub mod fs;
pub mod rotation;
pub mod storage;
pub mod utils;
pub mod workspace;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::ServiceError;
pub type Result<T> = std::result::Result<T, ServiceError>;
