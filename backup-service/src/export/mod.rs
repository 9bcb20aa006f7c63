//! Data source exports.
//!
//! A [`SourceExporter`] turns one configured source into a local directory
//! inside the workspace. The directory is registered for cleanup before the
//! exporter returns.

use crate::utils::command::ToolCommand;
use crate::utils::{Result, RunLog, ServiceError};
use crate::workspace::{Artifact, EntryKind, Workspace};
use async_trait::async_trait;
use chrono::Local;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Scratch directory (under the temp root) holding database dumps.
pub const EXPORT_DIR: &str = "mongo-exports";

/// One MongoDB database to dump.
#[derive(Clone, Default, Deserialize)]
pub struct MongoSource {
    #[serde(default, alias = "Database")]
    pub database: Option<String>,

    /// `host` or `host:port`
    #[serde(default, alias = "Host")]
    pub host: Option<String>,

    #[serde(default, alias = "Username")]
    pub username: Option<String>,

    #[serde(default, alias = "Password")]
    pub password: Option<String>,
}

impl std::fmt::Debug for MongoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoSource")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl MongoSource {
    /// Database name, or `MissingField`.
    pub fn database(&self) -> Result<&str> {
        non_empty(self.database.as_deref()).ok_or_else(|| ServiceError::MissingField {
            descriptor: "one of the mongo databases".to_string(),
            field: "Database",
        })
    }

    pub fn validate(&self) -> Result<()> {
        let database = self.database()?;
        if non_empty(self.host.as_deref()).is_none() {
            return Err(ServiceError::MissingField {
                descriptor: format!("mongo database \"{}\"", database),
                field: "Host",
            });
        }
        Ok(())
    }

    /// Arguments for `mongodump`, up to but not including `--out`.
    fn dump_args(&self) -> Result<Vec<String>> {
        self.validate()?;
        let database = self.database()?;
        let host = self.host.as_deref().unwrap_or_default().trim();

        let mut args = vec!["--db".to_string(), database.to_string()];
        match host.split_once(':') {
            Some((name, port)) => {
                args.extend(["--host".to_string(), name.to_string()]);
                args.extend(["--port".to_string(), port.to_string()]);
            }
            None => args.extend(["--host".to_string(), host.to_string()]),
        }
        if let Some(username) = non_empty(self.username.as_deref()) {
            args.extend(["--username".to_string(), username.to_string()]);
        }
        if let Some(password) = non_empty(self.password.as_deref()) {
            args.extend(["--password".to_string(), password.to_string()]);
        }
        Ok(args)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[async_trait]
pub trait SourceExporter: Send + Sync {
    /// Export every configured source, in configuration order.
    async fn export_all(&self, workspace: &mut Workspace) -> Result<Vec<Artifact>>;
}

/// Dumps MongoDB databases with the `mongodump` tool.
pub struct MongoExporter {
    sources: Vec<MongoSource>,
    program: String,
    log: RunLog,
}

impl MongoExporter {
    pub fn new(sources: Vec<MongoSource>, log: RunLog) -> Self {
        Self {
            sources,
            program: "mongodump".to_string(),
            log,
        }
    }

    /// Use a different dump binary (absolute path or wrapper).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub async fn export(&self, source: &MongoSource, workspace: &mut Workspace) -> Result<Artifact> {
        let args = source.dump_args()?;
        let database = source.database()?;
        self.log
            .msg(format!("Mongodb: exporting \"{}\" database.", database));

        let export_root = workspace.scratch_dir(EXPORT_DIR)?;
        let stem = format!("{}-{}", database, Local::now().format("%Y-%m-%d"));
        let out = unused_dir(&export_root, &stem);
        workspace.enqueue(&out, EntryKind::Directory)?;

        let command = ToolCommand::new(&self.program)
            .args(args)
            .arg("--out")
            .arg(&out);
        self.log.msg(format!(
            "Mongodb: export command {}",
            redact_password(&command.describe())
        ));

        command.run().await.map_err(|e| ServiceError::ExportFailed {
            descriptor: format!("mongo database \"{}\"", database),
            message: e.to_string(),
        })?;
        if !out.is_dir() {
            return Err(ServiceError::ExportFailed {
                descriptor: format!("mongo database \"{}\"", database),
                message: format!("{} did not produce {}", self.program, out.display()),
            });
        }

        self.log.msg("Mongodb: database export done");
        Ok(Artifact {
            path: out,
            produced_by: "mongodump",
            transient: true,
        })
    }
}

#[async_trait]
impl SourceExporter for MongoExporter {
    async fn export_all(&self, workspace: &mut Workspace) -> Result<Vec<Artifact>> {
        let mut exports = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            exports.push(self.export(source, workspace).await?);
        }
        Ok(exports)
    }
}

/// `<parent>/<stem>`, or `<stem>-2`, `<stem>-3`, ... when an earlier export
/// of a database with the same name already used it.
fn unused_dir(parent: &Path, stem: &str) -> PathBuf {
    let mut candidate = parent.join(stem);
    let mut n = 2;
    while candidate.exists() {
        candidate = parent.join(format!("{}-{}", stem, n));
        n += 1;
    }
    candidate
}

fn redact_password(described: &str) -> String {
    let mut out = Vec::new();
    let mut hide_next = false;
    for part in described.split(' ') {
        if hide_next {
            out.push("****");
            hide_next = false;
        } else {
            hide_next = part == "--password";
            out.push(part);
        }
    }
    out.join(" ")
}
