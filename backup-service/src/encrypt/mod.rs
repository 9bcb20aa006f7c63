//! Optional encryption of the backup archive.
//!
//! The scheme is chosen once from configuration. The encrypted copy is a new
//! transient artifact next to the plain one; both are cleaned up
//! independently.

use crate::utils::command::ToolCommand;
use crate::utils::{Result, RunLog, ServiceError};
use crate::workspace::{Artifact, EntryKind, Workspace};
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionScheme {
    #[default]
    OpenSsl,
    Gpg,
}

impl EncryptionScheme {
    pub const fn suffix(self) -> &'static str {
        match self {
            EncryptionScheme::OpenSsl => "aes",
            EncryptionScheme::Gpg => "gpg",
        }
    }

    /// Tool call turning `source` into `output`; the passphrase goes to stdin.
    fn command(self, source: &Path, output: &Path, passphrase: &str) -> ToolCommand {
        match self {
            EncryptionScheme::OpenSsl => ToolCommand::new("openssl")
                .args(["enc", "-aes-256-cbc", "-salt", "-pbkdf2", "-pass", "stdin"])
                .arg("-in")
                .arg(source)
                .arg("-out")
                .arg(output)
                .stdin_bytes(format!("{}\n", passphrase)),
            EncryptionScheme::Gpg => ToolCommand::new("gpg")
                .args([
                    "--batch",
                    "--yes",
                    "--pinentry-mode",
                    "loopback",
                    "--passphrase-fd",
                    "0",
                    "--symmetric",
                    "--output",
                ])
                .arg(output)
                .arg(source)
                .stdin_bytes(format!("{}\n", passphrase)),
        }
    }
}

#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn encrypt(&self, artifact: &Artifact, workspace: &mut Workspace) -> Result<Artifact>;
}

/// Encrypts with an external tool (`openssl` or `gpg`).
pub struct ToolEncryptor {
    scheme: EncryptionScheme,
    passphrase: String,
    log: RunLog,
}

impl ToolEncryptor {
    pub fn new(scheme: EncryptionScheme, passphrase: String, log: RunLog) -> Self {
        Self {
            scheme,
            passphrase,
            log,
        }
    }
}

#[async_trait]
impl Encryptor for ToolEncryptor {
    async fn encrypt(&self, artifact: &Artifact, workspace: &mut Workspace) -> Result<Artifact> {
        if !artifact.path.is_file() {
            return Err(ServiceError::InvalidInput(format!(
                "Source file \"{}\" doesn't exist",
                artifact.path.display()
            )));
        }
        if self.passphrase.is_empty() {
            return Err(ServiceError::InvalidInput(
                "Passphrase cannot be empty".to_string(),
            ));
        }

        let output = with_suffix(&artifact.path, self.scheme.suffix());
        workspace.enqueue(&output, EntryKind::File)?;

        self.log.msg("Encryption started");
        let command = self.scheme.command(&artifact.path, &output, &self.passphrase);
        self.log
            .msg(format!("Encryption command: {}", command.describe()));
        command.run().await?;
        if !output.is_file() {
            return Err(ServiceError::Collaborator {
                tool: command_name(self.scheme).to_string(),
                message: format!("no output written to {}", output.display()),
            });
        }
        self.log.msg("Encryption ended");

        Ok(Artifact {
            path: output,
            produced_by: command_name(self.scheme),
            transient: true,
        })
    }
}

fn command_name(scheme: EncryptionScheme) -> &'static str {
    match scheme {
        EncryptionScheme::OpenSsl => "openssl",
        EncryptionScheme::Gpg => "gpg",
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
