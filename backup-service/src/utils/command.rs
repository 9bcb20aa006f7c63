//! Typed invocation of external tools.
//!
//! Arguments are passed as a vector, never through a shell. Secrets go to
//! the child's stdin so they do not show up in the process list or the log.

use super::errors::{Result, ServiceError};
use std::ffi::OsString;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// One external tool call.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Bytes written to the child's stdin before it is closed.
    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Loggable form of the call. Stdin content is never included.
    pub fn describe(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }

    /// Run to completion. A spawn error or a non-zero exit is a collaborator failure.
    pub async fn run(self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failure(format!("unable to start: {}", e)))?;

        if let Some(bytes) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes)
                    .await
                    .map_err(|e| self.failure(format!("unable to write stdin: {}", e)))?;
                // Dropping the pipe closes it so the child sees EOF.
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.failure(format!("unable to wait: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let message = if stderr.is_empty() {
            format!("{}", output.status)
        } else {
            format!("{}: {}", output.status, stderr)
        };
        Err(self.failure(message))
    }

    fn failure(&self, message: String) -> ServiceError {
        ServiceError::Collaborator {
            tool: self.program.clone(),
            message,
        }
    }
}
