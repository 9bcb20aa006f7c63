//! Per-run message log.
//!
//! Every component receives a clone of the run's [`RunLog`] at construction
//! and reports through [`RunLog::msg`]. Lines are timestamped, kept in order,
//! mirrored to `tracing`, and can be written out as a single file once the
//! run is over.

use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const LINE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FILE_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, Default)]
pub struct RunLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RunLog {
    pub fn new() -> Self {
        let log = Self::default();
        log.msg(format!(
            "New log started at {}",
            Local::now().format(LINE_FORMAT)
        ));
        log
    }

    /// Append a message to the run log
    pub fn msg(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        tracing::info!("{}", text);

        let line = format!("{} {}", Local::now().format(LINE_FORMAT), text);
        // A poisoned buffer still holds every line written before the panic.
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push(line);
    }

    /// Snapshot of the lines logged so far
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Write the buffer to `dir/log-<timestamp>.log` and return the file path.
    pub fn persist(&self, dir: &Path) -> std::io::Result<PathBuf> {
        self.msg("Log end");
        std::fs::create_dir_all(dir)?;

        let path = dir.join(format!("log-{}.log", Local::now().format(FILE_FORMAT)));
        let mut content = self.lines().join("\n");
        content.push('\n');
        std::fs::write(&path, content)?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_messages_keep_order() {
        let log = RunLog::new();
        let shared = log.clone();
        log.msg("Compression started");
        shared.msg("Compression ended");

        let lines = log.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("New log started at"));
        assert!(lines[1].ends_with(" Compression started"));
        assert!(lines[2].ends_with(" Compression ended"));
    }

    #[test]
    fn test_persist_writes_single_file() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let log = RunLog::new();
        log.msg("Backup ended");

        let path = log.persist(&temp_dir.path().join("logs"))?;
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("log-"));
        assert!(name.ends_with(".log"));

        let content = std::fs::read_to_string(&path)?;
        assert!(content.contains("Backup ended"));
        assert!(content.trim_end().ends_with("Log end"));
        Ok(())
    }
}
