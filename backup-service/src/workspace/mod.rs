//! Temp workspace and cleanup queue.
//!
//! Every scratch file or directory a run creates lives under the workspace
//! root and is registered in the cleanup queue before control returns to the
//! executor. The queue is drained exactly once at the end of the run, success
//! or failure. Containment is checked when a path is enqueued and checked
//! again when it is removed; a path outside the root aborts the drain.

use crate::utils::{Result, RunLog, ServiceError};
use std::path::{Component, Path, PathBuf};

/// What a cleanup entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::File => f.write_str("file"),
            EntryKind::Directory => f.write_str("dir"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CleanupEntry {
    path: PathBuf,
    kind: EntryKind,
}

/// A file or directory produced during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub produced_by: &'static str,
    pub transient: bool,
}

impl Artifact {
    /// File name component, used for manifest entries and object metadata.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Outcome of a drain.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    pub removed: usize,
    pub already_gone: usize,
}

pub struct Workspace {
    root: PathBuf,
    queue: Vec<CleanupEntry>,
    drained: bool,
    log: RunLog,
}

impl Workspace {
    /// Open the workspace at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>, log: RunLog) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(ServiceError::Config(format!(
                "TempPath must be absolute, got \"{}\"",
                root.display()
            )));
        }
        let root = normalize(&root).ok_or_else(|| {
            ServiceError::Config(format!("TempPath \"{}\" cannot be resolved", root.display()))
        })?;
        if root.parent().is_none() {
            return Err(ServiceError::Config(
                "TempPath cannot be the filesystem root".to_string(),
            ));
        }
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            queue: Vec::new(),
            drained: false,
            log,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of entries waiting for cleanup.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Register a path for removal at the end of the run.
    pub fn enqueue(&mut self, path: impl Into<PathBuf>, kind: EntryKind) -> Result<()> {
        if self.drained {
            return Err(ServiceError::InvalidInput(
                "workspace cleanup already ran".to_string(),
            ));
        }
        let path = path.into();
        self.check_contained(&path)?;
        self.queue.push(CleanupEntry { path, kind });
        Ok(())
    }

    /// Create (if needed) and register a scratch directory directly under the root.
    pub fn scratch_dir(&mut self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        self.check_contained(&dir)?;
        let registered = self
            .queue
            .iter()
            .any(|e| e.path == dir && e.kind == EntryKind::Directory);
        std::fs::create_dir_all(&dir)?;
        if !registered {
            self.enqueue(&dir, EntryKind::Directory)?;
        }
        Ok(dir)
    }

    /// Remove every queued entry in insertion order.
    ///
    /// Runs once; later calls are no-ops. A containment violation stops the
    /// drain and leaves that entry and every later one on disk.
    pub fn drain(&mut self) -> Result<CleanupSummary> {
        match self.take_queue() {
            Some(entries) => drain_entries(&self.root, entries, &self.log),
            None => Ok(CleanupSummary::default()),
        }
    }

    /// [`Workspace::drain`] on a blocking thread, for use inside the runtime.
    pub async fn drain_async(&mut self) -> Result<CleanupSummary> {
        let Some(entries) = self.take_queue() else {
            return Ok(CleanupSummary::default());
        };
        let root = self.root.clone();
        let log = self.log.clone();
        tokio::task::spawn_blocking(move || drain_entries(&root, entries, &log))
            .await
            .map_err(std::io::Error::from)?
    }

    fn take_queue(&mut self) -> Option<Vec<CleanupEntry>> {
        if self.drained {
            return None;
        }
        self.drained = true;
        Some(std::mem::take(&mut self.queue))
    }

    fn check_contained(&self, path: &Path) -> Result<()> {
        check_contained(&self.root, path)
    }
}

fn drain_entries(root: &Path, entries: Vec<CleanupEntry>, log: &RunLog) -> Result<CleanupSummary> {
    log.msg("Cleanup started");
    let mut summary = CleanupSummary::default();

    for entry in entries {
        log.msg(format!("Removing {} {}", entry.kind, entry.path.display()));
        check_contained(root, &entry.path)?;

        let removed = match entry.kind {
            EntryKind::Directory => std::fs::remove_dir_all(&entry.path),
            EntryKind::File => std::fs::remove_file(&entry.path),
        };
        match removed {
            Ok(()) => summary.removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                summary.already_gone += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    log.msg("Cleanup ended");
    Ok(summary)
}

fn check_contained(root: &Path, path: &Path) -> Result<()> {
    let violation = || ServiceError::PathSafety {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    };
    if !path.is_absolute() {
        return Err(violation());
    }
    let normalized = normalize(path).ok_or_else(violation)?;
    if normalized == root || !normalized.starts_with(root) {
        return Err(violation());
    }
    Ok(())
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Reached only when the run future was dropped or panicked before the
        // executor drained the queue.
        if !self.drained {
            tracing::warn!("Workspace dropped with pending cleanup, draining now");
            if let Err(e) = self.drain() {
                tracing::error!("Cleanup failed: {}", e);
            }
        }
    }
}

/// Resolve `.` and `..` lexically. Returns `None` when `..` climbs past the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
