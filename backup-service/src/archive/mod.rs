//! Packaging of export directories and folders into one compressed artifact.

use crate::fs::walker::{calculate_total_size, walk_input, WalkOptions};
use crate::utils::format::format_bytes;
use crate::utils::{Result, RunLog, ServiceError};
use crate::workspace::{Artifact, EntryKind, Workspace};
use async_trait::async_trait;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Scratch directory (under the temp root) holding archives and encrypted copies.
pub const BACKUP_DIR: &str = "backups";

pub const ARCHIVE_EXTENSION: &str = "tar.zst";

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Combine `sources` into `<temp>/backups/<name>.<ext>`.
    async fn archive(
        &self,
        sources: &[PathBuf],
        name: &str,
        workspace: &mut Workspace,
    ) -> Result<Artifact>;
}

/// Tar stream compressed with zstd.
pub struct TarZstdArchiver {
    compression_level: i32,
    walk_options: WalkOptions,
    log: RunLog,
}

impl TarZstdArchiver {
    pub fn new(compression_level: i32, exclude_patterns: Vec<String>, log: RunLog) -> Self {
        Self {
            compression_level,
            walk_options: WalkOptions {
                follow_links: false,
                exclude_patterns,
            },
            log,
        }
    }
}

#[async_trait]
impl Archiver for TarZstdArchiver {
    async fn archive(
        &self,
        sources: &[PathBuf],
        name: &str,
        workspace: &mut Workspace,
    ) -> Result<Artifact> {
        if sources.is_empty() {
            return Err(ServiceError::InvalidInput(
                "nothing to archive: no exports and no folders configured".to_string(),
            ));
        }
        if let Some(missing) = sources.iter().find(|s| !s.exists()) {
            return Err(ServiceError::MissingSource(missing.clone()));
        }

        let backup_dir = workspace.scratch_dir(BACKUP_DIR)?;
        let destination = backup_dir.join(format!("{}.{}", name, ARCHIVE_EXTENSION));
        workspace.enqueue(&destination, EntryKind::File)?;

        self.log.msg("Compression started");
        for source in sources {
            let size = calculate_total_size(source, &self.walk_options).unwrap_or(0);
            self.log.msg(format!(
                "Compression input: {} ({})",
                source.display(),
                format_bytes(size)
            ));
        }

        let sources = sources.to_vec();
        let dest = destination.clone();
        let options = self.walk_options.clone();
        let level = self.compression_level;
        tokio::task::spawn_blocking(move || write_archive(&sources, &dest, &options, level))
            .await
            .map_err(|e| ServiceError::Collaborator {
                tool: "archiver".to_string(),
                message: e.to_string(),
            })?
            .map_err(|e| ServiceError::Collaborator {
                tool: "archiver".to_string(),
                message: e.to_string(),
            })?;

        let size = std::fs::metadata(&destination)?.len();
        self.log.msg(format!(
            "Compression ended: {} ({})",
            destination.display(),
            format_bytes(size)
        ));

        Ok(Artifact {
            path: destination,
            produced_by: "archiver",
            transient: true,
        })
    }
}

fn write_archive(
    sources: &[PathBuf],
    destination: &Path,
    options: &WalkOptions,
    level: i32,
) -> std::io::Result<()> {
    let file = BufWriter::new(File::create(destination)?);
    let encoder = zstd::stream::write::Encoder::new(file, level)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for source in sources {
        for entry in walk_input(source, options)? {
            if entry.is_dir {
                builder.append_dir(&entry.archive_path, &entry.path)?;
            } else {
                builder.append_path_with_name(&entry.path, &entry.archive_path)?;
            }
        }
    }

    let encoder = builder.into_inner()?;
    let mut file = encoder.finish()?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::walker::archive_base;
    use std::fs;
    use tempfile::TempDir;

    fn list_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
        use std::io::Read;
        let decoder = zstd::stream::read::Decoder::new(File::open(path).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push((name, content));
        }
        out
    }

    #[tokio::test]
    async fn test_archive_folder_and_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let data = temp_dir.path().join("data");
        fs::create_dir_all(data.join("nested"))?;
        fs::write(data.join("nested/a.txt"), b"alpha")?;
        let single = temp_dir.path().join("notes.txt");
        fs::write(&single, b"notes")?;

        let mut ws = Workspace::open(temp_dir.path().join("work"), RunLog::new())?;
        let archiver = TarZstdArchiver::new(3, Vec::new(), RunLog::new());
        let artifact = archiver
            .archive(&[data, single], "backup-2026-10-18_03-00-00", &mut ws)
            .await?;

        assert!(artifact.transient);
        assert_eq!(artifact.name(), "backup-2026-10-18_03-00-00.tar.zst");
        assert!(artifact.path.starts_with(ws.root().join(BACKUP_DIR)));

        let base = archive_base(temp_dir.path())?;
        let entries = list_archive(&artifact.path);
        let names: Vec<String> = entries
            .iter()
            .map(|(n, _)| {
                Path::new(n.trim_end_matches('/'))
                    .strip_prefix(&base)
                    .unwrap()
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        assert_eq!(
            names,
            vec!["data", "data/nested", "data/nested/a.txt", "notes.txt"]
        );
        assert_eq!(entries[2].1, b"alpha");
        assert_eq!(entries[3].1, b"notes");

        // Scratch dir and archive file are both queued.
        assert_eq!(ws.pending(), 2);
        ws.drain()?;
        assert!(!artifact.path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_folders_with_same_name_both_restore() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let first = temp_dir.path().join("a/uploads");
        let second = temp_dir.path().join("b/uploads");
        fs::create_dir_all(&first)?;
        fs::create_dir_all(&second)?;
        fs::write(first.join("logo.png"), b"AAAA")?;
        fs::write(second.join("logo.png"), b"BBBB")?;

        let mut ws = Workspace::open(temp_dir.path().join("work"), RunLog::new())?;
        let archiver = TarZstdArchiver::new(3, Vec::new(), RunLog::new());
        let artifact = archiver
            .archive(&[first.clone(), second.clone()], "backup", &mut ws)
            .await?;

        let restore = temp_dir.path().join("restore");
        let decoder = zstd::stream::read::Decoder::new(File::open(&artifact.path)?)?;
        tar::Archive::new(decoder).unpack(&restore)?;

        let restored_first = restore.join(archive_base(&first)?).join("logo.png");
        let restored_second = restore.join(archive_base(&second)?).join("logo.png");
        assert_eq!(fs::read(restored_first)?, b"AAAA");
        assert_eq!(fs::read(restored_second)?, b"BBBB");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let mut ws = Workspace::open(temp_dir.path().join("work"), RunLog::new()).unwrap();
        let archiver = TarZstdArchiver::new(3, Vec::new(), RunLog::new());

        let missing = temp_dir.path().join("gone");
        let err = archiver
            .archive(&[missing.clone()], "backup", &mut ws)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::MissingSource(p) if p == missing));
        assert_eq!(ws.pending(), 0);
    }

    #[tokio::test]
    async fn test_no_sources() {
        let temp_dir = TempDir::new().unwrap();
        let mut ws = Workspace::open(temp_dir.path().join("work"), RunLog::new()).unwrap();
        let archiver = TarZstdArchiver::new(3, Vec::new(), RunLog::new());
        assert!(matches!(
            archiver.archive(&[], "backup", &mut ws).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }
}
