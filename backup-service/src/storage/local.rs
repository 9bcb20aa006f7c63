//! Local filesystem storage target.

use super::{StorageBackend, UploadedRef};
use crate::utils::{Result, RunLog, ServiceError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Slots stored as plain files directly under `root`.
pub struct LocalBackend {
    root: PathBuf,
    log: RunLog,
}

impl LocalBackend {
    pub fn new(root: PathBuf, log: RunLog) -> Result<Self> {
        if root.as_os_str().is_empty() {
            return Err(ServiceError::Config(
                "local storage path cannot be empty".to_string(),
            ));
        }
        std::fs::create_dir_all(&root)
            .map_err(|e| ServiceError::storage(format!("local:{}", root.display()), e))?;
        Ok(Self { root, log })
    }

    fn slot_path(&self, slot: &str) -> Result<PathBuf> {
        if slot.is_empty() || slot.contains(['/', '\\']) || slot == "." || slot == ".." {
            return Err(ServiceError::InvalidInput(format!(
                "invalid slot name \"{}\"",
                slot
            )));
        }
        Ok(self.root.join(slot))
    }

    fn err(&self, e: impl std::fmt::Display) -> ServiceError {
        ServiceError::storage(self.describe(), e)
    }

    /// Copy into `<slot>.partial`, then rename onto the slot name.
    async fn place(&self, source: &Path, slot: &str) -> Result<UploadedRef> {
        let dest = self.slot_path(slot)?;
        let partial = self.root.join(format!("{}.partial", slot));

        let size = match tokio::fs::copy(source, &partial).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(self.err(format!("copy {} failed: {}", source.display(), e)));
            }
        };
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| self.err(format!("rename into {} failed: {}", slot, e)))?;

        Ok(UploadedRef {
            name: slot.to_string(),
            size,
        })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn upload(&self, source: &Path, slot: &str) -> Result<UploadedRef> {
        self.log.msg(format!(
            "Filesystem: copying {} to the backup storage location",
            source.display()
        ));
        let uploaded = self.place(source, slot).await?;
        self.log.msg(format!(
            "Filesystem: copy ended: {}",
            self.root.join(slot).display()
        ));
        Ok(uploaded)
    }

    async fn delete_slot(&self, slot: &str) -> Result<()> {
        let path = self.slot_path(slot)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.log.msg(format!("Filesystem: backup deleted {}", slot));
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.err(format!("delete {} failed: {}", slot, e))),
        }
    }

    async fn copy_from_slot(&self, source_slot: &str, dest_slot: &str) -> Result<UploadedRef> {
        let source = self.slot_path(source_slot)?;
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(self.err(format!("slot {} does not exist", source_slot)));
        }
        self.place(&source, dest_slot).await
    }

    async fn slot_exists(&self, slot: &str) -> Result<bool> {
        let path = self.slot_path(slot)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn backend(temp_dir: &TempDir) -> LocalBackend {
        LocalBackend::new(temp_dir.path().join("store"), RunLog::new()).unwrap()
    }

    #[tokio::test]
    async fn test_upload_overwrites_slot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = backend(&temp_dir);
        let source = temp_dir.path().join("backup.tar.zst");

        fs::write(&source, b"first")?;
        store.upload(&source, "backup-1day-old").await?;
        fs::write(&source, b"second run")?;
        let uploaded = store.upload(&source, "backup-1day-old").await?;

        assert_eq!(uploaded.size, 10);
        assert_eq!(fs::read(temp_dir.path().join("store/backup-1day-old"))?, b"second run");
        assert!(!temp_dir.path().join("store/backup-1day-old.partial").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_slot_is_ok() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = backend(&temp_dir);
        store.delete_slot("backup-week").await?;
        store.delete_slot("backup-week").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_and_exists() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = backend(&temp_dir);
        let source = temp_dir.path().join("backup.tar.zst");
        fs::write(&source, b"payload")?;

        assert!(!store.slot_exists("backup-1day-old").await?);
        store.upload(&source, "backup-1day-old").await?;
        assert!(store.slot_exists("backup-1day-old").await?);

        let copied = store.copy_from_slot("backup-1day-old", "backup-month").await?;
        assert_eq!(copied.size, 7);
        assert!(store.slot_exists("backup-month").await?);
        assert!(store.slot_exists("backup-1day-old").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_from_missing_slot_fails() {
        let temp_dir = TempDir::new().unwrap();
        let store = backend(&temp_dir);
        let err = store
            .copy_from_slot("backup-1day-old", "backup-week")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Storage { .. }));
    }

    #[tokio::test]
    async fn test_rejects_slot_names_with_separators() {
        let temp_dir = TempDir::new().unwrap();
        let store = backend(&temp_dir);
        assert!(store.delete_slot("../outside").await.is_err());
        assert!(store.slot_exists("").await.is_err());
    }
}
