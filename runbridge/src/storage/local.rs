//! Local-filesystem storage accessor

use super::{require_absolute, StorageAccessor, StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Storage accessor backed by the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalStorageAccessor;

impl LocalStorageAccessor {
    /// Create a new local storage accessor
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageAccessor for LocalStorageAccessor {
    fn location(&self) -> String {
        "localhost".to_string()
    }

    async fn put(&self, local_source: &Path, target: &Path) -> StorageResult<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        tokio::fs::copy(local_source, target)
            .await
            .map_err(|e| io_err(target, e))?;
        Ok(())
    }

    async fn put_bytes(&self, content: &[u8], target: &Path) -> StorageResult<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        tokio::fs::write(target, content)
            .await
            .map_err(|e| io_err(target, e))
    }

    async fn get(&self, source: &Path, local_target: &Path) -> StorageResult<()> {
        tokio::fs::copy(source, local_target)
            .await
            .map_err(|e| io_err(source, e))?;
        Ok(())
    }

    async fn read_to_string(&self, path: &Path) -> StorageResult<String> {
        tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                io_err(path, e)
            }
        })
    }

    async fn exists(&self, path: &Path) -> StorageResult<bool> {
        Ok(tokio::fs::try_exists(path)
            .await
            .map_err(|e| io_err(path, e))?)
    }

    async fn create_dir(&self, path: &Path) -> StorageResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        require_absolute(path)?;
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn remove_dir(&self, path: &Path) -> StorageResult<()> {
        require_absolute(path)?;
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn find(&self, root: &Path) -> StorageResult<Vec<PathBuf>> {
        let root = root.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for entry in walkdir::WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| StorageError::Io {
                    path: root.clone(),
                    source: e.into(),
                })?;
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .expect("walkdir yields paths below its root")
                    .to_path_buf();
                found.push(relative);
            }
            Ok::<_, StorageError>(found)
        })
        .await
        .expect("find task panicked")?;
        Ok(entries)
    }
}
