//! File-storage capability abstracting over local and SSH-remote filesystems
//!
//! Executors consume this capability to stage wrapper scripts and to collect
//! log files and outputs; they never touch a filesystem directly.

mod local;
mod ssh;

pub use local::LocalStorageAccessor;
pub use ssh::SshStorageAccessor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by storage accessors
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO operation failed
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path the operation was attempted on
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Removal operations require absolute paths
    #[error("Refusing to remove relative path {path}")]
    RelativeRemoval {
        /// The rejected relative path
        path: PathBuf,
    },

    /// A remote shell command used to implement the operation failed
    #[error("Remote storage command failed ({command}): {stderr}")]
    RemoteCommand {
        /// The command that failed
        command: String,
        /// Captured standard error of the failed command
        stderr: String,
    },

    /// The requested path does not exist
    #[error("Path not found: {path}")]
    NotFound {
        /// The missing path
        path: PathBuf,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Capability for file operations against local or remote storage.
///
/// `remove_file` and `remove_dir` require absolute paths as a safety
/// invariant. `find` returns paths relative to the queried root, excluding
/// the root itself.
#[async_trait]
pub trait StorageAccessor: Send + Sync {
    /// Label for the infrastructure the files live on
    fn location(&self) -> String;

    /// Copy a local file to `target` on this storage
    async fn put(&self, local_source: &Path, target: &Path) -> StorageResult<()>;

    /// Write raw bytes to `target` on this storage
    async fn put_bytes(&self, content: &[u8], target: &Path) -> StorageResult<()>;

    /// Copy `source` on this storage to a local file
    async fn get(&self, source: &Path, local_target: &Path) -> StorageResult<()>;

    /// Read a file on this storage into a string
    async fn read_to_string(&self, path: &Path) -> StorageResult<String>;

    /// Whether a path exists on this storage
    async fn exists(&self, path: &Path) -> StorageResult<bool>;

    /// Create a directory (and missing parents) on this storage
    async fn create_dir(&self, path: &Path) -> StorageResult<()>;

    /// Remove a single file; `path` must be absolute
    async fn remove_file(&self, path: &Path) -> StorageResult<()>;

    /// Remove a directory recursively; `path` must be absolute
    async fn remove_dir(&self, path: &Path) -> StorageResult<()>;

    /// List all paths below `root`, relative to `root` and excluding it
    async fn find(&self, root: &Path) -> StorageResult<Vec<PathBuf>>;
}

/// Shared absolute-path check for removal operations
pub(crate) fn require_absolute(path: &Path) -> StorageResult<()> {
    if !path.is_absolute() {
        return Err(StorageError::RelativeRemoval {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}
