//! SSH-remote storage accessor
//!
//! Implemented on top of the `ssh` and `scp` client binaries through the
//! same retrying runner the SSH executor uses. Remote shell commands stand
//! in for filesystem calls: `cat`, `test -e`, `mkdir -p`, `find`.

use super::{require_absolute, StorageAccessor, StorageError, StorageResult};
use crate::executor::{quote, CommandOutput, ShellCommand, ShellRunner, SshRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage accessor for files on an SSH-reachable host
pub struct SshStorageAccessor {
    runner: Arc<SshRunner>,
}

impl SshStorageAccessor {
    /// Create an accessor sharing the given runner
    pub fn new(runner: Arc<SshRunner>) -> Self {
        Self { runner }
    }

    fn command_failed(command: &ShellCommand, output: CommandOutput) -> StorageError {
        StorageError::RemoteCommand {
            command: command.to_command_line(),
            stderr: output.stderr.trim().to_string(),
        }
    }

    fn transport_failed(command: &ShellCommand, err: impl std::fmt::Display) -> StorageError {
        StorageError::RemoteCommand {
            command: command.to_command_line(),
            stderr: err.to_string(),
        }
    }

    async fn run_checked(&self, command: ShellCommand) -> StorageResult<CommandOutput> {
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| Self::transport_failed(&command, e))?;
        if !output.succeeded() {
            return Err(Self::command_failed(&command, output));
        }
        Ok(output)
    }
}

#[async_trait]
impl StorageAccessor for SshStorageAccessor {
    fn location(&self) -> String {
        self.runner.location()
    }

    async fn put(&self, local_source: &Path, target: &Path) -> StorageResult<()> {
        if let Some(parent) = target.parent() {
            self.create_dir(parent).await?;
        }
        let scp = self.runner.target().scp_to_remote(
            &local_source.to_string_lossy(),
            &target.to_string_lossy(),
        );
        let output = self
            .runner
            .run_scp(&scp)
            .await
            .map_err(|e| Self::transport_failed(&scp, e))?;
        if !output.succeeded() {
            return Err(Self::command_failed(&scp, output));
        }
        Ok(())
    }

    async fn put_bytes(&self, content: &[u8], target: &Path) -> StorageResult<()> {
        if let Some(parent) = target.parent() {
            self.create_dir(parent).await?;
        }
        // Streamed over stdin to avoid staging temporary files.
        let command = ShellCommand::new("sh")
            .arg("-c")
            .arg(format!("cat > {}", quote(&target.to_string_lossy())));
        let text = String::from_utf8_lossy(content).into_owned();
        let output = self
            .runner
            .run_with_stdin(&command, &text)
            .await
            .map_err(|e| Self::transport_failed(&command, e))?;
        if !output.succeeded() {
            return Err(Self::command_failed(&command, output));
        }
        Ok(())
    }

    async fn get(&self, source: &Path, local_target: &Path) -> StorageResult<()> {
        let scp = self.runner.target().scp_from_remote(
            &source.to_string_lossy(),
            &local_target.to_string_lossy(),
        );
        let output = self
            .runner
            .run_scp(&scp)
            .await
            .map_err(|e| Self::transport_failed(&scp, e))?;
        if !output.succeeded() {
            return Err(Self::command_failed(&scp, output));
        }
        Ok(())
    }

    async fn read_to_string(&self, path: &Path) -> StorageResult<String> {
        let command = ShellCommand::new("cat").arg(path.to_string_lossy());
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| Self::transport_failed(&command, e))?;
        if output.succeeded() {
            return Ok(output.stdout);
        }
        if output.stderr.contains("No such file or directory") {
            return Err(StorageError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(Self::command_failed(&command, output))
    }

    async fn exists(&self, path: &Path) -> StorageResult<bool> {
        let command = ShellCommand::new("test").arg("-e").arg(path.to_string_lossy());
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| Self::transport_failed(&command, e))?;
        match output.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Self::command_failed(&command, output)),
        }
    }

    async fn create_dir(&self, path: &Path) -> StorageResult<()> {
        let command = ShellCommand::new("mkdir").arg("-p").arg(path.to_string_lossy());
        self.run_checked(command).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        require_absolute(path)?;
        let command = ShellCommand::new("rm").arg(path.to_string_lossy());
        self.run_checked(command).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> StorageResult<()> {
        require_absolute(path)?;
        let command = ShellCommand::new("rm").arg("-r").arg(path.to_string_lossy());
        self.run_checked(command).await?;
        Ok(())
    }

    async fn find(&self, root: &Path) -> StorageResult<Vec<PathBuf>> {
        let command = ShellCommand::new("find")
            .arg(root.to_string_lossy())
            .arg("-mindepth")
            .arg("1");
        let output = self.run_checked(command).await?;
        let mut found = Vec::new();
        for line in output.stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(relative) = Path::new(line).strip_prefix(root) {
                found.push(relative.to_path_buf());
            }
        }
        Ok(found)
    }
}
