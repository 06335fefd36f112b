//! Shell runners: run a [`ShellCommand`] locally or on an SSH-remote host
//!
//! Cluster executors and the Kubernetes executor use a runner purely as a
//! shell-command transport; the SSH executor builds its whole backend on
//! top of one.

use super::command::{quote, ShellCommand};
use super::{ExecutorError, ExecutorResult};
use crate::common::retry::RetryPolicy;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// Captured output of one finished shell command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with code zero
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Standard output split into non-empty lines
    pub fn stdout_lines(&self) -> Vec<&str> {
        self.stdout.lines().filter(|l| !l.trim().is_empty()).collect()
    }

    /// Error for a command that was expected to succeed
    pub fn into_failure(self, command: &ShellCommand) -> ExecutorError {
        ExecutorError::CommandFailed {
            command: command.to_command_line(),
            exit_code: self.exit_code,
            stderr: self.stderr,
        }
    }
}

/// Transport capability: run one shell command and capture its output
#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// Label for the infrastructure commands run on
    fn location(&self) -> String;

    /// Run a command and capture stdout/stderr
    async fn run(&self, command: &ShellCommand) -> ExecutorResult<CommandOutput>;

    /// Run a command, feeding `stdin` to it
    async fn run_with_stdin(
        &self,
        command: &ShellCommand,
        stdin: &str,
    ) -> ExecutorResult<CommandOutput>;
}

/// Runner executing commands as local child processes
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    /// Create a local runner
    pub fn new() -> Self {
        Self
    }

    fn build(&self, command: &ShellCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_inner(
        &self,
        command: &ShellCommand,
        stdin: Option<&str>,
    ) -> ExecutorResult<CommandOutput> {
        let mut child = self.build(command).spawn()?;
        if let Some(input) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle.write_all(input.as_bytes()).await?;
            }
        }
        drop(child.stdin.take());
        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl ShellRunner for LocalRunner {
    fn location(&self) -> String {
        "localhost".to_string()
    }

    async fn run(&self, command: &ShellCommand) -> ExecutorResult<CommandOutput> {
        self.run_inner(command, None).await
    }

    async fn run_with_stdin(
        &self,
        command: &ShellCommand,
        stdin: &str,
    ) -> ExecutorResult<CommandOutput> {
        self.run_inner(command, Some(stdin)).await
    }
}

/// Connection coordinates for an SSH-remote host
#[derive(Debug, Clone)]
pub struct SshTarget {
    /// Remote user name
    pub user: String,
    /// Remote host
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Identity file, when not using the agent
    pub identity_file: Option<PathBuf>,
    /// Connection timeout passed to the ssh client, in seconds
    pub connect_timeout_secs: u64,
}

impl SshTarget {
    /// Create a target with default port and timeouts
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Base `ssh` invocation for one remote command line
    pub fn ssh_command(&self, remote_command_line: &str) -> ShellCommand {
        let mut command = ShellCommand::new("ssh")
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        if let Some(identity) = &self.identity_file {
            command = command.arg("-i").arg(identity.to_string_lossy());
        }
        command.arg(self.destination()).arg(remote_command_line)
    }

    /// `scp` invocation copying a local file to a remote path
    pub fn scp_to_remote(&self, local: &str, remote: &str) -> ShellCommand {
        let mut command = ShellCommand::new("scp")
            .arg("-P")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes");
        if let Some(identity) = &self.identity_file {
            command = command.arg("-i").arg(identity.to_string_lossy());
        }
        command
            .arg(local)
            .arg(format!("{}:{}", self.destination(), quote(remote)))
    }

    /// `scp` invocation copying a remote file to a local path
    pub fn scp_from_remote(&self, remote: &str, local: &str) -> ShellCommand {
        let mut command = ShellCommand::new("scp")
            .arg("-P")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes");
        if let Some(identity) = &self.identity_file {
            command = command.arg("-i").arg(identity.to_string_lossy());
        }
        command
            .arg(format!("{}:{}", self.destination(), quote(remote)))
            .arg(local)
    }
}

/// Stderr fragments that identify connection-class failures worth retrying
const RETRYABLE_SSH_ERRORS: &[&str] = &[
    "channel open failed",
    "connection lost",
    "connection closed",
    "connection refused",
    "connection timed out",
    "connection reset",
    "broken pipe",
    "could not resolve hostname",
];

/// Whether an ssh/scp invocation failed on the connection rather than the
/// remote command. OpenSSH reserves exit code 255 for client-side errors.
pub(crate) fn is_connection_failure(output: &CommandOutput) -> bool {
    if output.exit_code != Some(255) {
        return false;
    }
    let stderr = output.stderr.to_lowercase();
    RETRYABLE_SSH_ERRORS.iter().any(|needle| stderr.contains(needle))
}

/// Runner executing commands on a remote host through the `ssh` client.
///
/// All operations go through one retrying context: connection-class
/// failures are retried with bounded exponential backoff and jitter;
/// everything else is reraised immediately.
#[derive(Debug, Clone)]
pub struct SshRunner {
    target: SshTarget,
    local: LocalRunner,
    retry: RetryPolicy,
}

impl SshRunner {
    /// Create a runner for `target` with the given retry policy
    pub fn new(target: SshTarget, retry: RetryPolicy) -> Self {
        Self {
            target,
            local: LocalRunner::new(),
            retry,
        }
    }

    /// The remote target this runner talks to
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Render `command` as one remote shell line, exporting its
    /// environment and changing into its workdir first.
    fn remote_command_line(command: &ShellCommand) -> String {
        let mut parts: Vec<String> = Vec::new();
        for (key, value) in &command.env {
            parts.push(format!("export {}={}", key, quote(value)));
        }
        if let Some(dir) = &command.workdir {
            parts.push(format!("cd {}", quote(&dir.to_string_lossy())));
        }
        parts.push(command.to_command_line());
        parts.join(" && ")
    }

    async fn run_remote(
        &self,
        command: &ShellCommand,
        stdin: Option<&str>,
    ) -> ExecutorResult<CommandOutput> {
        let ssh_command = self.target.ssh_command(&Self::remote_command_line(command));
        self.retry
            .retry(ExecutorError::is_transient, || {
                let ssh_command = ssh_command.clone();
                async move {
                    let output = match stdin {
                        Some(input) => self.local.run_with_stdin(&ssh_command, input).await?,
                        None => self.local.run(&ssh_command).await?,
                    };
                    if is_connection_failure(&output) {
                        return Err(ExecutorError::Connection {
                            reason: output.stderr.trim().to_string(),
                        });
                    }
                    Ok(output)
                }
            })
            .await
    }

    /// Run an `scp` transfer through the same retrying context
    pub async fn run_scp(&self, scp_command: &ShellCommand) -> ExecutorResult<CommandOutput> {
        self.retry
            .retry(ExecutorError::is_transient, || async {
                let output = self.local.run(scp_command).await?;
                if is_connection_failure(&output) {
                    return Err(ExecutorError::Connection {
                        reason: output.stderr.trim().to_string(),
                    });
                }
                Ok(output)
            })
            .await
    }
}

#[async_trait]
impl ShellRunner for SshRunner {
    fn location(&self) -> String {
        self.target.host.clone()
    }

    async fn run(&self, command: &ShellCommand) -> ExecutorResult<CommandOutput> {
        self.run_remote(command, None).await
    }

    async fn run_with_stdin(
        &self,
        command: &ShellCommand,
        stdin: &str,
    ) -> ExecutorResult<CommandOutput> {
        self.run_remote(command, Some(stdin)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_runner_captures_stdout_and_exit_code() {
        let runner = LocalRunner::new();
        let output = runner
            .run(&ShellCommand::new("sh").arg("-c").arg("echo hello; exit 3"))
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert!(!output.succeeded());
    }

    #[tokio::test]
    async fn test_local_runner_feeds_stdin() {
        let runner = LocalRunner::new();
        let output = runner
            .run_with_stdin(&ShellCommand::new("cat"), "piped input")
            .await
            .unwrap();
        assert!(output.succeeded());
        assert_eq!(output.stdout, "piped input");
    }

    #[tokio::test]
    async fn test_local_runner_applies_env_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new();
        let command = ShellCommand::new("sh")
            .arg("-c")
            .arg("echo $MARKER; pwd")
            .env("MARKER", "present")
            .workdir(dir.path());
        let output = runner.run(&command).await.unwrap();
        let lines = output.stdout_lines();
        assert_eq!(lines[0], "present");
        assert!(lines[1].ends_with(
            dir.path()
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
        ));
    }

    #[test]
    fn test_connection_failure_classification() {
        let conn = CommandOutput {
            exit_code: Some(255),
            stdout: String::new(),
            stderr: "ssh: connect to host example port 22: Connection refused".to_string(),
        };
        assert!(is_connection_failure(&conn));

        // A remote command failing with 255-but-clean stderr is not a
        // connection problem, neither is any other exit code.
        let remote = CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "Connection refused".to_string(),
        };
        assert!(!is_connection_failure(&remote));
    }

    #[test]
    fn test_ssh_command_shape() {
        let target = SshTarget::new("worker", "cluster.example.org");
        let command = target.ssh_command("bjobs -noheader 123");
        assert_eq!(command.program, "ssh");
        assert!(command
            .args
            .contains(&"worker@cluster.example.org".to_string()));
        assert_eq!(command.args.last().unwrap(), "bjobs -noheader 123");
    }

    #[test]
    fn test_remote_command_line_exports_env_and_workdir() {
        let command = ShellCommand::new("bash")
            .arg("/logs/wrapper.sh")
            .env("RUNBRIDGE_EXECUTION_ID", "01H")
            .workdir("/data/work dir");
        let line = SshRunner::remote_command_line(&command);
        assert_eq!(
            line,
            "export RUNBRIDGE_EXECUTION_ID=01H && cd '/data/work dir' && bash /logs/wrapper.sh"
        );
    }
}
