//! Generation of the POSIX wrapper script staged for every execution
//!
//! The wrapper is the crash-recovery anchor: it records its own process id,
//! start and end timestamps, and the command's exit code as files in the
//! log directory, so any later process can reconstruct what happened
//! without having been the submitter.

use super::command::{quote, ShellCommand};
use super::ExecutionPaths;
use crate::common::ids::ExecutionId;

/// Render the environment file sourced by the wrapper before the command
/// starts. Always exports the execution-id marker variable.
pub fn env_file_content(execution_id: &ExecutionId, command: &ShellCommand) -> String {
    let mut lines = vec![format!(
        "export {}={}",
        ExecutionId::ENV_VAR,
        quote(&execution_id.to_string())
    )];
    for (key, value) in &command.env {
        lines.push(format!("export {}={}", key, quote(value)));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Render the wrapper script for one execution.
///
/// The script writes `pid` first so a crashed submitter can find the
/// process again, runs the command with stdout/stderr redirected into the
/// log directory, and finishes by writing `exit_code`. Timestamps are
/// ISO-8601 UTC. The `exit_code` file is written last; its presence means
/// the terminal files are complete.
pub fn wrapper_script(command: &ShellCommand, paths: &ExecutionPaths, with_stdin: bool) -> String {
    let log_dir = paths.log_dir.to_string_lossy();
    let workdir = paths.workdir.to_string_lossy();
    let stdin_redirect = if with_stdin {
        format!(" < {}", quote(&paths.stdin_file().to_string_lossy()))
    } else {
        String::new()
    };
    format!(
        r#"#!/bin/sh
set -u
log_dir={log_dir}
echo $$ > "$log_dir/pid"
date -u +%Y-%m-%dT%H:%M:%S%z > "$log_dir/start_time"
. "$log_dir/env.sh"
cd {workdir}
{command_line} > "$log_dir/stdout" 2> "$log_dir/stderr"{stdin_redirect}
code=$?
date -u +%Y-%m-%dT%H:%M:%S%z > "$log_dir/end_time"
echo $code > "$log_dir/exit_code"
exit $code
"#,
        log_dir = quote(&log_dir),
        workdir = quote(&workdir),
        command_line = command.to_command_line(),
        stdin_redirect = stdin_redirect,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> ExecutionPaths {
        ExecutionPaths::new("/data/work", "/data/work/.log")
    }

    #[test]
    fn test_wrapper_records_pid_before_running() {
        let script = wrapper_script(&ShellCommand::new("true"), &paths(), false);
        let pid_pos = script.find("pid\"").unwrap();
        let cmd_pos = script.find("true >").unwrap();
        assert!(pid_pos < cmd_pos);
    }

    #[test]
    fn test_wrapper_writes_exit_code_last() {
        let script = wrapper_script(&ShellCommand::new("true"), &paths(), false);
        let end_pos = script.find("end_time").unwrap();
        let exit_pos = script.find("exit_code").unwrap();
        assert!(end_pos < exit_pos);
        assert!(script.trim_end().ends_with("exit $code"));
    }

    #[test]
    fn test_wrapper_redirects_stdin_when_staged() {
        let script = wrapper_script(&ShellCommand::new("cat"), &paths(), true);
        assert!(script.contains("< /data/work/.log/stdin"));

        let script = wrapper_script(&ShellCommand::new("cat"), &paths(), false);
        assert!(!script.contains("stdin"));
    }

    #[test]
    fn test_env_file_exports_marker_and_command_env() {
        let id = ExecutionId::new();
        let command = ShellCommand::new("run").env("WORKFLOW", "demo pipeline");
        let content = env_file_content(&id, &command);
        assert!(content.contains(&format!(
            "export RUNBRIDGE_EXECUTION_ID={}",
            id
        )));
        assert!(content.contains("export WORKFLOW='demo pipeline'"));
        assert!(content.ends_with('\n'));
    }
}
