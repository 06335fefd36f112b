//! Shell command representation and per-execution resource settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A command to run on some compute backend: argv, environment, and
/// working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    /// Program to execute
    pub program: String,
    /// Arguments, in order
    pub args: Vec<String>,
    /// Environment variables exported for the command
    pub env: BTreeMap<String, String>,
    /// Working directory the command runs in
    pub workdir: Option<PathBuf>,
}

impl ShellCommand {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Render the command as a single shell line with each word quoted,
    /// safe to pass through `bash -c` or an `ssh` remote command.
    pub fn to_command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|word| quote(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_command_line())
    }
}

/// Single-quote a word for POSIX shells
pub fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Resource requests and scheduling hints for one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Job name shown in backend queues
    pub job_name: Option<String>,
    /// Requested memory, in KiB
    pub memory_kib: Option<u64>,
    /// Requested CPU, in milliCPU units (1000 = one core)
    pub milli_cpus: Option<u32>,
    /// Maximum wall-clock runtime
    pub walltime: Option<Duration>,
    /// Target queue or partition
    pub queue: Option<String>,
    /// Accounting name / project the job is billed to
    pub accounting_name: Option<String>,
}

impl ExecutionSettings {
    /// Requested whole cores, rounded up from milliCPU
    pub fn cores(&self) -> Option<u32> {
        self.milli_cpus.map(|m| m.div_ceil(1000).max(1))
    }

    /// Requested walltime in whole minutes, rounded up
    pub fn walltime_minutes(&self) -> Option<u64> {
        self.walltime.map(|w| (w.as_secs() + 59) / 60)
    }
}
