//! IBM Spectrum LSF command set: `bsub`, `bjobs`, `bkill`, `bwait`

use super::{CommandSet, JobStatusLine};
use crate::execution::{ExecutionStateName, SimpleStateMapper, StateCode};
use crate::executor::{
    ExecutionPaths, ExecutionSettings, ExecutorError, ExecutorResult, KillSignal, ShellCommand,
};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// LSF job states as reported by `bjobs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LsfState {
    /// `PEND`: waiting in a queue
    Pend,
    /// `PROV`: being provisioned to a power-saved host
    Prov,
    /// `WAIT`: chunk-job member waiting to run
    Wait,
    /// `RUN`: running
    Run,
    /// `PSUSP`: suspended while pending
    Psusp,
    /// `USUSP`: suspended by its owner or an administrator
    Ususp,
    /// `SSUSP`: suspended by the system
    Ssusp,
    /// `DONE`: finished with exit code zero
    Done,
    /// `EXIT`: finished with a non-zero exit code
    Exit,
    /// `ZOMBI`: unreapable after an execution-host failure
    Zombi,
    /// `UNKWN`: the management host lost contact with the execution host
    Unkwn,
    /// Nothing could be determined
    NotAvailable,
}

impl fmt::Display for LsfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            LsfState::Pend => "PEND",
            LsfState::Prov => "PROV",
            LsfState::Wait => "WAIT",
            LsfState::Run => "RUN",
            LsfState::Psusp => "PSUSP",
            LsfState::Ususp => "USUSP",
            LsfState::Ssusp => "SSUSP",
            LsfState::Done => "DONE",
            LsfState::Exit => "EXIT",
            LsfState::Zombi => "ZOMBI",
            LsfState::Unkwn => "UNKWN",
            LsfState::NotAvailable => "NOT_AVAILABLE",
        };
        write!(f, "{}", word)
    }
}

impl StateCode for LsfState {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("PEND") => LsfState::Pend,
            Some("PROV") => LsfState::Prov,
            Some("WAIT") => LsfState::Wait,
            Some("RUN") => LsfState::Run,
            Some("PSUSP") => LsfState::Psusp,
            Some("USUSP") => LsfState::Ususp,
            Some("SSUSP") => LsfState::Ssusp,
            Some("DONE") => LsfState::Done,
            Some("EXIT") => LsfState::Exit,
            Some("ZOMBI") => LsfState::Zombi,
            Some("UNKWN") => LsfState::Unkwn,
            _ => LsfState::NotAvailable,
        }
    }

    fn not_available() -> Self {
        LsfState::NotAvailable
    }

    fn is_terminal_code(&self) -> bool {
        matches!(self, LsfState::Done | LsfState::Exit | LsfState::Zombi)
    }

    fn is_unknown_code(&self) -> bool {
        matches!(self, LsfState::Unkwn | LsfState::NotAvailable)
    }

    fn is_success_code(&self) -> bool {
        matches!(self, LsfState::Done)
    }
}

/// `bsub` prints `Job <1234> is submitted to queue <short>.`
fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Job <(\d+)>").expect("static regex"))
}

/// Command set for LSF clusters
#[derive(Debug, Clone, Default)]
pub struct LsfCommandSet;

impl LsfCommandSet {
    /// Create the LSF command set
    pub fn new() -> Self {
        Self
    }
}

impl CommandSet for LsfCommandSet {
    type Code = LsfState;

    fn name(&self) -> &'static str {
        "LSF"
    }

    fn submitted_code(&self) -> LsfState {
        LsfState::Pend
    }

    fn state_mapper(&self) -> SimpleStateMapper<LsfState> {
        use ExecutionStateName::*;
        SimpleStateMapper::new(HashMap::from([
            (LsfState::Pend, Pending),
            (LsfState::Prov, Pending),
            (LsfState::Wait, Pending),
            (LsfState::Run, Running),
            (LsfState::Psusp, Held),
            (LsfState::Ususp, Paused),
            (LsfState::Ssusp, Paused),
            (LsfState::Done, Succeeded),
            (LsfState::Exit, Failed),
            (LsfState::Zombi, SystemError),
        ]))
    }

    fn submit_command(
        &self,
        wrapper: &Path,
        paths: &ExecutionPaths,
        settings: &ExecutionSettings,
    ) -> ShellCommand {
        let mut command = ShellCommand::new("bsub")
            .arg("-cwd")
            .arg(paths.workdir.to_string_lossy())
            .arg("-oo")
            .arg(paths.log_dir.join("scheduler_stdout").to_string_lossy())
            .arg("-eo")
            .arg(paths.log_dir.join("scheduler_stderr").to_string_lossy());
        if let Some(name) = &settings.job_name {
            command = command.arg("-J").arg(name);
        }
        if let Some(queue) = &settings.queue {
            command = command.arg("-q").arg(queue);
        }
        if let Some(group) = &settings.accounting_name {
            command = command.arg("-G").arg(group);
        }
        if let Some(minutes) = settings.walltime_minutes() {
            command = command.arg("-W").arg(minutes.to_string());
        }
        if let Some(memory_kib) = settings.memory_kib {
            // LSF takes memory limits in MB with LSF_UNIT_FOR_LIMITS=MB.
            let mb = memory_kib.div_ceil(1024);
            command = command
                .arg("-M")
                .arg(mb.to_string())
                .arg("-R")
                .arg(format!("rusage[mem={}]", mb));
        }
        if let Some(cores) = settings.cores() {
            command = command.arg("-n").arg(cores.to_string());
        }
        command.arg("/bin/sh").arg(wrapper.to_string_lossy())
    }

    fn parse_job_id(&self, stdout: &str) -> ExecutorResult<String> {
        job_id_pattern()
            .captures(stdout)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| ExecutorError::Protocol {
                reason: format!("no job id in bsub output: {:?}", stdout.trim()),
            })
    }

    fn finished_code(&self, exit_code: i32) -> LsfState {
        if exit_code == 0 {
            LsfState::Done
        } else {
            LsfState::Exit
        }
    }

    fn status_command(&self, job_id: &str) -> ShellCommand {
        ShellCommand::new("bjobs")
            .arg("-noheader")
            .arg("-o")
            .arg("jobid stat exit_code delimiter=':'")
            .arg(job_id)
    }

    /// `bjobs` output must contain exactly one line for the queried job.
    /// Zero lines means the job aged out of the bookkeeping; more than one
    /// is a protocol violation.
    fn parse_status(&self, stdout: &str, job_id: &str) -> ExecutorResult<Option<JobStatusLine>> {
        let matching: Vec<&str> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("Job <"))
            .collect();
        if matching.is_empty() {
            return Ok(None);
        }
        if matching.len() > 1 {
            return Err(ExecutorError::Protocol {
                reason: format!(
                    "expected one bjobs line for job {}, got {}",
                    job_id,
                    matching.len()
                ),
            });
        }
        let fields: Vec<&str> = matching[0].split(':').collect();
        if fields.len() < 3 {
            return Err(ExecutorError::Protocol {
                reason: format!("malformed bjobs line: {:?}", matching[0]),
            });
        }
        if fields[0] != job_id {
            return Err(ExecutorError::Protocol {
                reason: format!(
                    "bjobs answered for job {} instead of {}",
                    fields[0], job_id
                ),
            });
        }
        if LsfState::parse(Some(fields[1])) == LsfState::NotAvailable {
            return Err(ExecutorError::Protocol {
                reason: format!("invalid bjobs state word: {:?}", fields[1]),
            });
        }
        // "-" means no exit code reported; DONE jobs always exited with 0.
        let exit_code = fields[2].parse::<i32>().ok();
        Ok(Some(JobStatusLine {
            job_id: fields[0].to_string(),
            state: Some(fields[1].to_string()),
            exit_code,
            reasons: vec![],
        }))
    }

    fn kill_command(&self, job_id: &str, signal: KillSignal) -> ShellCommand {
        ShellCommand::new("bkill")
            .arg("-s")
            .arg(signal.name())
            .arg(job_id)
    }

    fn kill_means_gone(&self, stderr: &str) -> bool {
        stderr.contains("No matching job found")
            || stderr.contains("Job has already finished")
    }

    fn wait_command(&self, job_id: &str) -> Option<ShellCommand> {
        Some(
            ShellCommand::new("bwait")
                .arg("-w")
                .arg(format!("done({}) || exit({})", job_id, job_id)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::ProcessId;
    use chrono::Utc;

    fn pid() -> ProcessId {
        ProcessId::new("1234", "cluster")
    }

    #[test]
    fn test_parse_job_id_from_bsub_banner() {
        let set = LsfCommandSet::new();
        let id = set
            .parse_job_id("Job <8765432> is submitted to queue <short>.\n")
            .unwrap();
        assert_eq!(id, "8765432");
    }

    #[test]
    fn test_parse_job_id_skips_preamble_noise() {
        let set = LsfCommandSet::new();
        let id = set
            .parse_job_id(
                "Warning: job being submitted without an AFS token.\n\
                 Memory reservation defaults applied.\n\
                 Job <54321> is submitted to queue <short>.\n",
            )
            .unwrap();
        assert_eq!(id, "54321");
    }

    #[test]
    fn test_parse_job_id_rejects_garbage() {
        let set = LsfCommandSet::new();
        let err = set.parse_job_id("Request aborted by esub.\n").unwrap_err();
        assert!(matches!(err, ExecutorError::Protocol { .. }));
    }

    #[test]
    fn test_parse_status_single_line() {
        let set = LsfCommandSet::new();
        let line = set.parse_status("1234:RUN:-\n", "1234").unwrap().unwrap();
        assert_eq!(line.state.as_deref(), Some("RUN"));
        assert_eq!(line.exit_code, None);
    }

    #[test]
    fn test_parse_status_finished_job_with_exit_code() {
        let set = LsfCommandSet::new();
        let line = set.parse_status("1234:EXIT:12\n", "1234").unwrap().unwrap();
        assert_eq!(line.state.as_deref(), Some("EXIT"));
        assert_eq!(line.exit_code, Some(12));
    }

    #[test]
    fn test_parse_status_unknown_job_yields_none() {
        let set = LsfCommandSet::new();
        let result = set.parse_status("Job <1234> is not found\n", "1234").unwrap();
        assert!(result.is_none());
        let result = set.parse_status("", "1234").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_parse_status_multiple_lines_violates_protocol() {
        let set = LsfCommandSet::new();
        let err = set
            .parse_status("1234:RUN:-\n1234:RUN:-\n", "1234")
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Protocol { .. }));
    }

    #[test]
    fn test_parse_status_wrong_job_id_violates_protocol() {
        let set = LsfCommandSet::new();
        let err = set.parse_status("9999:RUN:-\n", "1234").unwrap_err();
        assert!(matches!(err, ExecutorError::Protocol { .. }));
    }

    #[test]
    fn test_done_without_exit_code_normalizes_to_zero() {
        // bjobs reports "-" for DONE jobs; success implies exit 0.
        let fs = LsfState::as_foreign_state(pid(), Some("DONE"), None, Utc::now(), vec![]);
        assert!(fs.is_terminal());
        assert_eq!(fs.exit_code(), Some(0));
    }

    #[test]
    fn test_unkwn_is_an_unknown_observation() {
        let fs = LsfState::as_foreign_state(pid(), Some("UNKWN"), None, Utc::now(), vec![]);
        assert!(!fs.is_known());
    }

    #[test]
    fn test_submit_command_includes_resources() {
        let set = LsfCommandSet::new();
        let paths = ExecutionPaths::new("/data/work", "/data/work/.log");
        let settings = ExecutionSettings {
            job_name: Some("demo".into()),
            queue: Some("short".into()),
            memory_kib: Some(4 * 1024 * 1024),
            milli_cpus: Some(2000),
            walltime: Some(std::time::Duration::from_secs(3600)),
            accounting_name: None,
        };
        let line = set
            .submit_command(Path::new("/data/work/.log/wrapper.sh"), &paths, &settings)
            .to_command_line();
        assert!(line.starts_with("bsub "));
        assert!(line.contains("-J demo"));
        assert!(line.contains("-q short"));
        assert!(line.contains("-W 60"));
        assert!(line.contains("-M 4096"));
        assert!(line.contains("'rusage[mem=4096]'"));
        assert!(line.contains("-n 2"));
        assert!(line.ends_with("/bin/sh /data/work/.log/wrapper.sh"));
    }

    #[test]
    fn test_mapper_covers_all_known_states() {
        let set = LsfCommandSet::new();
        let mapper = set.state_mapper();
        for word in [
            "PEND", "PROV", "WAIT", "RUN", "PSUSP", "USUSP", "SSUSP", "DONE", "EXIT", "ZOMBI",
        ] {
            let code = LsfState::parse(Some(word));
            let state = crate::execution::ExecutionState::start(crate::ExecutionId::new());
            let obs = crate::execution::ForeignState::known(code, pid(), Utc::now(), vec![]);
            mapper.transition(state, obs).unwrap();
        }
    }
}
