//! Unix process states as read from `/proc/<pid>/stat`
//!
//! The letters in field three of the stat line describe a *live* process;
//! termination is only decided by the wrapper's `exit_code` file. The
//! factory here therefore synthesizes distinct terminal codes from that
//! file: `Succeeded`, `Failed`, or `Vanished` when the process is gone but
//! no exit code was ever written.

use crate::execution::{ExecutionStateName, SimpleStateMapper, StateCode};
use std::collections::HashMap;
use std::fmt;

/// State of a Unix process, extended with wrapper-derived terminal codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnixProcState {
    /// `R`: running or runnable
    Running,
    /// `S`: interruptible sleep
    Sleeping,
    /// `D`: uninterruptible disk sleep
    DiskSleep,
    /// `I`: idle kernel thread
    Idle,
    /// `T`: stopped by a job-control signal
    Stopped,
    /// `t`: stopped by a tracer
    TracingStop,
    /// `Z`: exited, not yet reaped. The exit-code file may still be
    /// in flight, so this is not terminal.
    Zombie,
    /// `X`: dead (should never be observed)
    Dead,
    /// Process ended with exit code zero
    Succeeded,
    /// Process ended with a non-zero exit code
    Failed,
    /// Process gone without an exit-code file; the wrapper never got to
    /// finish, e.g. after a node crash or an external `kill -9`
    Vanished,
    /// Nothing could be determined
    NotAvailable,
}

impl fmt::Display for UnixProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl StateCode for UnixProcState {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("R") => UnixProcState::Running,
            Some("S") => UnixProcState::Sleeping,
            Some("D") => UnixProcState::DiskSleep,
            Some("I") => UnixProcState::Idle,
            Some("T") => UnixProcState::Stopped,
            Some("t") => UnixProcState::TracingStop,
            Some("Z") => UnixProcState::Zombie,
            Some("X") => UnixProcState::Dead,
            Some("Succeeded") => UnixProcState::Succeeded,
            Some("Failed") => UnixProcState::Failed,
            Some("Vanished") => UnixProcState::Vanished,
            _ => UnixProcState::NotAvailable,
        }
    }

    fn not_available() -> Self {
        UnixProcState::NotAvailable
    }

    fn is_terminal_code(&self) -> bool {
        matches!(
            self,
            UnixProcState::Succeeded | UnixProcState::Failed | UnixProcState::Vanished
        )
    }

    fn is_unknown_code(&self) -> bool {
        matches!(self, UnixProcState::NotAvailable)
    }

    fn is_success_code(&self) -> bool {
        matches!(self, UnixProcState::Succeeded)
    }
}

impl UnixProcState {
    /// Extract the state letter from a `/proc/<pid>/stat` line.
    ///
    /// The comm field is parenthesized and may itself contain spaces and
    /// parentheses, so the state letter is the first token after the *last*
    /// closing parenthesis.
    pub fn from_stat_line(line: &str) -> Self {
        let after_comm = match line.rfind(')') {
            Some(idx) => &line[idx + 1..],
            None => return UnixProcState::NotAvailable,
        };
        match after_comm.split_whitespace().next() {
            Some(letter) => Self::parse(Some(letter)),
            None => UnixProcState::NotAvailable,
        }
    }

    /// Terminal code for a finished process given the wrapper's exit code,
    /// or `Vanished` when the exit-code file never appeared.
    pub fn from_exit_code(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => UnixProcState::Succeeded,
            Some(_) => UnixProcState::Failed,
            None => UnixProcState::Vanished,
        }
    }
}

/// Mapping of Unix process states onto the generalized state machine.
///
/// Live letters all map to `Running` or `Paused`; a zombie still counts as
/// running because its exit code has not been collected yet.
pub fn unix_state_mapper() -> SimpleStateMapper<UnixProcState> {
    use ExecutionStateName::*;
    SimpleStateMapper::new(HashMap::from([
        (UnixProcState::Running, Running),
        (UnixProcState::Sleeping, Running),
        (UnixProcState::DiskSleep, Running),
        (UnixProcState::Idle, Running),
        (UnixProcState::Stopped, Paused),
        (UnixProcState::TracingStop, Paused),
        (UnixProcState::Zombie, Running),
        (UnixProcState::Dead, Running),
        (UnixProcState::Succeeded, Succeeded),
        (UnixProcState::Failed, Failed),
        (UnixProcState::Vanished, SystemError),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_line_parsing() {
        let line = "1234 (bash) S 1 1234 1234 34816 1234 4194304";
        assert_eq!(UnixProcState::from_stat_line(line), UnixProcState::Sleeping);
    }

    #[test]
    fn test_stat_line_with_parentheses_in_comm() {
        // The comm field may contain spaces and parens.
        let line = "42 (my (odd) name) R 1 42 42 0 -1";
        assert_eq!(UnixProcState::from_stat_line(line), UnixProcState::Running);
    }

    #[test]
    fn test_malformed_stat_line_is_unknown() {
        assert_eq!(
            UnixProcState::from_stat_line("no parens here"),
            UnixProcState::NotAvailable
        );
        assert_eq!(
            UnixProcState::from_stat_line(""),
            UnixProcState::NotAvailable
        );
    }

    #[test]
    fn test_exit_code_classification() {
        assert_eq!(
            UnixProcState::from_exit_code(Some(0)),
            UnixProcState::Succeeded
        );
        assert_eq!(
            UnixProcState::from_exit_code(Some(12)),
            UnixProcState::Failed
        );
        assert_eq!(UnixProcState::from_exit_code(None), UnixProcState::Vanished);
    }

    #[test]
    fn test_zombie_is_not_terminal() {
        assert!(!UnixProcState::Zombie.is_terminal_code());
        assert!(UnixProcState::Vanished.is_terminal_code());
        assert!(UnixProcState::Succeeded.is_success_code());
        assert!(!UnixProcState::Failed.is_success_code());
    }

    #[test]
    fn test_mapper_covers_every_live_letter() {
        let mapper = unix_state_mapper();
        for letter in ["R", "S", "D", "I", "T", "t", "Z", "X"] {
            let code = UnixProcState::parse(Some(letter));
            assert!(!code.is_unknown_code(), "letter {letter} must parse");
            // Every parsed letter must have a table entry; a missing entry
            // would raise UnmappedCode at runtime.
            let state = crate::execution::ExecutionState::start(crate::ExecutionId::new());
            let obs = crate::execution::ForeignState::known(
                code,
                crate::ProcessId::new("1", "localhost"),
                chrono::Utc::now(),
                vec![],
            );
            mapper.transition(state, obs).unwrap();
        }
    }
}
