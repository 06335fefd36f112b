//! Typed wrappers around backend-native state observations

use crate::common::ids::ProcessId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Closed per-backend state code enumeration.
///
/// Every backend (Unix `/proc` letters, LSF `bjobs` names, Slurm `sacct`
/// codes, Kubernetes pod phases) implements this for its own enum. Parsing
/// is total: input that cannot be recognized maps to the backend's
/// not-available sentinel, which classifies as unknown.
pub trait StateCode:
    fmt::Debug + fmt::Display + Clone + PartialEq + Eq + Hash + Send + Sync + 'static
{
    /// Parse a raw backend string; `None` or unrecognized input yields the
    /// not-available sentinel.
    fn parse(raw: Option<&str>) -> Self;

    /// The sentinel value used when the backend could not be queried or
    /// returned nothing recognizable.
    fn not_available() -> Self;

    /// Whether this code means the backend process has ended
    fn is_terminal_code(&self) -> bool;

    /// Whether this code carries no usable information about the process
    fn is_unknown_code(&self) -> bool;

    /// Whether this is the backend's "ended successfully" code. Used to
    /// normalize an absent exit code to `0`.
    fn is_success_code(&self) -> bool {
        false
    }

    /// Classify a raw observation into a [`ForeignState`].
    ///
    /// Pure and total over the documented input domain: unparseable input
    /// becomes an unknown observation, terminal codes become terminal
    /// observations carrying the exit code if known, everything else is an
    /// ordinary observation.
    fn as_foreign_state(
        pid: ProcessId,
        raw: Option<&str>,
        exit_code: Option<i32>,
        observed_at: DateTime<Utc>,
        reasons: Vec<String>,
    ) -> ForeignState<Self>
    where
        Self: Sized,
    {
        Self::parse(raw).into_foreign_state(pid, exit_code, observed_at, reasons)
    }

    /// Classify an already-typed code into a [`ForeignState`], applying the
    /// same rules as [`StateCode::as_foreign_state`].
    fn into_foreign_state(
        self,
        pid: ProcessId,
        exit_code: Option<i32>,
        observed_at: DateTime<Utc>,
        reasons: Vec<String>,
    ) -> ForeignState<Self>
    where
        Self: Sized,
    {
        if self.is_unknown_code() {
            ForeignState::unknown(self, pid, observed_at, reasons)
        } else if self.is_terminal_code() {
            let exit_code = exit_code.or(if self.is_success_code() { Some(0) } else { None });
            ForeignState::terminal(self, pid, observed_at, reasons, exit_code)
        } else {
            ForeignState::known(self, pid, observed_at, reasons)
        }
    }
}

/// Flavor of a foreign-state observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForeignStateFlavor {
    /// Ordinary known, non-terminal observation
    Known,
    /// The backend could not be queried or returned nothing parseable
    Unknown,
    /// The backend process has ended
    Terminal,
}

/// One immutable observation of a backend-native state.
///
/// A new observation always produces a new `ForeignState`; existing values
/// are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignState<S: StateCode> {
    code: S,
    pid: ProcessId,
    observed_at: DateTime<Utc>,
    reasons: Vec<String>,
    flavor: ForeignStateFlavor,
    exit_code: Option<i32>,
}

impl<S: StateCode> ForeignState<S> {
    /// Create an ordinary known observation
    pub fn known(code: S, pid: ProcessId, observed_at: DateTime<Utc>, reasons: Vec<String>) -> Self {
        Self {
            code,
            pid,
            observed_at,
            reasons,
            flavor: ForeignStateFlavor::Known,
            exit_code: None,
        }
    }

    /// Create an unknown observation (backend unreachable or unparseable)
    pub fn unknown(
        code: S,
        pid: ProcessId,
        observed_at: DateTime<Utc>,
        reasons: Vec<String>,
    ) -> Self {
        Self {
            code,
            pid,
            observed_at,
            reasons,
            flavor: ForeignStateFlavor::Unknown,
            exit_code: None,
        }
    }

    /// Create a terminal observation, optionally carrying the exit code
    pub fn terminal(
        code: S,
        pid: ProcessId,
        observed_at: DateTime<Utc>,
        reasons: Vec<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self {
            code,
            pid,
            observed_at,
            reasons,
            flavor: ForeignStateFlavor::Terminal,
            exit_code,
        }
    }

    /// The wrapped backend-native code
    pub fn code(&self) -> &S {
        &self.code
    }

    /// The backend-native process identifier this observation refers to
    pub fn pid(&self) -> &ProcessId {
        &self.pid
    }

    /// When the observation was made
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Free-text reasons attached by the backend or the executor
    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    /// Whether the observation carries usable state information
    pub fn is_known(&self) -> bool {
        self.flavor != ForeignStateFlavor::Unknown
    }

    /// Whether the backend process has ended
    pub fn is_terminal(&self) -> bool {
        self.flavor == ForeignStateFlavor::Terminal
    }

    /// Exit code, if this is a terminal observation and the backend
    /// reported one
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

impl<S: StateCode> fmt::Display for ForeignState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {}, observed {})", self.code, self.pid, self.observed_at)?;
        if let Some(code) = self.exit_code {
            write!(f, " exit={}", code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_codes {
    use super::*;

    /// Minimal backend code enum used by execution-core tests
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum TestCode {
        Queued,
        Active,
        Suspended,
        Done,
        Broken,
        NotAvailable,
    }

    impl fmt::Display for TestCode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl StateCode for TestCode {
        fn parse(raw: Option<&str>) -> Self {
            match raw {
                Some("QUEUED") => TestCode::Queued,
                Some("ACTIVE") => TestCode::Active,
                Some("SUSPENDED") => TestCode::Suspended,
                Some("DONE") => TestCode::Done,
                Some("BROKEN") => TestCode::Broken,
                _ => TestCode::NotAvailable,
            }
        }

        fn not_available() -> Self {
            TestCode::NotAvailable
        }

        fn is_terminal_code(&self) -> bool {
            matches!(self, TestCode::Done | TestCode::Broken)
        }

        fn is_unknown_code(&self) -> bool {
            matches!(self, TestCode::NotAvailable)
        }

        fn is_success_code(&self) -> bool {
            matches!(self, TestCode::Done)
        }
    }

    pub fn pid() -> ProcessId {
        ProcessId::new("4711", "testhost")
    }
}

#[cfg(test)]
mod tests {
    use super::test_codes::{pid, TestCode};
    use super::*;

    #[test]
    fn test_factory_classifies_ordinary_code() {
        let fs = TestCode::as_foreign_state(pid(), Some("ACTIVE"), None, Utc::now(), vec![]);
        assert!(fs.is_known());
        assert!(!fs.is_terminal());
        assert_eq!(*fs.code(), TestCode::Active);
    }

    #[test]
    fn test_factory_classifies_unparseable_as_unknown() {
        let fs = TestCode::as_foreign_state(pid(), Some("garbage"), None, Utc::now(), vec![]);
        assert!(!fs.is_known());
        assert_eq!(*fs.code(), TestCode::NotAvailable);

        let fs = TestCode::as_foreign_state(pid(), None, None, Utc::now(), vec![]);
        assert!(!fs.is_known());
    }

    #[test]
    fn test_factory_classifies_terminal_with_exit_code() {
        let fs = TestCode::as_foreign_state(pid(), Some("BROKEN"), Some(7), Utc::now(), vec![]);
        assert!(fs.is_terminal());
        assert_eq!(fs.exit_code(), Some(7));
    }

    #[test]
    fn test_factory_normalizes_missing_exit_code_on_success() {
        let fs = TestCode::as_foreign_state(pid(), Some("DONE"), None, Utc::now(), vec![]);
        assert!(fs.is_terminal());
        assert_eq!(fs.exit_code(), Some(0));

        // A failed terminal code without exit code stays unknown-exit.
        let fs = TestCode::as_foreign_state(pid(), Some("BROKEN"), None, Utc::now(), vec![]);
        assert_eq!(fs.exit_code(), None);
    }

    #[test]
    fn test_display_includes_code_and_pid() {
        let fs = TestCode::as_foreign_state(pid(), Some("DONE"), Some(0), Utc::now(), vec![]);
        let rendered = fs.to_string();
        assert!(rendered.contains("Done"));
        assert!(rendered.contains("4711@testhost"));
        assert!(rendered.contains("exit=0"));
    }
}
