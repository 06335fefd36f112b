//! Identity primitives for executions and backend processes

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Unique identifier for one execution attempt.
///
/// Generated by runbridge *before* submission to any backend, so that a
/// submission can be re-identified after a crash independently of any
/// backend-native identifier. ULIDs are sortable by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(Ulid);

impl ExecutionId {
    /// Environment variable used to mark backend processes with their
    /// execution id, enabling idempotent submission and crash recovery.
    pub const ENV_VAR: &'static str = "RUNBRIDGE_EXECUTION_ID";

    /// Create a new random execution ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse an ExecutionId from a string representation
    pub fn parse(s: &str) -> Result<Self, String> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| format!("Invalid execution ID '{}': {}", s, e))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-native process identifier.
///
/// A PID, cluster job ID, or pod name, plus a label identifying the
/// infrastructure it was assigned on. Only available after a successful
/// submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    /// The backend-native identifier value
    pub value: String,
    /// Label for the infrastructure the identifier belongs to
    pub location: String,
}

impl ProcessId {
    /// Create a new process identifier
    pub fn new(value: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            location: location.into(),
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.value, self.location)
    }
}
