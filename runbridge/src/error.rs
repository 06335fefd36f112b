//! Unified error handling for the runbridge library
//!
//! Each subsystem defines its own typed error enum; this module ties them
//! together in a single library-level error type and provides the
//! `ErrorContext` extension for attaching human-readable context.

use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for the runbridge library
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunbridgeError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Run request failed validation before reaching any backend
    #[error("Validation error: {0}")]
    Validation(#[from] crate::run::ValidationError),

    /// Illegal processing-stage progression
    #[error(transparent)]
    Stage(#[from] crate::run::StageError),

    /// Execution-state machine violation
    #[error(transparent)]
    State(#[from] crate::execution::StateError),

    /// State-mapper failure (forbidden transition or unmapped code)
    #[error(transparent)]
    Mapper(#[from] crate::execution::MapperError),

    /// Backend executor failure
    #[error(transparent)]
    Executor(#[from] crate::executor::ExecutorError),

    /// Storage accessor failure
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    /// Database failure
    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),

    /// Configuration loading failed
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Generic error with context
    #[error("{message}")]
    Context {
        /// Human-readable context attached at the failure site
        message: String,
        /// The underlying error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type alias for runbridge operations
pub type Result<T> = std::result::Result<T, RunbridgeError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, msg: S) -> Result<T>;

    /// Add context with a closure that's only called on error
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<S: Into<String>>(self, msg: S) -> Result<T> {
        self.map_err(|e| RunbridgeError::Context {
            message: msg.into(),
            source: Box::new(e),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| RunbridgeError::Context {
            message: f().into(),
            source: Box::new(e),
        })
    }
}

/// Error chain formatter for detailed error reporting
pub struct ErrorChain<'a>(&'a dyn std::error::Error);

impl<'a> fmt::Display for ErrorChain<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.0)?;

        let mut current = self.0.source();
        let mut level = 1;

        while let Some(err) = current {
            writeln!(f, "{:indent$}Caused by: {}", "", err, indent = level * 2)?;
            current = err.source();
            level += 1;
        }

        Ok(())
    }
}

/// Extension trait for error types to format the full error chain
pub trait ErrorChainExt {
    /// Format the full error chain
    fn error_chain(&self) -> ErrorChain<'_>;
}

impl<E: std::error::Error> ErrorChainExt for E {
    fn error_chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let err: Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "file not found").into());
        let err_with_context = err.context("Failed to read exit code file");

        assert!(err_with_context.is_err());
        let msg = err_with_context.unwrap_err().to_string();
        assert!(msg.contains("Failed to read exit code file"));
    }

    #[test]
    fn test_error_chain_display() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = RunbridgeError::Context {
            message: "Failed to stage wrapper script".to_string(),
            source: Box::new(io_err),
        };

        let chain = err.error_chain().to_string();
        assert!(chain.contains("Failed to stage wrapper script"));
        assert!(chain.contains("file not found"));
    }
}
