//! Shared utilities used across the runbridge library

pub mod env_loader;
pub mod ids;
pub mod retry;

pub use ids::{ExecutionId, ProcessId};
pub use retry::RetryPolicy;
