//! The workflow-run domain: requests, the persisted run entity, and its
//! lifecycle stages

mod request;
#[allow(clippy::module_inception)]
mod run;
mod stage;

pub use request::{RunRequest, ValidationError};
pub use run::{ExecutionLog, Run, StateLog};
pub use stage::{ProcessingStage, RunStatus, StageError};
