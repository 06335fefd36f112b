//! The backend-independent execution-state reconciliation core
//!
//! Raw backend observations ([`ForeignState`]) are generalized onto a single
//! state machine ([`ExecutionState`]) by per-backend table-driven mappers
//! ([`SimpleStateMapper`]). Terminal states produce an [`ExecutionResult`].

mod foreign_state;
mod mapper;
mod result;
mod state;

pub use foreign_state::{ForeignState, StateCode};
#[cfg(test)]
pub(crate) use foreign_state::test_codes;
pub use mapper::{MapperError, SimpleStateMapper};
pub use result::ExecutionResult;
pub use state::{ExecutionState, ExecutionStateName, ProcessIdOrUnknown, StateError};
