//! Command execution engine.
//!
//! A submitted command is classified, checked against the executable
//! allow-list, admitted into the session's in-flight set and then run as an
//! external process on its own task.

mod engine;
mod execution;
pub mod process;
pub mod safety;

pub use engine::CommandEngine;
pub use execution::{CommandExecution, CommandHandle};
