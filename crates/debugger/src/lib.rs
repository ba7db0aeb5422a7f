//! Debug session orchestration
//!
//! A [`Debugger`] owns the run state of one session together with its
//! breakpoint, thread and stack tables. It asks a backend from the
//! [`server::BackendRegistry`] for a debug adapter port, drives the adapter
//! over DAP and publishes [`Event`]s for front-ends.
mod debugger;
mod internals;
mod project;
mod registry;
mod state;
mod types;

pub use debugger::Debugger;
pub use project::{DebugTarget, ProjectContext};
pub use registry::{Row, Table, TableChange};
pub use state::{Event, RunState};
pub use types::{Breakpoint, BreakpointKind, OutputLine, StackFrame, Thread, Variable};
