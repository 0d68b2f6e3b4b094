//! Machine state model and execution seam for the persistence core.
//!
//! The opcode interpreter is not part of this workspace: it plugs in behind
//! the [`Interpreter`] trait and is handed a [`MachineState`] plus an
//! [`ExecutionConfig`] per run. Everything the persistence layer serializes
//! is concrete: [`MachineStateKeys`] replaces each deep value with its hash,
//! so a checkpoint is independent of which interpreter produced it.

pub mod assertion;
pub mod machine;
pub mod state;
pub mod thread;

pub use assertion::{Assertion, ExecutionConfig, MachineMessage};
pub use machine::{Interpreter, Machine};
pub use state::{InboxState, MachineState, MachineStateKeys, MachineStatus, Output};
pub use thread::{MachineThread, MachineThreadState};
