//! Client-owned historical machine, lazily materialized.

use avmcore_machine::{Machine, MachineStateKeys, Output};

/// Either the stored keys of a checkpoint or a machine already built from
/// them. Advancing materializes on demand; dematerializing (when a machine
/// is taken out) collapses back to keys.
pub(crate) enum MachineOrKeys {
    Keys(MachineStateKeys),
    Machine(Box<Machine>),
}

/// A lazily materialized machine positioned at some historical gas point.
///
/// Cursors are advanced through
/// [`AvmCore::advance_execution_cursor`](crate::AvmCore::advance_execution_cursor);
/// they hold no locks and observe the catalog only through consistent
/// snapshots, so any number of cursors can advance concurrently.
pub struct ExecutionCursor {
    pub(crate) machine: MachineOrKeys,
}

impl ExecutionCursor {
    pub(crate) fn from_keys(keys: MachineStateKeys) -> Self {
        Self {
            machine: MachineOrKeys::Keys(keys),
        }
    }

    /// The cumulative output at the cursor's current position.
    #[must_use]
    pub fn output(&self) -> &Output {
        match &self.machine {
            MachineOrKeys::Keys(keys) => &keys.output,
            MachineOrKeys::Machine(machine) => &machine.state().output,
        }
    }

    /// Whether the machine is currently materialized.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        matches!(self.machine, MachineOrKeys::Machine(_))
    }
}
