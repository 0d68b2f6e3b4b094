//! The pluggable interpreter seam and the materialized machine.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use avmcore_error::Result;
use avmcore_types::{H256, U256};

use crate::assertion::{Assertion, ExecutionConfig};
use crate::state::MachineState;

/// The opcode interpreter.
///
/// Implementations advance `state` under `config`, consuming messages from
/// `config.messages` front to back, and report what happened as an
/// [`Assertion`]. A run must return promptly once `abort` is set; partial
/// progress is fine because the host discards aborted runs.
///
/// Determinism is a hard requirement: identical state + config must produce
/// identical assertions and final states on every call.
pub trait Interpreter: Send + Sync {
    /// Run the machine. Respects `config.max_gas`/`go_over_gas` and stops at
    /// a sideload boundary when `config.stop_on_sideload` is set.
    fn run(
        &self,
        state: &mut MachineState,
        config: &ExecutionConfig,
        abort: &AtomicBool,
    ) -> Result<Assertion>;

    /// Gas the next instruction would consume, used by execution cursors to
    /// stop before overshooting a gas target.
    fn next_gas_cost(&self, state: &MachineState) -> U256;
}

/// A materialized machine: deep state plus a handle to its interpreter.
#[derive(Clone)]
pub struct Machine {
    state: MachineState,
    interp: Arc<dyn Interpreter>,
}

impl Machine {
    #[must_use]
    pub fn new(state: MachineState, interp: Arc<dyn Interpreter>) -> Self {
        Self { state, interp }
    }

    #[must_use]
    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MachineState {
        &mut self.state
    }

    #[must_use]
    pub fn interpreter(&self) -> Arc<dyn Interpreter> {
        Arc::clone(&self.interp)
    }

    /// The machine's canonical hash.
    #[must_use]
    pub fn hash(&self) -> H256 {
        self.state.machine_hash()
    }

    /// Run synchronously on the calling thread (execution cursors).
    pub fn run(&mut self, config: &ExecutionConfig, abort: &AtomicBool) -> Result<Assertion> {
        self.interp.run(&mut self.state, config, abort)
    }

    /// Gas cost of the next instruction.
    #[must_use]
    pub fn next_gas_cost(&self) -> U256 {
        self.interp.next_gas_cost(&self.state)
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("hash", &self.hash())
            .field("gas_used", &self.state.output.arb_gas_used)
            .finish()
    }
}
