//! Execution inputs and outputs exchanged with the interpreter.

use avmcore_types::{Value, H256, U256};

/// One inbox message handed to the machine: the raw payload plus the inbox
/// accumulator after it, which the machine records in
/// `fully_processed_inbox` as it consumes the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineMessage {
    pub message: Vec<u8>,
    pub accumulator: H256,
}

impl MachineMessage {
    #[must_use]
    pub fn new(message: Vec<u8>, accumulator: H256) -> Self {
        Self {
            message,
            accumulator,
        }
    }
}

/// Parameters for one machine run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionConfig {
    /// Stop once `arb_gas_used` reaches this total. `None` = unlimited.
    pub max_gas: Option<U256>,
    /// With a gas limit: whether to stop after passing the target
    /// (`true`) or before the op that would pass it (`false`).
    pub go_over_gas: bool,
    /// Pause at sideload boundaries so the host can snapshot the machine.
    pub stop_on_sideload: bool,
    /// Messages available to this run, in inbox order.
    pub messages: Vec<MachineMessage>,
}

/// What one machine run produced.
#[derive(Debug, Clone, Default)]
pub struct Assertion {
    /// Gas consumed by this run (zero means the machine made no progress).
    pub gas_count: U256,
    /// Messages consumed from `ExecutionConfig::messages`.
    pub messages_consumed: usize,
    /// Log values emitted, in order.
    pub logs: Vec<Value>,
    /// Send payloads emitted, in order.
    pub sends: Vec<Vec<u8>>,
    /// Set when the run stopped at a sideload boundary for this block.
    pub sideload_block_number: Option<U256>,
}

impl Assertion {
    /// True when the run made no progress at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gas_count.is_zero() && self.messages_consumed == 0
    }
}
