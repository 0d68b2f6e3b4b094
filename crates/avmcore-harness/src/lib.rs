//! Deterministic fixtures for exercising the execution core.
//!
//! The real opcode interpreter lives outside this workspace; tests drive the
//! core with [`ScriptedInterp`], a tiny deterministic machine whose behavior
//! is scripted by the message payloads themselves. Every message costs a
//! fixed 100 gas and its payload header says how many logs and sends to
//! emit, whether to stop at a sideload boundary, and whether to halt:
//!
//! ```text
//! payload = [n_logs u8][n_sends u8][flags u8][block be64 when flags & SIDELOAD]
//! ```
//!
//! [`InboxTracker`] mirrors the core's accumulator chain on the client side,
//! producing delivery envelopes plus the `prev_inbox_acc` values a real
//! sequencer feed would carry.

use std::sync::atomic::{AtomicBool, Ordering};

use avmcore_error::{CoreError, Result};
use avmcore_machine::{Assertion, ExecutionConfig, Interpreter, MachineState, MachineStatus};
use avmcore_store::inbox;
use avmcore_types::codec::take_u64;
use avmcore_types::{Opcode, Operation, Tuple, Value, H256, U256};

/// Gas consumed per message by the scripted interpreter.
pub const GAS_PER_MESSAGE: u64 = 100;

/// Payload flag: stop at a sideload boundary after this message.
pub const FLAG_SIDELOAD: u8 = 0x01;
/// Payload flag: halt the machine after this message.
pub const FLAG_HALT: u8 = 0x02;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Builder for scripted message payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Payload {
    logs: u8,
    sends: u8,
    sideload_block: Option<u64>,
    halt: bool,
}

impl Payload {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn logs(mut self, n: u8) -> Self {
        self.logs = n;
        self
    }

    #[must_use]
    pub fn sends(mut self, n: u8) -> Self {
        self.sends = n;
        self
    }

    #[must_use]
    pub fn sideload(mut self, block: u64) -> Self {
        self.sideload_block = Some(block);
        self
    }

    #[must_use]
    pub fn halt(mut self) -> Self {
        self.halt = true;
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.sideload_block.is_some() {
            flags |= FLAG_SIDELOAD;
        }
        if self.halt {
            flags |= FLAG_HALT;
        }
        let mut raw = vec![self.logs, self.sends, flags];
        if let Some(block) = self.sideload_block {
            raw.extend_from_slice(&block.to_be_bytes());
        }
        raw
    }
}

/// The log value the scripted interpreter emits as log `i` of message
/// `msg_index` (zero-based global message index).
#[must_use]
pub fn expected_log(msg_index: u64, i: u64) -> Value {
    Value::Tuple(
        Tuple::new(vec![Value::from(msg_index), Value::from(i)])
            .expect("two-element tuple is always valid"),
    )
}

/// The send payload the scripted interpreter emits as send `i` of message
/// `msg_index`.
#[must_use]
pub fn expected_send(msg_index: u64, i: u64) -> Vec<u8> {
    let mut raw = msg_index.to_be_bytes().to_vec();
    raw.push(i as u8);
    raw
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// The scripted deterministic machine.
pub struct ScriptedInterp;

impl ScriptedInterp {
    fn consume(state: &mut MachineState, payload: &[u8], assertion: &mut Assertion) -> Result<()> {
        let (&n_logs, rest) = payload
            .split_first()
            .ok_or_else(|| CoreError::InvalidArgument("empty scripted payload".into()))?;
        let (&n_sends, rest) = rest
            .split_first()
            .ok_or_else(|| CoreError::InvalidArgument("scripted payload too short".into()))?;
        let (&flags, mut rest) = rest
            .split_first()
            .ok_or_else(|| CoreError::InvalidArgument("scripted payload too short".into()))?;

        let msg_index = state.output.total_messages_read.low_u64();
        state.output.arb_gas_used += U256::from(GAS_PER_MESSAGE);
        state.arb_gas_remaining -= U256::from(GAS_PER_MESSAGE);
        state.output.total_messages_read += U256::one();
        state.output.fully_processed_inbox.count += U256::one();
        assertion.gas_count += U256::from(GAS_PER_MESSAGE);
        assertion.messages_consumed += 1;

        for i in 0..u64::from(n_logs) {
            assertion.logs.push(expected_log(msg_index, i));
            state.output.log_count += U256::one();
        }
        for i in 0..u64::from(n_sends) {
            assertion.sends.push(expected_send(msg_index, i));
            state.output.send_count += U256::one();
        }

        if flags & FLAG_SIDELOAD != 0 {
            let block = U256::from(take_u64(&mut rest)?);
            state.output.last_sideload = Some(block);
            assertion.sideload_block_number = Some(block);
        }
        if flags & FLAG_HALT != 0 {
            state.status = MachineStatus::Halted;
        }
        Ok(())
    }
}

impl Interpreter for ScriptedInterp {
    fn run(
        &self,
        state: &mut MachineState,
        config: &ExecutionConfig,
        abort: &AtomicBool,
    ) -> Result<Assertion> {
        let mut assertion = Assertion::default();
        for message in &config.messages {
            if abort.load(Ordering::Acquire) {
                break;
            }
            if state.status != MachineStatus::Running {
                break;
            }
            if let Some(target) = config.max_gas {
                let gas_used = state.output.arb_gas_used;
                if config.go_over_gas {
                    if gas_used >= target {
                        break;
                    }
                } else if gas_used + U256::from(GAS_PER_MESSAGE) > target {
                    break;
                }
            }

            Self::consume(state, &message.message, &mut assertion)?;
            state.output.fully_processed_inbox.accumulator = message.accumulator;

            if assertion.sideload_block_number.is_some() && config.stop_on_sideload {
                break;
            }
        }
        Ok(assertion)
    }

    fn next_gas_cost(&self, state: &MachineState) -> U256 {
        if state.status == MachineStatus::Running {
            U256::from(GAS_PER_MESSAGE)
        } else {
            U256::zero()
        }
    }
}

/// Code and static value for a boot executable.
#[must_use]
pub fn test_ops() -> Vec<Operation> {
    vec![
        Operation::new(Opcode::NOP),
        Operation::with_immediate(Opcode::LOG, Value::from(0u64)),
        Operation::new(Opcode::HALT),
    ]
}

#[must_use]
pub fn test_static() -> Value {
    Value::Tuple(
        Tuple::new(vec![Value::from(7u64), Value::Tuple(Tuple::empty())])
            .expect("two-element tuple is always valid"),
    )
}

// ---------------------------------------------------------------------------
// Client-side inbox mirror
// ---------------------------------------------------------------------------

/// Mirrors the accumulator chain a sequencer feed maintains, producing
/// delivery envelopes and the matching `prev_inbox_acc` values.
#[derive(Debug, Clone)]
pub struct InboxTracker {
    acc: H256,
    count: U256,
    delayed_count: U256,
    delayed_acc: H256,
}

impl Default for InboxTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InboxTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            acc: H256::zero(),
            count: U256::zero(),
            delayed_count: U256::zero(),
            delayed_acc: H256::zero(),
        }
    }

    /// Accumulator at the current tip (the `prev_inbox_acc` of the next
    /// delivery).
    #[must_use]
    pub fn acc(&self) -> H256 {
        self.acc
    }

    /// Messages recorded so far.
    #[must_use]
    pub fn count(&self) -> U256 {
        self.count
    }

    /// Record one sequencer message; returns its delivery envelope.
    pub fn add_sequencer(&mut self, payload: &[u8]) -> Vec<u8> {
        self.acc = inbox::sequencer_item_acc(self.acc, payload);
        self.count += U256::one();
        inbox::sequencer_envelope(payload)
    }

    /// Record a contiguous run of delayed messages (one batch item);
    /// returns their delivery envelopes.
    pub fn add_delayed_run(&mut self, payloads: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut envelopes = Vec::with_capacity(payloads.len());
        for payload in payloads {
            self.delayed_acc = inbox::next_delayed_acc(self.delayed_acc, payload);
            self.delayed_count += U256::one();
            self.count += U256::one();
            envelopes.push(inbox::delayed_envelope(payload));
        }
        self.acc = inbox::delayed_item_acc(self.acc, &self.delayed_count, self.delayed_acc);
        envelopes
    }

    /// Rewind the mirror to `count` messages, adopting the chain state the
    /// core will report for that prefix. Used when retrying a delivery with
    /// an explicit trim.
    pub fn rewind(&mut self, count: U256, acc: H256, delayed_count: U256, delayed_acc: H256) {
        self.count = count;
        self.acc = acc;
        self.delayed_count = delayed_count;
        self.delayed_acc = delayed_acc;
    }
}

#[cfg(test)]
mod tests {
    use avmcore_machine::MachineMessage;
    use avmcore_types::H256;

    use super::*;

    fn run_messages(payloads: Vec<Vec<u8>>) -> (MachineState, Assertion) {
        let mut state = MachineState::fresh(test_static());
        let messages = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| MachineMessage::new(payload, H256::repeat_byte(i as u8 + 1)))
            .collect();
        let assertion = ScriptedInterp
            .run(
                &mut state,
                &ExecutionConfig {
                    max_gas: None,
                    go_over_gas: false,
                    stop_on_sideload: true,
                    messages,
                },
                &AtomicBool::new(false),
            )
            .unwrap();
        (state, assertion)
    }

    #[test]
    fn consumes_messages_and_emits_outputs() {
        let (state, assertion) = run_messages(vec![
            Payload::new().logs(2).sends(1).build(),
            Payload::new().logs(1).build(),
        ]);
        assert_eq!(assertion.messages_consumed, 2);
        assert_eq!(assertion.logs.len(), 3);
        assert_eq!(assertion.sends, vec![expected_send(0, 0)]);
        assert_eq!(state.output.arb_gas_used, U256::from(200u64));
        assert_eq!(state.output.log_count, U256::from(3u64));
        assert_eq!(
            state.output.fully_processed_inbox.accumulator,
            H256::repeat_byte(2)
        );
    }

    #[test]
    fn stops_at_sideload_boundary() {
        let (state, assertion) = run_messages(vec![
            Payload::new().logs(1).sideload(5).build(),
            Payload::new().logs(1).build(),
        ]);
        assert_eq!(assertion.messages_consumed, 1);
        assert_eq!(assertion.sideload_block_number, Some(U256::from(5u64)));
        assert_eq!(state.output.last_sideload, Some(U256::from(5u64)));
    }

    #[test]
    fn halts_and_refuses_further_messages() {
        let (state, assertion) = run_messages(vec![
            Payload::new().halt().build(),
            Payload::new().logs(1).build(),
        ]);
        assert_eq!(assertion.messages_consumed, 1);
        assert_eq!(state.status, MachineStatus::Halted);
        assert!(assertion.logs.is_empty());
    }

    #[test]
    fn respects_gas_target_without_go_over() {
        let mut state = MachineState::fresh(test_static());
        let messages = (0..5)
            .map(|i| MachineMessage::new(Payload::new().build(), H256::repeat_byte(i + 1)))
            .collect();
        let assertion = ScriptedInterp
            .run(
                &mut state,
                &ExecutionConfig {
                    max_gas: Some(U256::from(250u64)),
                    go_over_gas: false,
                    stop_on_sideload: false,
                    messages,
                },
                &AtomicBool::new(false),
            )
            .unwrap();
        assert_eq!(assertion.messages_consumed, 2);
        assert_eq!(state.output.arb_gas_used, U256::from(200u64));
    }

    #[test]
    fn tracker_matches_core_chain_for_sequencer_items() {
        let mut tracker = InboxTracker::new();
        let payload = Payload::new().logs(1).build();
        let envelope = tracker.add_sequencer(&payload);
        assert_eq!(envelope[0], inbox::MSG_KIND_SEQUENCER);
        assert_eq!(
            tracker.acc(),
            inbox::sequencer_item_acc(H256::zero(), &payload)
        );
        assert_eq!(tracker.count(), U256::one());
    }
}
