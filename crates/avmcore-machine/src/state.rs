//! Machine state in its deep (live) and hash-indirected (checkpoint) forms.
//!
//! Byte layouts here are bit-exact storage formats. All integers are
//! 32-byte or 8-byte big-endian; field order is fixed and append-only.

use avmcore_error::{CoreError, Result};
use avmcore_types::codec::{put_h256, put_u256, take_h256, take_u256, take_u8};
use avmcore_types::{CodePointRef, Tuple, Value, H256, U256};
use keccak_hash::keccak;

/// Run status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Running,
    Halted,
    Errored,
}

impl MachineStatus {
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Halted => 1,
            Self::Errored => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::Running),
            1 => Ok(Self::Halted),
            2 => Ok(Self::Errored),
            other => Err(CoreError::corruption(format!(
                "invalid machine status byte {other}"
            ))),
        }
    }
}

/// How much of the inbox a machine has fully consumed, and the accumulator
/// it observed at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InboxState {
    pub count: U256,
    pub accumulator: H256,
}

impl InboxState {
    pub fn marshal(&self, buf: &mut Vec<u8>) {
        put_u256(buf, &self.count);
        put_h256(buf, &self.accumulator);
    }

    pub fn unmarshal(buf: &mut &[u8]) -> Result<Self> {
        let count = take_u256(buf)?;
        let accumulator = take_h256(buf)?;
        Ok(Self { count, accumulator })
    }
}

/// Cumulative outputs of a machine since genesis.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Output {
    pub arb_gas_used: U256,
    pub total_messages_read: U256,
    pub log_count: U256,
    pub send_count: U256,
    pub fully_processed_inbox: InboxState,
    pub last_sideload: Option<U256>,
}

impl Output {
    /// Serialize in fixed field order.
    pub fn marshal(&self, buf: &mut Vec<u8>) {
        put_u256(buf, &self.arb_gas_used);
        put_u256(buf, &self.total_messages_read);
        put_u256(buf, &self.log_count);
        put_u256(buf, &self.send_count);
        self.fully_processed_inbox.marshal(buf);
        match &self.last_sideload {
            Some(block) => {
                buf.push(1);
                put_u256(buf, block);
            }
            None => buf.push(0),
        }
    }

    pub fn unmarshal(buf: &mut &[u8]) -> Result<Self> {
        let arb_gas_used = take_u256(buf)?;
        let total_messages_read = take_u256(buf)?;
        let log_count = take_u256(buf)?;
        let send_count = take_u256(buf)?;
        let fully_processed_inbox = InboxState::unmarshal(buf)?;
        let last_sideload = match take_u8(buf)? {
            0 => None,
            1 => Some(take_u256(buf)?),
            other => {
                return Err(CoreError::corruption(format!(
                    "invalid sideload flag byte {other}"
                )))
            }
        };
        Ok(Self {
            arb_gas_used,
            total_messages_read,
            log_count,
            send_count,
            fully_processed_inbox,
            last_sideload,
        })
    }
}

/// The live machine state: deep values plus the cumulative output.
///
/// The persistence layer owns serialization; the interpreter mutates this
/// through [`crate::Interpreter::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub register: Value,
    pub static_val: Value,
    pub datastack: Tuple,
    pub auxstack: Tuple,
    pub arb_gas_remaining: U256,
    pub status: MachineStatus,
    pub pc: CodePointRef,
    pub err_pc: CodePointRef,
    pub staged_message: Option<Value>,
    pub output: Output,
}

impl MachineState {
    /// A fresh machine at the entry of `segment` 0, with the given static
    /// value and empty stacks.
    #[must_use]
    pub fn fresh(static_val: Value) -> Self {
        Self {
            register: Value::Tuple(Tuple::empty()),
            static_val,
            datastack: Tuple::empty(),
            auxstack: Tuple::empty(),
            arb_gas_remaining: U256::MAX,
            status: MachineStatus::Running,
            pc: CodePointRef::new(0, 0),
            err_pc: CodePointRef::null(),
            staged_message: None,
            output: Output::default(),
        }
    }

    /// The machine's canonical hash, derived from component hashes.
    #[must_use]
    pub fn machine_hash(&self) -> H256 {
        MachineStateKeys::from_state(self).machine_hash()
    }
}

/// A machine state with every deep value replaced by its hash.
///
/// This is the checkpoint body: restoring a machine is an indirect lookup of
/// each hash against the value store, plus code segments from the code store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStateKeys {
    pub static_hash: H256,
    pub register_hash: H256,
    pub datastack_hash: H256,
    pub auxstack_hash: H256,
    pub arb_gas_remaining: U256,
    pub status: MachineStatus,
    pub pc: CodePointRef,
    pub err_pc: CodePointRef,
    pub staged_message_hash: Option<H256>,
    pub output: Output,
}

impl MachineStateKeys {
    /// Collapse a live state to its hash-indirected form.
    #[must_use]
    pub fn from_state(state: &MachineState) -> Self {
        Self {
            static_hash: state.static_val.hash(),
            register_hash: state.register.hash(),
            datastack_hash: state.datastack.hash(),
            auxstack_hash: state.auxstack.hash(),
            arb_gas_remaining: state.arb_gas_remaining,
            status: state.status,
            pc: state.pc,
            err_pc: state.err_pc,
            staged_message_hash: state.staged_message.as_ref().map(Value::hash),
            output: state.output.clone(),
        }
    }

    /// Total messages this state has read from the inbox.
    #[must_use]
    pub fn total_messages_read(&self) -> U256 {
        self.output.total_messages_read
    }

    /// Canonical machine hash over the component hashes and control state.
    /// Excludes the output, which is an account of history rather than part
    /// of the machine itself.
    #[must_use]
    pub fn machine_hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(4 * 32 + 32 + 1 + 4 * 8 + 33);
        put_h256(&mut buf, &self.static_hash);
        put_h256(&mut buf, &self.register_hash);
        put_h256(&mut buf, &self.datastack_hash);
        put_h256(&mut buf, &self.auxstack_hash);
        put_u256(&mut buf, &self.arb_gas_remaining);
        buf.push(self.status.to_u8());
        self.pc.marshal(&mut buf);
        self.err_pc.marshal(&mut buf);
        match &self.staged_message_hash {
            Some(hash) => {
                buf.push(1);
                put_h256(&mut buf, hash);
            }
            None => buf.push(0),
        }
        keccak(&buf)
    }

    /// Serialize in fixed field order (the checkpoint record body).
    pub fn marshal(&self, buf: &mut Vec<u8>) {
        put_h256(buf, &self.static_hash);
        put_h256(buf, &self.register_hash);
        put_h256(buf, &self.datastack_hash);
        put_h256(buf, &self.auxstack_hash);
        put_u256(buf, &self.arb_gas_remaining);
        buf.push(self.status.to_u8());
        self.pc.marshal(buf);
        self.err_pc.marshal(buf);
        match &self.staged_message_hash {
            Some(hash) => {
                buf.push(1);
                put_h256(buf, hash);
            }
            None => buf.push(0),
        }
        self.output.marshal(buf);
    }

    pub fn unmarshal(buf: &mut &[u8]) -> Result<Self> {
        let static_hash = take_h256(buf)?;
        let register_hash = take_h256(buf)?;
        let datastack_hash = take_h256(buf)?;
        let auxstack_hash = take_h256(buf)?;
        let arb_gas_remaining = take_u256(buf)?;
        let status = MachineStatus::from_u8(take_u8(buf)?)?;
        let pc = CodePointRef::unmarshal(buf)?;
        let err_pc = CodePointRef::unmarshal(buf)?;
        let staged_message_hash = match take_u8(buf)? {
            0 => None,
            1 => Some(take_h256(buf)?),
            other => {
                return Err(CoreError::corruption(format!(
                    "invalid staged message flag byte {other}"
                )))
            }
        };
        let output = Output::unmarshal(buf)?;
        Ok(Self {
            static_hash,
            register_hash,
            datastack_hash,
            auxstack_hash,
            arb_gas_remaining,
            status,
            pc,
            err_pc,
            staged_message_hash,
            output,
        })
    }

    /// Every value hash this checkpoint holds a reference to.
    #[must_use]
    pub fn referenced_values(&self) -> Vec<H256> {
        let mut hashes = vec![
            self.static_hash,
            self.register_hash,
            self.datastack_hash,
            self.auxstack_hash,
        ];
        if let Some(staged) = self.staged_message_hash {
            hashes.push(staged);
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> MachineState {
        let mut state = MachineState::fresh(Value::from(11u64));
        state.register = Value::from(3u64);
        state.datastack = Tuple::new(vec![Value::from(1u64), Value::from(2u64)]).unwrap();
        state.arb_gas_remaining = U256::from(1_000_000u64);
        state.pc = CodePointRef::new(0, 7);
        state.staged_message = Some(Value::from(9u64));
        state.output = Output {
            arb_gas_used: U256::from(700u64),
            total_messages_read: U256::from(3u64),
            log_count: U256::from(2u64),
            send_count: U256::from(1u64),
            fully_processed_inbox: InboxState {
                count: U256::from(3u64),
                accumulator: H256::repeat_byte(0x33),
            },
            last_sideload: Some(U256::from(42u64)),
        };
        state
    }

    #[test]
    fn output_round_trip() {
        let output = sample_state().output;
        let mut buf = Vec::new();
        output.marshal(&mut buf);
        let mut cursor = buf.as_slice();
        assert_eq!(Output::unmarshal(&mut cursor).unwrap(), output);
        assert!(cursor.is_empty());
    }

    #[test]
    fn output_round_trip_without_sideload() {
        let output = Output::default();
        let mut buf = Vec::new();
        output.marshal(&mut buf);
        let mut cursor = buf.as_slice();
        assert_eq!(Output::unmarshal(&mut cursor).unwrap(), output);
    }

    #[test]
    fn keys_round_trip() {
        let keys = MachineStateKeys::from_state(&sample_state());
        let mut buf = Vec::new();
        keys.marshal(&mut buf);
        let mut cursor = buf.as_slice();
        assert_eq!(MachineStateKeys::unmarshal(&mut cursor).unwrap(), keys);
        assert!(cursor.is_empty());
    }

    #[test]
    fn keys_capture_component_hashes() {
        let state = sample_state();
        let keys = MachineStateKeys::from_state(&state);
        assert_eq!(keys.static_hash, state.static_val.hash());
        assert_eq!(keys.register_hash, state.register.hash());
        assert_eq!(keys.datastack_hash, state.datastack.hash());
        assert_eq!(
            keys.staged_message_hash,
            state.staged_message.as_ref().map(Value::hash)
        );
        assert_eq!(keys.referenced_values().len(), 5);
    }

    #[test]
    fn machine_hash_tracks_state_changes() {
        let state = sample_state();
        let base = state.machine_hash();

        let mut moved = state.clone();
        moved.pc = CodePointRef::new(0, 8);
        assert_ne!(moved.machine_hash(), base);

        // The output is history, not machine identity.
        let mut different_output = state.clone();
        different_output.output.log_count = U256::from(99u64);
        assert_eq!(different_output.machine_hash(), base);
    }

    #[test]
    fn status_bytes_round_trip() {
        for status in [
            MachineStatus::Running,
            MachineStatus::Halted,
            MachineStatus::Errored,
        ] {
            assert_eq!(MachineStatus::from_u8(status.to_u8()).unwrap(), status);
        }
        assert!(MachineStatus::from_u8(3).is_err());
    }
}
