//! The checkpoint catalog: machine states keyed by consumed gas.
//!
//! Keys are `be32(arb_gas_used)`, so catalog order is gas order and the
//! strictly-increasing-gas invariant is the key order itself. A checkpoint
//! owns one reference to each of its component values; deleting it hands
//! those references back to the value store.

use std::collections::BTreeSet;

use avmcore_error::{CoreError, Result};
use avmcore_kv::{Column, ReadView, WriteTx};
use avmcore_machine::{MachineState, MachineStateKeys};
use avmcore_types::codec::u256_be;
use avmcore_types::{Value, U256};
use tracing::debug;

use crate::code_store::CodeStore;
use crate::inbox;
use crate::value_cache::ValueCache;
use crate::value_store::{delete_value, get_value, save_tuple, save_value};

/// Persist the live machine state as a checkpoint at its current gas.
///
/// Fails with `Corruption` when the state's `fully_processed_inbox` does not
/// match the stored inbox chain; writing such a checkpoint would violate
/// the catalog's consistency invariant.
pub fn save_checkpoint(tx: &mut WriteTx<'_>, state: &MachineState) -> Result<()> {
    if !inbox::is_valid(tx, &state.output.fully_processed_inbox) {
        return Err(CoreError::corruption(format!(
            "checkpoint at gas {} has inbox state inconsistent with the message stream",
            state.output.arb_gas_used
        )));
    }

    save_value(tx, &state.register)?;
    save_value(tx, &state.static_val)?;
    save_tuple(tx, &state.datastack)?;
    save_tuple(tx, &state.auxstack)?;
    if let Some(staged) = &state.staged_message {
        save_value(tx, staged)?;
    }

    let keys = MachineStateKeys::from_state(state);
    let mut body = Vec::new();
    keys.marshal(&mut body);
    tx.put(
        Column::Checkpoint,
        u256_be(&state.output.arb_gas_used).to_vec(),
        body,
    );
    debug!(gas = %state.output.arb_gas_used, "saved checkpoint");
    Ok(())
}

/// The checkpoint stored exactly at `gas`.
pub fn get_checkpoint(view: &impl ReadView, gas: &U256) -> Result<MachineStateKeys> {
    let body = view
        .get(Column::Checkpoint, &u256_be(gas))
        .ok_or(CoreError::NotFound)?;
    MachineStateKeys::unmarshal(&mut body.as_slice())
}

/// The closest checkpoint at or before `gas`; with `after` set, the one
/// immediately following it instead.
pub fn checkpoint_at_or_before(
    view: &impl ReadView,
    gas: &U256,
    after: bool,
) -> Result<MachineStateKeys> {
    let (key, body) = view
        .seek_for_prev(Column::Checkpoint, &u256_be(gas))
        .ok_or(CoreError::NotFound)?;
    if !after {
        return MachineStateKeys::unmarshal(&mut body.as_slice());
    }
    let mut iter = view.iter_from(Column::Checkpoint, &key);
    iter.next(); // the entry found above
    let (_, body) = iter.next().ok_or(CoreError::NotFound)?;
    MachineStateKeys::unmarshal(&mut body.as_slice())
}

/// Gas of the newest checkpoint, zero for an empty catalog.
pub fn max_checkpoint_gas(view: &impl ReadView) -> U256 {
    match view.last(Column::Checkpoint) {
        Some((key, _)) => U256::from_big_endian(&key),
        None => U256::zero(),
    }
}

#[must_use]
pub fn is_checkpoints_empty(view: &impl ReadView) -> bool {
    view.last(Column::Checkpoint).is_none()
}

/// Remove a checkpoint and drop its value references.
pub fn delete_checkpoint(tx: &mut WriteTx<'_>, keys: &MachineStateKeys) -> Result<()> {
    for hash in keys.referenced_values() {
        delete_value(tx, hash)?;
    }
    tx.delete(Column::Checkpoint, u256_be(&keys.output.arb_gas_used));
    debug!(gas = %keys.output.arb_gas_used, "deleted checkpoint");
    Ok(())
}

/// Materialize a machine state from its checkpoint keys: every component
/// value is looked up in the value store and the code segments for both
/// program counters are loaded transitively.
pub fn restore_machine_state(
    view: &impl ReadView,
    keys: &MachineStateKeys,
    code: &CodeStore,
    cache: &mut ValueCache,
) -> Result<MachineState> {
    let static_val = get_value(view, keys.static_hash, code, cache)?;
    let register = get_value(view, keys.register_hash, code, cache)?;

    let datastack = match get_value(view, keys.datastack_hash, code, cache)? {
        Value::Tuple(t) => t,
        other => {
            return Err(CoreError::corruption(format!(
                "checkpoint datastack is a {}, expected tuple",
                other.kind()
            )))
        }
    };
    let auxstack = match get_value(view, keys.auxstack_hash, code, cache)? {
        Value::Tuple(t) => t,
        other => {
            return Err(CoreError::corruption(format!(
                "checkpoint auxstack is a {}, expected tuple",
                other.kind()
            )))
        }
    };
    let staged_message = match keys.staged_message_hash {
        Some(hash) => Some(get_value(view, hash, code, cache)?),
        None => None,
    };

    code.restore_segments(
        view,
        BTreeSet::from([keys.pc.segment, keys.err_pc.segment]),
    )?;

    Ok(MachineState {
        register,
        static_val,
        datastack,
        auxstack,
        arb_gas_remaining: keys.arb_gas_remaining,
        status: keys.status,
        pc: keys.pc,
        err_pc: keys.err_pc,
        staged_message,
        output: keys.output.clone(),
    })
}
