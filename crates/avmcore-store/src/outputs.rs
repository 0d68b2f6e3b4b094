//! Append-only logs and sends, plus the persisted counters.
//!
//! Log entries map `be32(index)` to the 32-byte hash of a value whose body
//! lives in the value store; sends map `be32(index)` to raw bytes. Counters
//! are single-key u256 entries in the `state` family under reserved one-byte
//! keys. A reorg rewinds the inserted counts; send and log *entries* are not
//! deleted: only the value references behind rewound logs are dropped, and
//! stale entries are overwritten as the stream regrows.

use avmcore_error::{CoreError, Result};
use avmcore_kv::{Column, ReadView, WriteTx};
use avmcore_types::codec::{put_u256, take_u256, u256_be, u256_to_usize};
use avmcore_types::{Value, H256, U256};
use keccak_hash::keccak;

use crate::code_store::CodeStore;
use crate::value_cache::ValueCache;
use crate::value_store::{delete_value, get_value, save_value};

/// Reserved `state` keys.
pub const LOG_INSERTED_KEY: [u8; 1] = [0xC4];
pub const LOG_PROCESSED_KEY: [u8; 1] = [0xC3];
pub const SEND_INSERTED_KEY: [u8; 1] = [0xC2];
pub const SEND_PROCESSED_KEY: [u8; 1] = [0xC1];
pub const MESSAGE_ENTRY_INSERTED_KEY: [u8; 1] = [0xC0];
/// Prefix for per-slot logs-cursor confirmed totals; followed by the slot
/// index byte.
pub const LOGS_CURSOR_CURRENT_PREFIX: u8 = 0xBE;

/// State key of a logs-cursor slot's confirmed total.
#[must_use]
pub fn logs_cursor_current_key(slot: u8) -> [u8; 2] {
    [LOGS_CURSOR_CURRENT_PREFIX, slot]
}

fn get_count(view: &impl ReadView, key: &[u8]) -> Result<U256> {
    let raw = view.get(Column::State, key).ok_or(CoreError::NotFound)?;
    take_u256(&mut raw.as_slice())
}

fn put_count(tx: &mut WriteTx<'_>, key: &[u8], value: &U256) {
    let mut buf = Vec::with_capacity(32);
    put_u256(&mut buf, value);
    tx.put(Column::State, key, buf);
}

pub fn log_inserted_count(view: &impl ReadView) -> Result<U256> {
    get_count(view, &LOG_INSERTED_KEY)
}

pub fn update_log_inserted_count(tx: &mut WriteTx<'_>, count: &U256) {
    put_count(tx, &LOG_INSERTED_KEY, count);
}

pub fn log_processed_count(view: &impl ReadView) -> Result<U256> {
    get_count(view, &LOG_PROCESSED_KEY)
}

pub fn update_log_processed_count(tx: &mut WriteTx<'_>, count: &U256) {
    put_count(tx, &LOG_PROCESSED_KEY, count);
}

pub fn send_inserted_count(view: &impl ReadView) -> Result<U256> {
    get_count(view, &SEND_INSERTED_KEY)
}

pub fn update_send_inserted_count(tx: &mut WriteTx<'_>, count: &U256) {
    put_count(tx, &SEND_INSERTED_KEY, count);
}

pub fn send_processed_count(view: &impl ReadView) -> Result<U256> {
    get_count(view, &SEND_PROCESSED_KEY)
}

pub fn update_send_processed_count(tx: &mut WriteTx<'_>, count: &U256) {
    put_count(tx, &SEND_PROCESSED_KEY, count);
}

pub fn message_entry_inserted_count(view: &impl ReadView) -> Result<U256> {
    get_count(view, &MESSAGE_ENTRY_INSERTED_KEY)
}

pub fn update_message_entry_inserted_count(tx: &mut WriteTx<'_>, count: &U256) {
    put_count(tx, &MESSAGE_ENTRY_INSERTED_KEY, count);
}

pub fn logs_cursor_current_total(view: &impl ReadView, slot: u8) -> Result<U256> {
    get_count(view, &logs_cursor_current_key(slot))
}

pub fn update_logs_cursor_current_total(tx: &mut WriteTx<'_>, slot: u8, count: &U256) {
    put_count(tx, &logs_cursor_current_key(slot), count);
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// Append `values` to the log stream: each body is saved into the value
/// store and its hash lands at the next insert index.
pub fn save_logs(tx: &mut WriteTx<'_>, values: &[Value]) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let mut index = log_inserted_count(tx)?;
    for value in values {
        let hash = save_value(tx, value)?;
        tx.put(Column::Log, u256_be(&index).to_vec(), hash.as_bytes());
        index += U256::one();
    }
    update_log_inserted_count(tx, &index);
    Ok(())
}

/// Log value hashes for `[index, index + count)`, truncated at the tip.
pub fn get_log_hashes(view: &impl ReadView, index: &U256, count: &U256) -> Result<Vec<H256>> {
    if count.is_zero() {
        return Ok(Vec::new());
    }
    let max = log_inserted_count(view)?;
    if *index >= max {
        return Ok(Vec::new());
    }
    let take = u256_to_usize(&(max - *index).min(*count))?;
    let mut hashes = Vec::with_capacity(take);
    for (_, raw) in view.iter_from(Column::Log, &u256_be(index)).take(take) {
        if raw.len() != 32 {
            return Err(CoreError::corruption(format!(
                "log entry has {} bytes, expected 32",
                raw.len()
            )));
        }
        hashes.push(H256::from_slice(&raw));
    }
    Ok(hashes)
}

/// Materialized log values for `[index, index + count)`, truncated at the
/// tip.
pub fn get_logs(
    view: &impl ReadView,
    index: &U256,
    count: &U256,
    code: &CodeStore,
    cache: &mut ValueCache,
) -> Result<Vec<Value>> {
    let hashes = get_log_hashes(view, index, count)?;
    let mut logs = Vec::with_capacity(hashes.len());
    for hash in hashes {
        logs.push(get_value(view, hash, code, cache)?);
    }
    Ok(logs)
}

/// Drop the value references behind every log at `index` or later. The log
/// entries themselves remain and are overwritten as the stream regrows; the
/// inserted count is the caller's to rewind.
pub fn delete_logs_from(tx: &mut WriteTx<'_>, index: &U256) -> Result<()> {
    let hashes: Vec<H256> = tx
        .iter_from(Column::Log, &u256_be(index))
        .map(|(_, raw)| {
            if raw.len() != 32 {
                return Err(CoreError::corruption(format!(
                    "log entry has {} bytes, expected 32",
                    raw.len()
                )));
            }
            Ok(H256::from_slice(&raw))
        })
        .collect::<Result<_>>()?;
    for hash in hashes {
        delete_value(tx, hash)?;
    }
    Ok(())
}

/// Fold the log-range commitment: `acc = keccak(acc || hash(log_i))`.
pub fn log_acc(
    view: &impl ReadView,
    start_acc: H256,
    start_index: &U256,
    count: &U256,
) -> Result<H256> {
    let mut acc = start_acc;
    for hash in get_log_hashes(view, start_index, count)? {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(acc.as_bytes());
        buf.extend_from_slice(hash.as_bytes());
        acc = keccak(&buf);
    }
    Ok(acc)
}

// ---------------------------------------------------------------------------
// Sends
// ---------------------------------------------------------------------------

/// Append raw send payloads.
pub fn save_sends(tx: &mut WriteTx<'_>, sends: &[Vec<u8>]) -> Result<()> {
    if sends.is_empty() {
        return Ok(());
    }
    let mut index = send_inserted_count(tx)?;
    for send in sends {
        tx.put(Column::Send, u256_be(&index).to_vec(), send.clone());
        index += U256::one();
    }
    update_send_inserted_count(tx, &index);
    Ok(())
}

/// Send payloads for `[index, index + count)`, truncated at the tip.
pub fn get_sends(view: &impl ReadView, index: &U256, count: &U256) -> Result<Vec<Vec<u8>>> {
    if count.is_zero() {
        return Ok(Vec::new());
    }
    let max = send_inserted_count(view)?;
    if *index >= max {
        return Ok(Vec::new());
    }
    let take = u256_to_usize(&(max - *index).min(*count))?;
    Ok(view
        .iter_from(Column::Send, &u256_be(index))
        .take(take)
        .map(|(_, raw)| raw)
        .collect())
}

/// Fold the send-range commitment: `acc = keccak(acc || keccak(send_i))`.
pub fn send_acc(
    view: &impl ReadView,
    start_acc: H256,
    start_index: &U256,
    count: &U256,
) -> Result<H256> {
    let mut acc = start_acc;
    for send in get_sends(view, start_index, count)? {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(acc.as_bytes());
        buf.extend_from_slice(keccak(&send).as_bytes());
        acc = keccak(&buf);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use avmcore_kv::KvStore;

    use super::*;
    use crate::value_store::refcount;

    fn init_counts(kv: &KvStore) {
        let mut tx = kv.begin();
        update_log_inserted_count(&mut tx, &U256::zero());
        update_send_inserted_count(&mut tx, &U256::zero());
        tx.commit();
    }

    fn values(n: u64) -> Vec<Value> {
        (0..n).map(Value::from).collect()
    }

    #[test]
    fn save_and_read_logs() {
        let kv = KvStore::new();
        init_counts(&kv);
        let code = CodeStore::new();
        let mut cache = ValueCache::new(1);

        let mut tx = kv.begin();
        save_logs(&mut tx, &values(3)).unwrap();
        tx.commit();

        let snap = kv.snapshot();
        assert_eq!(log_inserted_count(&snap).unwrap(), U256::from(3u64));
        let logs = get_logs(&snap, &U256::zero(), &U256::from(10u64), &code, &mut cache).unwrap();
        assert_eq!(logs, values(3));
        // Mid-stream read with silent truncation.
        let tail = get_logs(&snap, &U256::from(2u64), &U256::from(10u64), &code, &mut cache).unwrap();
        assert_eq!(tail, vec![Value::from(2u64)]);
        // Past the tip: empty, not an error.
        assert!(
            get_logs(&snap, &U256::from(9u64), &U256::one(), &code, &mut cache)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn delete_logs_drops_references_but_keeps_entries() {
        let kv = KvStore::new();
        init_counts(&kv);

        let mut tx = kv.begin();
        save_logs(&mut tx, &values(3)).unwrap();
        tx.commit();

        let doomed = Value::from(2u64).hash();
        assert_eq!(refcount(&kv.snapshot(), &doomed).unwrap(), 1);

        let mut tx = kv.begin();
        delete_logs_from(&mut tx, &U256::from(2u64)).unwrap();
        update_log_inserted_count(&mut tx, &U256::from(2u64));
        tx.commit();

        let snap = kv.snapshot();
        assert_eq!(refcount(&snap, &doomed).unwrap(), 0);
        // The entry bytes are still present, but the clamp hides them.
        assert!(snap.get(Column::Log, &u256_be(&U256::from(2u64))).is_some());
        assert!(
            get_log_hashes(&snap, &U256::from(2u64), &U256::one())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn sends_round_trip_and_truncate() {
        let kv = KvStore::new();
        init_counts(&kv);

        let mut tx = kv.begin();
        save_sends(&mut tx, &[b"a".to_vec(), b"bb".to_vec()]).unwrap();
        tx.commit();

        let snap = kv.snapshot();
        assert_eq!(send_inserted_count(&snap).unwrap(), U256::from(2u64));
        assert_eq!(
            get_sends(&snap, &U256::zero(), &U256::from(5u64)).unwrap(),
            vec![b"a".to_vec(), b"bb".to_vec()]
        );
        assert!(get_sends(&snap, &U256::from(7u64), &U256::one())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn range_accumulators_are_deterministic_folds() {
        let kv = KvStore::new();
        init_counts(&kv);
        let mut tx = kv.begin();
        save_logs(&mut tx, &values(2)).unwrap();
        save_sends(&mut tx, &[b"x".to_vec()]).unwrap();
        tx.commit();
        let snap = kv.snapshot();

        let full = log_acc(&snap, H256::zero(), &U256::zero(), &U256::from(2u64)).unwrap();
        let first = log_acc(&snap, H256::zero(), &U256::zero(), &U256::one()).unwrap();
        let chained = log_acc(&snap, first, &U256::one(), &U256::one()).unwrap();
        assert_eq!(full, chained);

        let send_fold = send_acc(&snap, H256::zero(), &U256::zero(), &U256::one()).unwrap();
        assert_ne!(send_fold, H256::zero());
    }

    #[test]
    fn counters_are_independent_keys() {
        let kv = KvStore::new();
        let mut tx = kv.begin();
        update_log_inserted_count(&mut tx, &U256::from(1u64));
        update_log_processed_count(&mut tx, &U256::from(2u64));
        update_send_inserted_count(&mut tx, &U256::from(3u64));
        update_send_processed_count(&mut tx, &U256::from(4u64));
        update_message_entry_inserted_count(&mut tx, &U256::from(5u64));
        update_logs_cursor_current_total(&mut tx, 7, &U256::from(6u64));
        tx.commit();

        let snap = kv.snapshot();
        assert_eq!(log_inserted_count(&snap).unwrap(), U256::from(1u64));
        assert_eq!(log_processed_count(&snap).unwrap(), U256::from(2u64));
        assert_eq!(send_inserted_count(&snap).unwrap(), U256::from(3u64));
        assert_eq!(send_processed_count(&snap).unwrap(), U256::from(4u64));
        assert_eq!(
            message_entry_inserted_count(&snap).unwrap(),
            U256::from(5u64)
        );
        assert_eq!(
            logs_cursor_current_total(&snap, 7).unwrap(),
            U256::from(6u64)
        );
        assert!(logs_cursor_current_total(&snap, 8).is_err());
    }
}
