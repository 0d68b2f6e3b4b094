//! Content-addressed, reference-counted persistence of value bodies.
//!
//! Key: the value's 32-byte canonical hash. Record: `be8(refcount)` followed
//! by the stored body. Tuples store their shallow form, so shared structure
//! is deduplicated at every level; integers store their (identical) deep
//! form; code points store only their position, since the code store owns the
//! instruction data.

use avmcore_error::{CoreError, Result};
use avmcore_kv::{Column, ReadView, WriteTx};
use avmcore_types::codec::{put_u64, take_h256, take_u64, take_u8, take_u256};
use avmcore_types::{
    CodePointRef, Tuple, Value, H256, MAX_TUPLE_SIZE, TAG_CODEPT, TAG_HASH_ONLY, TAG_NUM,
    TAG_TUPLE,
};

use crate::code_store::CodeStore;
use crate::value_cache::ValueCache;

/// Save `value`, returning its hash.
///
/// If the hash already exists the refcount is incremented and children are
/// untouched (they were referenced when the record was first written).
/// Otherwise children are saved first, then the record lands with refcount 1.
pub fn save_value(tx: &mut WriteTx<'_>, value: &Value) -> Result<H256> {
    let hash = value.hash();
    if let Some(record) = tx.get(Column::Value, hash.as_bytes()) {
        let (refcount, body) = split_record(&record)?;
        write_record(tx, &hash, refcount + 1, body);
        return Ok(hash);
    }

    let body = match value {
        Value::Int(_) => {
            let mut buf = Vec::with_capacity(33);
            value.marshal_deep(&mut buf);
            buf
        }
        Value::Tuple(tuple) => {
            for child in tuple.children() {
                save_value(tx, child)?;
            }
            let mut buf = Vec::new();
            tuple.marshal_shallow(&mut buf);
            buf
        }
        Value::CodePoint(cp) => {
            let mut buf = Vec::with_capacity(17);
            buf.push(TAG_CODEPT);
            cp.pc.marshal(&mut buf);
            buf
        }
    };
    write_record(tx, &hash, 1, &body);
    Ok(hash)
}

/// Materialize the value stored under `hash`.
///
/// Tuples are reassembled by recursively fetching children; code points are
/// resolved through the code store, loading their segment from storage first
/// when needed. Misses populate `cache`.
pub fn get_value(
    view: &impl ReadView,
    hash: H256,
    code: &CodeStore,
    cache: &mut ValueCache,
) -> Result<Value> {
    if let Some(value) = cache.get(&hash) {
        return Ok(value);
    }

    let record = view
        .get(Column::Value, hash.as_bytes())
        .ok_or(CoreError::NotFound)?;
    let (_, body) = split_record(&record)?;
    let mut cursor = body;
    let tag = take_u8(&mut cursor)?;
    let value = match tag {
        TAG_NUM => Value::Int(take_u256(&mut cursor)?),
        TAG_CODEPT => {
            let pc = CodePointRef::unmarshal(&mut cursor)?;
            if !code.contains_segment(pc.segment) {
                code.restore_segments(view, std::collections::BTreeSet::from([pc.segment]))?;
            }
            Value::CodePoint(code.code_point(pc)?)
        }
        _ if (TAG_TUPLE..=TAG_TUPLE + MAX_TUPLE_SIZE as u8).contains(&tag) => {
            let len = usize::from(tag - TAG_TUPLE);
            let mut children = Vec::with_capacity(len);
            for _ in 0..len {
                let slot_tag = take_u8(&mut cursor)?;
                if slot_tag != TAG_HASH_ONLY {
                    return Err(CoreError::corruption(format!(
                        "stored tuple child slot has tag {slot_tag:#04x}, expected hash-only"
                    )));
                }
                let child_hash = take_h256(&mut cursor)?;
                children.push(get_value(view, child_hash, code, cache)?);
            }
            Value::Tuple(Tuple::new(children)?)
        }
        other => return Err(CoreError::UnknownValueTag(other)),
    };

    cache.insert(hash, value.clone());
    Ok(value)
}

/// Save a tuple without wrapping it in a [`Value`] first. Same semantics as
/// [`save_value`]; used for the machine stacks, which are tuples by
/// construction.
pub fn save_tuple(tx: &mut WriteTx<'_>, tuple: &Tuple) -> Result<H256> {
    let hash = tuple.hash();
    if let Some(record) = tx.get(Column::Value, hash.as_bytes()) {
        let (refcount, body) = split_record(&record)?;
        write_record(tx, &hash, refcount + 1, body);
        return Ok(hash);
    }
    for child in tuple.children() {
        save_value(tx, child)?;
    }
    let mut body = Vec::new();
    tuple.marshal_shallow(&mut body);
    write_record(tx, &hash, 1, &body);
    Ok(hash)
}

/// Drop one reference to `hash`. At zero, child references are dropped
/// recursively and the record is removed.
pub fn delete_value(tx: &mut WriteTx<'_>, hash: H256) -> Result<()> {
    let record = tx
        .get(Column::Value, hash.as_bytes())
        .ok_or(CoreError::NotFound)?;
    let (refcount, body) = split_record(&record)?;
    if refcount > 1 {
        write_record(tx, &hash, refcount - 1, body);
        return Ok(());
    }

    let mut cursor = body;
    let tag = take_u8(&mut cursor)?;
    if (TAG_TUPLE..=TAG_TUPLE + MAX_TUPLE_SIZE as u8).contains(&tag) {
        let len = usize::from(tag - TAG_TUPLE);
        for _ in 0..len {
            let slot_tag = take_u8(&mut cursor)?;
            if slot_tag != TAG_HASH_ONLY {
                return Err(CoreError::corruption(format!(
                    "stored tuple child slot has tag {slot_tag:#04x}, expected hash-only"
                )));
            }
            let child_hash = take_h256(&mut cursor)?;
            delete_value(tx, child_hash)?;
        }
    }
    tx.delete(Column::Value, hash.as_bytes());
    Ok(())
}

/// Current refcount of `hash`, zero when absent. Test and audit helper.
pub fn refcount(view: &impl ReadView, hash: &H256) -> Result<u64> {
    match view.get(Column::Value, hash.as_bytes()) {
        Some(record) => Ok(split_record(&record)?.0),
        None => Ok(0),
    }
}

fn split_record(record: &[u8]) -> Result<(u64, &[u8])> {
    let mut cursor = record;
    let refcount = take_u64(&mut cursor)?;
    Ok((refcount, cursor))
}

fn write_record(tx: &mut WriteTx<'_>, hash: &H256, refcount: u64, body: &[u8]) {
    let mut record = Vec::with_capacity(8 + body.len());
    put_u64(&mut record, refcount);
    record.extend_from_slice(body);
    tx.put(Column::Value, hash.as_bytes(), record);
}

#[cfg(test)]
mod tests {
    use avmcore_kv::KvStore;
    use avmcore_types::{Opcode, Operation};

    use super::*;

    fn nested_tuple() -> Value {
        let inner = Tuple::new(vec![Value::from(1u64), Value::from(2u64)]).unwrap();
        Value::Tuple(Tuple::new(vec![Value::from(3u64), Value::Tuple(inner)]).unwrap())
    }

    #[test]
    fn save_get_round_trip() {
        let kv = KvStore::new();
        let code = CodeStore::new();
        let mut cache = ValueCache::new(2);
        let value = nested_tuple();

        let mut tx = kv.begin();
        let hash = save_value(&mut tx, &value).unwrap();
        tx.commit();

        let loaded = get_value(&kv.snapshot(), hash, &code, &mut cache).unwrap();
        assert_eq!(loaded, value);
        // Second read hits the cache.
        assert_eq!(cache.get(&hash), Some(value));
    }

    #[test]
    fn children_are_shared_by_hash() {
        let kv = KvStore::new();
        let shared = Value::from(7u64);
        let a = Value::Tuple(Tuple::new(vec![shared.clone()]).unwrap());
        let b = Value::Tuple(Tuple::new(vec![shared.clone(), shared.clone()]).unwrap());

        let mut tx = kv.begin();
        save_value(&mut tx, &a).unwrap();
        save_value(&mut tx, &b).unwrap();
        tx.commit();

        // One reference from `a`, two from `b`.
        assert_eq!(refcount(&kv.snapshot(), &shared.hash()).unwrap(), 3);
    }

    #[test]
    fn delete_drops_children_at_zero() {
        let kv = KvStore::new();
        let code = CodeStore::new();
        let value = nested_tuple();
        let child = Value::from(1u64);

        let mut tx = kv.begin();
        let hash = save_value(&mut tx, &value).unwrap();
        save_value(&mut tx, &value).unwrap(); // refcount 2
        tx.commit();

        let mut tx = kv.begin();
        delete_value(&mut tx, hash).unwrap();
        tx.commit();
        // Still reachable: one reference remains.
        let mut cache = ValueCache::new(1);
        assert!(get_value(&kv.snapshot(), hash, &code, &mut cache).is_ok());

        let mut tx = kv.begin();
        delete_value(&mut tx, hash).unwrap();
        tx.commit();
        let snap = kv.snapshot();
        assert_eq!(refcount(&snap, &hash).unwrap(), 0);
        assert_eq!(refcount(&snap, &child.hash()).unwrap(), 0);
    }

    #[test]
    fn code_points_resolve_through_code_store() {
        let kv = KvStore::new();
        let code = CodeStore::new();
        let mut tx = kv.begin();
        let id = code
            .add_segment(
                &mut tx,
                vec![Operation::new(Opcode::NOP), Operation::new(Opcode::HALT)],
            )
            .unwrap();
        let cp = code.segment(id).unwrap().points()[1].clone();
        let hash = save_value(&mut tx, &Value::CodePoint(cp.clone())).unwrap();
        tx.commit();

        // A store that has not loaded the segment yet must restore it
        // transitively during the read.
        let fresh_code = CodeStore::new();
        let mut cache = ValueCache::new(1);
        let loaded = get_value(&kv.snapshot(), hash, &fresh_code, &mut cache).unwrap();
        assert_eq!(loaded, Value::CodePoint(cp));
        assert!(fresh_code.contains_segment(id));
    }

    #[test]
    fn delete_missing_is_not_found() {
        let kv = KvStore::new();
        let mut tx = kv.begin();
        assert!(matches!(
            delete_value(&mut tx, H256::repeat_byte(9)),
            Err(CoreError::NotFound)
        ));
    }
}
