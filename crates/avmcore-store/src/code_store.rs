//! Append-only code segments, referenced by `segment_id` plus offset.
//!
//! Segments are immutable once published. The in-memory map is shared
//! between the host and readers; restoring a segment that is already loaded
//! is a no-op. Fresh segment ids come from a monotonic counter persisted in
//! the `code` column family under a one-byte key (segment keys are eight
//! bytes, so the two can never collide).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use avmcore_error::{CoreError, Result};
use avmcore_kv::{Column, ReadView, WriteTx};
use avmcore_types::codec::{put_u64, take_u64};
use avmcore_types::{CodePoint, CodePointRef, Operation, Value, H256};
use parking_lot::RwLock;
use tracing::debug;

/// Key of the persisted `next_segment_id` counter.
const NEXT_SEGMENT_ID_KEY: [u8; 1] = [0x00];

fn segment_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// An immutable, fully linked sequence of code points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSegment {
    id: u64,
    points: Vec<CodePoint>,
}

impl CodeSegment {
    /// Assemble a segment from operations, rebuilding the `next_hash` chain:
    /// the final code point's `next_hash` is zero and each earlier one
    /// hashes its successor.
    #[must_use]
    pub fn assemble(id: u64, ops: Vec<Operation>) -> Self {
        let mut points: Vec<CodePoint> = Vec::with_capacity(ops.len());
        let mut next_hash = H256::zero();
        for (offset, op) in ops.into_iter().enumerate().rev() {
            let cp = CodePoint::new(CodePointRef::new(id, offset as u64), op, next_hash);
            next_hash = cp.hash();
            points.push(cp);
        }
        points.reverse();
        Self { id, points }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn points(&self) -> &[CodePoint] {
        &self.points
    }

    /// Segment ids referenced by code-point immediates, which must be
    /// loaded alongside this segment.
    fn referenced_segments(&self) -> BTreeSet<u64> {
        fn walk(value: &Value, out: &mut BTreeSet<u64>) {
            match value {
                Value::CodePoint(cp) => {
                    out.insert(cp.pc.segment);
                    if let Some(imm) = &cp.op.immediate {
                        walk(imm, out);
                    }
                }
                Value::Tuple(t) => {
                    for child in t.children() {
                        walk(child, out);
                    }
                }
                Value::Int(_) => {}
            }
        }
        let mut out = BTreeSet::new();
        for point in &self.points {
            if let Some(imm) = &point.op.immediate {
                walk(imm, &mut out);
            }
        }
        out
    }

    /// Serialized form: `be8(op_count)` then each operation's deep form.
    fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u64(&mut buf, self.points.len() as u64);
        for point in &self.points {
            point.op.marshal_deep(&mut buf);
        }
        buf
    }

    fn unmarshal(id: u64, mut body: &[u8]) -> Result<Self> {
        let count = take_u64(&mut body)?;
        let mut ops = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ops.push(Operation::unmarshal_deep(&mut body)?);
        }
        if !body.is_empty() {
            return Err(CoreError::corruption(format!(
                "code segment {id} has {} trailing bytes",
                body.len()
            )));
        }
        Ok(Self::assemble(id, ops))
    }
}

/// Shared owner of all in-memory code segments.
#[derive(Default)]
pub struct CodeStore {
    segments: RwLock<HashMap<u64, Arc<CodeSegment>>>,
}

impl CodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) presence check.
    #[must_use]
    pub fn contains_segment(&self, id: u64) -> bool {
        self.segments.read().contains_key(&id)
    }

    #[must_use]
    pub fn segment(&self, id: u64) -> Option<Arc<CodeSegment>> {
        self.segments.read().get(&id).cloned()
    }

    /// Insert a restored segment unless one is already loaded. Idempotent:
    /// segments are immutable, so the existing copy is always equivalent.
    pub fn restore_existing_segment(&self, segment: CodeSegment) {
        let mut segments = self.segments.write();
        segments.entry(segment.id).or_insert_with(|| {
            debug!(segment = segment.id, points = segment.points.len(), "restored code segment");
            Arc::new(segment)
        });
    }

    /// The code point at `pc`.
    pub fn code_point(&self, pc: CodePointRef) -> Result<CodePoint> {
        let segments = self.segments.read();
        let segment = segments
            .get(&pc.segment)
            .ok_or_else(|| CoreError::corruption(format!("code segment {} not loaded", pc.segment)))?;
        segment
            .points
            .get(pc.offset as usize)
            .cloned()
            .ok_or_else(|| {
                CoreError::corruption(format!(
                    "code point {pc} out of range (segment has {} points)",
                    segment.points.len()
                ))
            })
    }

    /// Publish a fresh segment: allocate the next id from the persisted
    /// counter, write the segment record, and install it in memory.
    pub fn add_segment(&self, tx: &mut WriteTx<'_>, ops: Vec<Operation>) -> Result<u64> {
        let id = next_segment_id(tx)?;
        let mut counter = Vec::with_capacity(8);
        put_u64(&mut counter, id + 1);
        tx.put(Column::Code, NEXT_SEGMENT_ID_KEY.to_vec(), counter);

        let segment = CodeSegment::assemble(id, ops);
        tx.put(Column::Code, segment_key(id).to_vec(), segment.marshal());
        self.segments.write().insert(id, Arc::new(segment));
        Ok(id)
    }

    /// Load `roots` and every segment they reference, transitively, skipping
    /// anything already in memory.
    pub fn restore_segments(&self, view: &impl ReadView, roots: BTreeSet<u64>) -> Result<()> {
        let mut wanted = roots;
        while !wanted.is_empty() {
            let mut next = BTreeSet::new();
            // Load highest ids first: later segments may reference earlier
            // ones but never the reverse.
            for id in wanted.iter().rev() {
                if self.contains_segment(*id) {
                    continue;
                }
                let segment = load_segment(view, *id)?;
                next.extend(
                    segment
                        .referenced_segments()
                        .into_iter()
                        .filter(|dep| !self.contains_segment(*dep)),
                );
                self.restore_existing_segment(segment);
            }
            wanted = next;
        }
        Ok(())
    }
}

/// Read one segment record.
pub fn load_segment(view: &impl ReadView, id: u64) -> Result<CodeSegment> {
    let body = view
        .get(Column::Code, &segment_key(id))
        .ok_or(CoreError::NotFound)?;
    CodeSegment::unmarshal(id, &body)
}

/// The persisted segment-id counter (zero when never written).
pub fn next_segment_id(view: &impl ReadView) -> Result<u64> {
    match view.get(Column::Code, &NEXT_SEGMENT_ID_KEY) {
        Some(raw) => take_u64(&mut raw.as_slice()),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use avmcore_kv::KvStore;
    use avmcore_types::Opcode;

    use super::*;

    fn ops(n: usize) -> Vec<Operation> {
        (0..n).map(|_| Operation::new(Opcode::NOP)).collect()
    }

    #[test]
    fn assemble_links_next_hashes() {
        let segment = CodeSegment::assemble(0, ops(3));
        assert_eq!(segment.points[2].next_hash, H256::zero());
        assert_eq!(segment.points[1].next_hash, segment.points[2].hash());
        assert_eq!(segment.points[0].next_hash, segment.points[1].hash());
        assert_eq!(segment.points[1].pc, CodePointRef::new(0, 1));
    }

    #[test]
    fn add_segment_allocates_monotonic_ids() {
        let kv = KvStore::new();
        let code = CodeStore::new();

        let mut tx = kv.begin();
        let a = code.add_segment(&mut tx, ops(2)).unwrap();
        let b = code.add_segment(&mut tx, ops(1)).unwrap();
        tx.commit();

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(next_segment_id(&kv.snapshot()).unwrap(), 2);
    }

    #[test]
    fn restore_round_trips_segment() {
        let kv = KvStore::new();
        let code = CodeStore::new();
        let mut tx = kv.begin();
        let id = code
            .add_segment(
                &mut tx,
                vec![
                    Operation::with_immediate(Opcode::ADD, Value::from(7u64)),
                    Operation::new(Opcode::HALT),
                ],
            )
            .unwrap();
        tx.commit();

        let fresh = CodeStore::new();
        fresh
            .restore_segments(&kv.snapshot(), BTreeSet::from([id]))
            .unwrap();
        assert_eq!(
            fresh.segment(id).unwrap().points(),
            code.segment(id).unwrap().points()
        );
    }

    #[test]
    fn restore_follows_immediate_references() {
        let kv = KvStore::new();
        let code = CodeStore::new();
        let mut tx = kv.begin();
        let inner = code.add_segment(&mut tx, ops(1)).unwrap();
        let entry = code.segment(inner).unwrap().points()[0].clone();
        let outer = code
            .add_segment(
                &mut tx,
                vec![Operation::with_immediate(
                    Opcode::NOP,
                    Value::CodePoint(entry),
                )],
            )
            .unwrap();
        tx.commit();

        let fresh = CodeStore::new();
        fresh
            .restore_segments(&kv.snapshot(), BTreeSet::from([outer]))
            .unwrap();
        assert!(fresh.contains_segment(inner));
        assert!(fresh.contains_segment(outer));
    }

    #[test]
    fn restore_existing_is_idempotent() {
        let code = CodeStore::new();
        let segment = CodeSegment::assemble(5, ops(1));
        code.restore_existing_segment(segment.clone());
        code.restore_existing_segment(segment);
        assert!(code.contains_segment(5));
    }

    #[test]
    fn code_point_out_of_range_is_corruption() {
        let code = CodeStore::new();
        code.restore_existing_segment(CodeSegment::assemble(0, ops(1)));
        assert!(code.code_point(CodePointRef::new(0, 0)).is_ok());
        assert!(matches!(
            code.code_point(CodePointRef::new(0, 9)),
            Err(CoreError::Corruption(_))
        ));
    }
}
