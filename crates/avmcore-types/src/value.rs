//! The three value kinds, their canonical hashes, and the deep/shallow
//! marshal forms.
//!
//! Two byte forms exist for every value:
//!
//! - **deep**: children are encoded inline, recursively. This is the
//!   self-contained form used for code segment immediates and tests.
//! - **shallow**: each tuple child slot is replaced by a `HASH_ONLY` tag and
//!   the child's 32-byte hash; a code point's immediate is likewise replaced
//!   by its hash. This is the form the content-addressed value store writes,
//!   and the form the canonical hash is computed over.
//!
//! Values are owned trees. Structural sharing happens only inside the value
//! store, keyed by hash; the tree itself never carries shared ownership.

use std::fmt;

use avmcore_error::{CoreError, Result};
use ethereum_types::{H256, U256};
use keccak_hash::keccak;

use crate::codec::{put_h256, put_u256, put_u64, take_h256, take_u256, take_u64, take_u8};
use crate::opcode::Opcode;

/// Type tag for a 256-bit integer.
pub const TAG_NUM: u8 = 0;
/// Type tag for a code point.
pub const TAG_CODEPT: u8 = 1;
/// Type tag for a hash-only child slot in a shallow form.
pub const TAG_HASH_ONLY: u8 = 2;
/// Base type tag for tuples; the encoded tag is `TAG_TUPLE + len`.
pub const TAG_TUPLE: u8 = 3;
/// Tuples hold at most eight children.
pub const MAX_TUPLE_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// An opcode plus an optional immediate value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub opcode: Opcode,
    pub immediate: Option<Box<Value>>,
}

impl Operation {
    /// An operation with no immediate.
    #[must_use]
    pub const fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            immediate: None,
        }
    }

    /// An operation carrying an immediate value.
    #[must_use]
    pub fn with_immediate(opcode: Opcode, immediate: Value) -> Self {
        Self {
            opcode,
            immediate: Some(Box::new(immediate)),
        }
    }

    /// Deep form: `[imm_flag][opcode]` then the immediate's deep form.
    pub fn marshal_deep(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(self.immediate.is_some()));
        buf.push(self.opcode.get());
        if let Some(imm) = &self.immediate {
            imm.marshal_deep(buf);
        }
    }

    /// Shallow form: `[imm_flag][opcode]` then `HASH_ONLY || hash(imm)`.
    pub fn marshal_shallow(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(self.immediate.is_some()));
        buf.push(self.opcode.get());
        if let Some(imm) = &self.immediate {
            buf.push(TAG_HASH_ONLY);
            put_h256(buf, &imm.hash());
        }
    }

    /// Parse the deep form.
    pub fn unmarshal_deep(buf: &mut &[u8]) -> Result<Self> {
        let imm_flag = take_u8(buf)?;
        let opcode = Opcode::from(take_u8(buf)?);
        let immediate = match imm_flag {
            0 => None,
            1 => Some(Box::new(Value::unmarshal_deep(buf)?)),
            other => {
                return Err(CoreError::corruption(format!(
                    "operation immediate flag must be 0 or 1, got {other}"
                )))
            }
        };
        Ok(Self { opcode, immediate })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.immediate {
            Some(imm) => write!(f, "{}[{imm}]", self.opcode),
            None => write!(f, "{}", self.opcode),
        }
    }
}

// ---------------------------------------------------------------------------
// CodePoint
// ---------------------------------------------------------------------------

/// Position of a code point: an immutable segment plus an offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodePointRef {
    pub segment: u64,
    pub offset: u64,
}

impl CodePointRef {
    #[must_use]
    pub const fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }

    /// The conventional null position, used for an unset error handler.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            segment: 0,
            offset: 0,
        }
    }

    /// Serialize as `be8(segment) || be8(offset)`.
    pub fn marshal(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.segment);
        put_u64(buf, self.offset);
    }

    pub fn unmarshal(buf: &mut &[u8]) -> Result<Self> {
        let segment = take_u64(buf)?;
        let offset = take_u64(buf)?;
        Ok(Self { segment, offset })
    }
}

impl fmt::Display for CodePointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// One instruction in a code segment.
///
/// `next_hash` commits to the remainder of the segment: the final code point
/// of a segment has a zero `next_hash`, and every earlier one hashes its
/// successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodePoint {
    pub pc: CodePointRef,
    pub op: Operation,
    pub next_hash: H256,
}

impl CodePoint {
    #[must_use]
    pub fn new(pc: CodePointRef, op: Operation, next_hash: H256) -> Self {
        Self { pc, op, next_hash }
    }

    /// Canonical hash: keccak-256 of the shallow form. The position is
    /// deliberately excluded; two segments with identical code hash alike.
    #[must_use]
    pub fn hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(67);
        self.marshal_shallow(&mut buf);
        keccak(&buf)
    }

    /// Shallow form: `[CODEPT][op shallow][next_hash]`.
    pub fn marshal_shallow(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_CODEPT);
        self.op.marshal_shallow(buf);
        put_h256(buf, &self.next_hash);
    }

    /// Deep form: `[CODEPT][pc][op deep][next_hash]`.
    pub fn marshal_deep(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_CODEPT);
        self.pc.marshal(buf);
        self.op.marshal_deep(buf);
        put_h256(buf, &self.next_hash);
    }

    /// Parse the deep body (the `CODEPT` tag already consumed).
    pub fn unmarshal_deep_body(buf: &mut &[u8]) -> Result<Self> {
        let pc = CodePointRef::unmarshal(buf)?;
        let op = Operation::unmarshal_deep(buf)?;
        let next_hash = take_h256(buf)?;
        Ok(Self { pc, op, next_hash })
    }
}

impl fmt::Display for CodePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodePoint({}, {}, {:?})", self.pc, self.op, self.next_hash)
    }
}

// ---------------------------------------------------------------------------
// Tuple
// ---------------------------------------------------------------------------

/// An immutable ordered sequence of zero to eight values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple(Vec<Value>);

impl Tuple {
    /// Build a tuple, rejecting more than [`MAX_TUPLE_SIZE`] children.
    pub fn new(children: Vec<Value>) -> Result<Self> {
        if children.len() > MAX_TUPLE_SIZE {
            return Err(CoreError::InvalidArgument(format!(
                "tuple size {} exceeds maximum {MAX_TUPLE_SIZE}",
                children.len()
            )));
        }
        Ok(Self(children))
    }

    /// The empty tuple.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Child at `index`, or `BadTupleIndex`.
    pub fn get(&self, index: usize) -> Result<&Value> {
        self.0.get(index).ok_or(CoreError::BadTupleIndex {
            index,
            size: self.0.len(),
        })
    }

    #[must_use]
    pub fn children(&self) -> &[Value] {
        &self.0
    }

    #[must_use]
    pub fn into_children(self) -> Vec<Value> {
        self.0
    }

    /// Canonical hash: keccak-256 of the shallow form, which depends only on
    /// the child hashes.
    #[must_use]
    pub fn hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(1 + self.0.len() * 33);
        self.marshal_shallow(&mut buf);
        keccak(&buf)
    }

    /// Shallow form: `[TUPLE + n]` then per child `[HASH_ONLY][child hash]`.
    pub fn marshal_shallow(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_TUPLE + self.0.len() as u8);
        for child in &self.0 {
            buf.push(TAG_HASH_ONLY);
            put_h256(buf, &child.hash());
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tuple(")?;
        for (i, child) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{child}")?;
        }
        f.write_str(")")
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A machine value: integer, code point, or tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(U256),
    CodePoint(CodePoint),
    Tuple(Tuple),
}

impl Value {
    /// The kind name, used in type-mismatch errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::CodePoint(_) => "codepoint",
            Self::Tuple(_) => "tuple",
        }
    }

    /// Extract an integer, or `BadPopType`.
    pub fn as_int(&self) -> Result<&U256> {
        match self {
            Self::Int(v) => Ok(v),
            other => Err(CoreError::BadPopType {
                expected: "int",
                actual: other.kind(),
            }),
        }
    }

    /// Extract a tuple, or `BadPopType`.
    pub fn as_tuple(&self) -> Result<&Tuple> {
        match self {
            Self::Tuple(t) => Ok(t),
            other => Err(CoreError::BadPopType {
                expected: "tuple",
                actual: other.kind(),
            }),
        }
    }

    /// Extract a code point, or `BadPopType`.
    pub fn as_code_point(&self) -> Result<&CodePoint> {
        match self {
            Self::CodePoint(cp) => Ok(cp),
            other => Err(CoreError::BadPopType {
                expected: "codepoint",
                actual: other.kind(),
            }),
        }
    }

    /// Canonical 256-bit hash.
    ///
    /// Integers hash their deep form (`NUM || be32`); tuples and code points
    /// hash their shallow forms, so a tuple's hash depends only on its
    /// children's hashes.
    #[must_use]
    pub fn hash(&self) -> H256 {
        match self {
            Self::Int(v) => {
                let mut buf = Vec::with_capacity(33);
                buf.push(TAG_NUM);
                put_u256(&mut buf, v);
                keccak(&buf)
            }
            Self::CodePoint(cp) => cp.hash(),
            Self::Tuple(t) => t.hash(),
        }
    }

    /// Deep form: children inline, recursively.
    pub fn marshal_deep(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Int(v) => {
                buf.push(TAG_NUM);
                put_u256(buf, v);
            }
            Self::CodePoint(cp) => cp.marshal_deep(buf),
            Self::Tuple(t) => {
                buf.push(TAG_TUPLE + t.len() as u8);
                for child in t.children() {
                    child.marshal_deep(buf);
                }
            }
        }
    }

    /// Shallow form: tuple children and code point immediates by hash.
    pub fn marshal_shallow(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Int(v) => {
                buf.push(TAG_NUM);
                put_u256(buf, v);
            }
            Self::CodePoint(cp) => cp.marshal_shallow(buf),
            Self::Tuple(t) => t.marshal_shallow(buf),
        }
    }

    /// Parse the deep form. `HASH_ONLY` tags are rejected here: a deep form
    /// is self-contained by definition, so a hash slot means the caller
    /// handed over a shallow body.
    pub fn unmarshal_deep(buf: &mut &[u8]) -> Result<Self> {
        let tag = take_u8(buf)?;
        match tag {
            TAG_NUM => Ok(Self::Int(take_u256(buf)?)),
            TAG_CODEPT => Ok(Self::CodePoint(CodePoint::unmarshal_deep_body(buf)?)),
            _ if (TAG_TUPLE..=TAG_TUPLE + MAX_TUPLE_SIZE as u8).contains(&tag) => {
                let len = usize::from(tag - TAG_TUPLE);
                let mut children = Vec::with_capacity(len);
                for _ in 0..len {
                    children.push(Self::unmarshal_deep(buf)?);
                }
                Ok(Self::Tuple(Tuple::new(children)?))
            }
            other => Err(CoreError::UnknownValueTag(other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::CodePoint(cp) => write!(f, "{cp}"),
            Self::Tuple(t) => write!(f, "{t}"),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Int(U256::from(v))
    }
}

impl From<U256> for Value {
    fn from(v: U256) -> Self {
        Self::Int(v)
    }
}

impl From<Tuple> for Value {
    fn from(t: Tuple) -> Self {
        Self::Tuple(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::take_bytes;

    fn sample_code_point() -> CodePoint {
        CodePoint::new(
            CodePointRef::new(1, 4),
            Operation::with_immediate(Opcode::ADD, Value::from(7u64)),
            H256::repeat_byte(0xaa),
        )
    }

    fn sample_tuple() -> Tuple {
        Tuple::new(vec![
            Value::from(1u64),
            Value::Tuple(Tuple::empty()),
            Value::CodePoint(sample_code_point()),
        ])
        .unwrap()
    }

    #[test]
    fn int_hash_is_keccak_of_tagged_be_bytes() {
        let v = Value::from(42u64);
        let mut expected = vec![TAG_NUM];
        expected.extend_from_slice(&{
            let mut raw = [0u8; 32];
            U256::from(42u64).to_big_endian(&mut raw);
            raw
        });
        assert_eq!(v.hash(), keccak(&expected));
    }

    #[test]
    fn tuple_hash_is_keccak_of_shallow_form() {
        let t = sample_tuple();
        let mut shallow = Vec::new();
        t.marshal_shallow(&mut shallow);
        assert_eq!(t.hash(), keccak(&shallow));
    }

    #[test]
    fn tuple_shallow_form_embeds_child_hashes() {
        let t = sample_tuple();
        let mut shallow = Vec::new();
        t.marshal_shallow(&mut shallow);
        let mut cursor = shallow.as_slice();
        assert_eq!(take_u8(&mut cursor).unwrap(), TAG_TUPLE + 3);
        for child in t.children() {
            assert_eq!(take_u8(&mut cursor).unwrap(), TAG_HASH_ONLY);
            assert_eq!(take_h256(&mut cursor).unwrap(), child.hash());
        }
        assert!(cursor.is_empty());
    }

    #[test]
    fn tuple_hash_depends_only_on_child_hashes() {
        // Two structurally different children with different bodies but
        // placed in tuples alongside identical siblings: replacing a child
        // with an equal-hash child (itself) must not change the hash, and
        // replacing it with a different child must.
        let a = Tuple::new(vec![Value::from(1u64), Value::from(2u64)]).unwrap();
        let b = Tuple::new(vec![Value::from(1u64), Value::from(2u64)]).unwrap();
        let c = Tuple::new(vec![Value::from(1u64), Value::from(3u64)]).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn code_point_hash_ignores_position() {
        let mut a = sample_code_point();
        let mut b = sample_code_point();
        a.pc = CodePointRef::new(1, 4);
        b.pc = CodePointRef::new(9, 0);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn deep_round_trip() {
        let v = Value::Tuple(sample_tuple());
        let mut buf = Vec::new();
        v.marshal_deep(&mut buf);
        let mut cursor = buf.as_slice();
        let parsed = Value::unmarshal_deep(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        assert_eq!(parsed, v);
        assert_eq!(parsed.hash(), v.hash());
    }

    #[test]
    fn deep_parse_rejects_hash_only_tag() {
        let mut buf = vec![TAG_HASH_ONLY];
        buf.extend_from_slice(&[0u8; 32]);
        let mut cursor = buf.as_slice();
        assert!(matches!(
            Value::unmarshal_deep(&mut cursor),
            Err(CoreError::UnknownValueTag(TAG_HASH_ONLY))
        ));
    }

    #[test]
    fn deep_parse_rejects_truncation() {
        let v = Value::Tuple(sample_tuple());
        let mut buf = Vec::new();
        v.marshal_deep(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut cursor = buf.as_slice();
        assert!(matches!(
            Value::unmarshal_deep(&mut cursor),
            Err(CoreError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn oversized_tuple_rejected() {
        let children = (0..9).map(Value::from).collect::<Vec<_>>();
        assert!(matches!(
            Tuple::new(children),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn accessors_enforce_kind() {
        let v = Value::from(5u64);
        assert_eq!(*v.as_int().unwrap(), U256::from(5u64));
        assert!(matches!(
            v.as_tuple(),
            Err(CoreError::BadPopType {
                expected: "tuple",
                actual: "int",
            })
        ));
    }

    #[test]
    fn take_bytes_is_exact() {
        let mut cursor: &[u8] = &[1, 2, 3, 4];
        assert_eq!(take_bytes(&mut cursor, 3).unwrap(), &[1, 2, 3]);
        assert_eq!(cursor, &[4]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        /// Strategy for an arbitrary value tree of bounded depth.
        fn arb_value() -> BoxedStrategy<Value> {
            let leaf = prop_oneof![
                any::<[u8; 32]>().prop_map(|raw| Value::Int(U256::from_big_endian(&raw))),
                (any::<u64>(), any::<u64>(), any::<u8>(), any::<[u8; 32]>()).prop_map(
                    |(segment, offset, opcode, next)| {
                        Value::CodePoint(CodePoint::new(
                            CodePointRef::new(segment, offset),
                            Operation::new(Opcode::from(opcode)),
                            H256::from_slice(&next),
                        ))
                    }
                ),
            ];
            leaf.prop_recursive(3, 24, MAX_TUPLE_SIZE as u32, |inner| {
                proptest::collection::vec(inner, 0..=MAX_TUPLE_SIZE)
                    .prop_map(|children| Value::Tuple(Tuple::new(children).unwrap()))
            })
            .boxed()
        }

        proptest! {
            #[test]
            fn deep_marshal_round_trips(v in arb_value()) {
                let mut buf = Vec::new();
                v.marshal_deep(&mut buf);
                let mut cursor = buf.as_slice();
                let parsed = Value::unmarshal_deep(&mut cursor).unwrap();
                prop_assert!(cursor.is_empty());
                prop_assert_eq!(&parsed, &v);
                prop_assert_eq!(parsed.hash(), v.hash());
            }

            #[test]
            fn shallow_form_of_int_equals_deep(raw in any::<[u8; 32]>()) {
                let v = Value::Int(U256::from_big_endian(&raw));
                let mut deep = Vec::new();
                let mut shallow = Vec::new();
                v.marshal_deep(&mut deep);
                v.marshal_shallow(&mut shallow);
                prop_assert_eq!(deep, shallow);
            }
        }
    }
}
