//! Canonical value model for the AVM execution core.
//!
//! A [`Value`] is one of exactly three kinds: a 256-bit unsigned integer, a
//! code point, or a tuple of up to eight child values. Every value has a
//! canonical keccak-256 hash over its *shallow* byte form, and equality is
//! hash equality. The byte forms are bit-exact wire formats: any deviation
//! breaks compatibility with previously written databases.

pub mod codec;
pub mod opcode;
pub mod value;

pub use opcode::Opcode;
pub use value::{
    CodePoint, CodePointRef, Operation, Tuple, Value, MAX_TUPLE_SIZE, TAG_CODEPT, TAG_HASH_ONLY,
    TAG_NUM, TAG_TUPLE,
};

pub use ethereum_types::{H256, U256};
