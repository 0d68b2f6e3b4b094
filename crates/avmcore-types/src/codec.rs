//! Cursor-style readers and writers for the fixed big-endian wire forms.
//!
//! Readers advance a `&mut &[u8]` cursor and fail with
//! [`CoreError::ShortBuffer`] instead of panicking on truncated input, so a
//! damaged record surfaces as a typed error all the way up.

use avmcore_error::{CoreError, Result};
use ethereum_types::{H256, U256};

/// Take `len` raw bytes off the front of the cursor.
pub fn take_bytes<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(CoreError::ShortBuffer {
            needed: len - buf.len(),
            remaining: buf.len(),
        });
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Take a single byte.
pub fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    Ok(take_bytes(buf, 1)?[0])
}

/// Take an 8-byte big-endian integer.
pub fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    let bytes = take_bytes(buf, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(raw))
}

/// Take a 32-byte big-endian unsigned integer.
pub fn take_u256(buf: &mut &[u8]) -> Result<U256> {
    Ok(U256::from_big_endian(take_bytes(buf, 32)?))
}

/// Take a 32-byte hash.
pub fn take_h256(buf: &mut &[u8]) -> Result<H256> {
    Ok(H256::from_slice(take_bytes(buf, 32)?))
}

/// Append an 8-byte big-endian integer.
pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Append a 32-byte big-endian unsigned integer.
pub fn put_u256(buf: &mut Vec<u8>, v: &U256) {
    let mut raw = [0u8; 32];
    v.to_big_endian(&mut raw);
    buf.extend_from_slice(&raw);
}

/// Append a 32-byte hash.
pub fn put_h256(buf: &mut Vec<u8>, h: &H256) {
    buf.extend_from_slice(h.as_bytes());
}

/// The 32-byte big-endian form of a `U256`, used directly as an ordered
/// storage key.
#[must_use]
pub fn u256_be(v: &U256) -> [u8; 32] {
    let mut raw = [0u8; 32];
    v.to_big_endian(&mut raw);
    raw
}

/// Narrow a `U256` to `u64`, failing instead of truncating.
pub fn u256_to_u64(v: &U256) -> Result<u64> {
    if *v > U256::from(u64::MAX) {
        return Err(CoreError::IntOutOfBounds);
    }
    Ok(v.low_u64())
}

/// Narrow a `U256` to `usize`, failing instead of truncating.
pub fn u256_to_usize(v: &U256) -> Result<usize> {
    usize::try_from(u256_to_u64(v)?).map_err(|_| CoreError::IntOutOfBounds)
}
