//! Fixed, little-endian wire types for the ownership exchanges.
//!
//! Every record is `bytemuck::Pod`, so send buffers are plain slice casts and
//! received bytes are decoded with [`decode_records`], which copies into an
//! aligned vector (received `Vec<u8>` buffers carry no alignment guarantee).

use bytemuck::{Pod, Zeroable};
use static_assertions::{const_assert_eq, assert_eq_size};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Decode a byte buffer into `T` records.
///
/// Fails when the length is not a multiple of the record size.
pub fn decode_records<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, String> {
    let sz = std::mem::size_of::<T>();
    if sz == 0 || bytes.len() % sz != 0 {
        return Err(format!(
            "payload of {} bytes is not a whole number of {sz}-byte records",
            bytes.len()
        ));
    }
    let mut out = vec![T::zeroed(); bytes.len() / sz];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
    Ok(out)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

/// Record count header sent ahead of every payload.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// A global index (vertex, cell, or claimant rank) carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireIndex {
    pub v_le: i64,
}

impl WireIndex {
    pub fn of(v: i64) -> Self {
        Self { v_le: v.to_le() }
    }
    pub fn get(&self) -> i64 {
        i64::from_le(self.v_le)
    }
}

/// `(key, value)` pair, e.g. (old global vertex index, new global index).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireIndexPair {
    pub key_le: i64,
    pub value_le: i64,
}

impl WireIndexPair {
    pub fn new(key: i64, value: i64) -> Self {
        Self {
            key_le: key.to_le(),
            value_le: value.to_le(),
        }
    }
    pub fn key(&self) -> i64 {
        i64::from_le(self.key_le)
    }
    pub fn value(&self) -> i64 {
        i64::from_le(self.value_le)
    }
}

assert_eq_size!(WireCount, u32);
assert_eq_size!(WireIndex, i64);
const_assert_eq!(std::mem::size_of::<WireIndexPair>(), 16);
