//! Compact difficulty targets ("bits")
//!
//! A compact target is a base-256 floating point number: the top byte is
//! the size in bytes, the low 23 bits the mantissa and bit 23 a sign flag.

use crate::hash::Hash;
use dashu_int::ops::BitTest;
use dashu_int::UBig;

/// Expanded form of a compact target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactTarget {
    pub value: UBig,
    pub negative: bool,
    pub overflow: bool,
}

impl CompactTarget {
    /// A usable target is positive and does not overflow 256 bits
    pub fn is_valid(&self) -> bool {
        !self.negative && !self.overflow && self.value != UBig::ZERO
    }
}

/// Expand compact bits
pub fn from_compact(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        UBig::from(word)
    } else {
        UBig::from(word) << (8 * (size as usize - 3))
    };

    let negative = word != 0 && (bits & 0x0080_0000) != 0;
    let overflow =
        word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));

    CompactTarget {
        value,
        negative,
        overflow,
    }
}

/// Compress a (non-negative) target to compact bits
pub fn to_compact(value: &UBig) -> u32 {
    let mut size = value.bit_len().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        low_u32(value) << (8 * (3 - size))
    } else {
        low_u32(&(value >> (8 * (size as usize - 3))))
    };

    // The mantissa sign bit must stay clear
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Interpret a hash as a little-endian 256-bit unsigned number
pub fn hash_to_ubig(hash: &Hash<32>) -> UBig {
    UBig::from_le_bytes(hash.as_ref())
}

/// Proof-of-work check: the target must be valid and not above `pow_limit`,
/// and the hash must not exceed the target
pub fn check_proof_of_work(hash: &Hash<32>, bits: u32, pow_limit: &UBig) -> bool {
    let target = from_compact(bits);
    if !target.is_valid() || target.value > *pow_limit {
        return false;
    }
    hash_to_ubig(hash) <= target.value
}

fn low_u32(value: &UBig) -> u32 {
    let bytes = value.to_le_bytes();
    let mut low = [0u8; 4];
    let n = bytes.len().min(4);
    low[..n].copy_from_slice(&bytes[..n]);
    u32::from_le_bytes(low)
}
