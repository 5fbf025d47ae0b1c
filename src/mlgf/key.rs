use crate::error::{Error, Result};

/// Number of significant bits in a hash value.
pub(crate) const HASH_BITS: u8 = 32;

/// Maximum number of dimensions of one index.
pub const MAX_KEYS: usize = 16;

/// Which end of its region a directory entry records for a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    /// The smallest hash value stored below the entry.
    Min,
    /// The largest hash value stored below the entry.
    Max,
}

/// Describes the dimensions of a multidimensional index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDesc {
    extremes: Vec<Extreme>,
}

impl KeyDesc {
    pub fn new(extremes: Vec<Extreme>) -> Result<Self> {
        if extremes.is_empty() || extremes.len() > MAX_KEYS {
            return Err(Error::bad_parameter(format!(
                "an index needs 1 to {MAX_KEYS} dimensions, got {}",
                extremes.len()
            )));
        }
        Ok(Self { extremes })
    }

    /// A descriptor recording the minimum on every dimension.
    pub fn all_min(n_keys: usize) -> Result<Self> {
        Self::new(vec![Extreme::Min; n_keys])
    }

    pub fn n_keys(&self) -> usize {
        self.extremes.len()
    }

    pub fn extreme(&self, dim: usize) -> Extreme {
        self.extremes[dim]
    }

    pub(crate) fn check(&self, kval: &[u32]) -> Result<()> {
        if kval.len() != self.n_keys() {
            return Err(Error::bad_parameter(format!(
                "key has {} values, the index has {} dimensions",
                kval.len(),
                self.n_keys()
            )));
        }
        Ok(())
    }
}

/// Keeps the upper `bits` bits of `hash`.
#[inline]
pub(crate) fn mask_upper(hash: u32, bits: u8) -> u32 {
    hash & !low_bits(bits)
}

/// All the bits below the upper `bits` bits.
#[inline]
pub(crate) fn low_bits(bits: u8) -> u32 {
    if bits >= HASH_BITS {
        0
    } else {
        u32::MAX >> bits
    }
}

/// The bit right below the upper `bits` bits. `bits` must be below `HASH_BITS`.
#[inline]
pub(crate) fn next_bit(bits: u8) -> u32 {
    1 << (HASH_BITS - 1 - bits)
}

/// Inclusive range of hash values of the region whose prefix is the upper `bits` bits of
/// `hash`.
#[inline]
pub(crate) fn region(hash: u32, bits: u8) -> (u32, u32) {
    let low = mask_upper(hash, bits);
    (low, low | low_bits(bits))
}
