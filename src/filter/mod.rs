//! Per-table filter policies.
//!
//! A filter is built once from every distinct key in a table and stored in
//! the table file. Point lookups consult it before touching data blocks: a
//! negative answer is definitive, a positive one only means "maybe".
//!
//! The Bloom filter is a [`bloomfilter::Bloom`] whose bitmap holds
//! `bits_per_key` bits for every key, never fewer than 64 in total.
//! The serialized form carries its own bitmap size, hash count and seeds, so
//! a filter written under one `bits_per_key` stays readable under another.


use bloomfilter::Bloom;
use thiserror::Error;

use crate::DbError;

/// Filters never shrink below this many bits.
const MIN_FILTER_BITS: usize = 64;

#[derive(Debug, Error)]
pub enum FilterError {
    /// The bloom filter could not be sized or parsed.
    #[error("bloom filter: {0}")]
    Bloom(&'static str),
}

/// Probabilistic membership summary attached to each table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPolicy {
    Bloom { bits_per_key: usize },
}

impl FilterPolicy {
    pub fn bloom(bits_per_key: usize) -> Self {
        Self::Bloom { bits_per_key }
    }

    /// Stable name recorded in table properties.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bloom { .. } => "sedimentdb.BuiltinBloomFilter",
        }
    }

    pub(crate) fn validate(&self) -> Result<(), DbError> {
        match *self {
            Self::Bloom { bits_per_key } if bits_per_key == 0 || bits_per_key > 64 => Err(
                DbError::InvalidConfig("bloom bits_per_key must be in 1..=64".into()),
            ),
            Self::Bloom { .. } => Ok(()),
        }
    }

    /// Build a serialized filter over `keys`. Duplicates are harmless.
    pub fn create_filter<'a, I>(&self, keys: I, key_count: usize) -> Result<Vec<u8>, FilterError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        match *self {
            Self::Bloom { bits_per_key } => {
                let bits = key_count.saturating_mul(bits_per_key).max(MIN_FILTER_BITS);
                let mut bloom: Bloom<[u8]> =
                    Bloom::new(bits.div_ceil(8), key_count.max(1)).map_err(FilterError::Bloom)?;
                for key in keys {
                    bloom.set(key);
                }
                Ok(bloom.as_slice().to_vec())
            }
        }
    }

    /// Expected false-positive rate with the optimal hash count.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        match *self {
            Self::Bloom { bits_per_key } => 0.6185_f64.powi(bits_per_key as i32),
        }
    }
}

/// A filter loaded from a table file.
pub struct KeyFilter {
    bloom: Bloom<[u8]>,
}

impl KeyFilter {
    pub fn decode(bytes: &[u8]) -> Result<Self, FilterError> {
        let bloom = Bloom::from_slice(bytes).map_err(FilterError::Bloom)?;
        Ok(Self { bloom })
    }

    /// Returns `false` only if `key` was definitely not in the filter's
    /// key set.
    pub fn may_match(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }
}
